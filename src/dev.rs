//! Device abstraction.
//!
//! A worker talks to whatever feeds it packets through `PollDev`: a poll-mode
//! NIC queue, or a co-process forwarder. The trait mirrors the driver
//! surface: burst RX, burst TX with partial-send accounting, flow-rule
//! programming, and the kernel tap used to return non-accelerated frames to
//! the host stack.
//!
//! `RingDev` is the ring-backed implementation used in forwarder mode and by
//! every test: RX and TX are SPSC rings whose far ends are held by the
//! forwarder (or the test).

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::mbuf::PktBuf;
use crate::ring::Ring;

/// A 4-tuple-to-queue steering directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowSpec {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub queue_id: u16,
}

pub type FlowHandle = u64;

pub trait PollDev: Send {
    /// Fetch up to `max` frames. Returns the number appended to `out`.
    fn rx_poll(&mut self, out: &mut Vec<PktBuf>, max: usize) -> usize;

    /// Transmit a burst. The sent prefix is removed from `pkts`; the unsent
    /// tail is left in place for the caller to retry.
    fn tx_xmit(&mut self, pkts: &mut Vec<PktBuf>) -> usize;

    fn configure_flow_rule(&mut self, _spec: &FlowSpec) -> Result<FlowHandle> {
        Err(Error::Flow("not supported by this device"))
    }

    fn destroy_flow_rule(&mut self, _handle: FlowHandle) -> Result<()> {
        Err(Error::Flow("not supported by this device"))
    }

    /// Frames the host kernel wants on the wire.
    fn tap_rx_burst(&mut self, _out: &mut Vec<PktBuf>, _max: usize) -> usize {
        0
    }

    /// Hand a frame to the host kernel. Returns false (dropping the frame)
    /// when the tap is down.
    fn tap_tx_burst(&mut self, _pkt: PktBuf) -> bool {
        false
    }

    /// Service tap control requests (link up/down and friends).
    fn handle_tap_requests(&mut self) {}

    /// Combined RX+TX ring depth when the device can observe it; `None` in
    /// direct-NIC mode, where the idle governor uses its sentinel instead.
    fn queue_depth(&self) -> Option<usize> {
        None
    }
}

/// Ring-backed device: RX/TX hand-off over SPSC rings, with an optional tap
/// pair. The far ends are held by a co-process forwarder or by a test.
pub struct RingDev {
    rx: Arc<Ring<PktBuf>>,
    tx: Arc<Ring<PktBuf>>,
    tap_in: Option<Arc<Ring<PktBuf>>>,
    tap_out: Option<Arc<Ring<PktBuf>>>,
}

/// The far end of a `RingDev`: what the forwarder (or test) holds.
#[derive(Clone)]
pub struct RingDevPort {
    pub rx: Arc<Ring<PktBuf>>,
    pub tx: Arc<Ring<PktBuf>>,
    pub tap_in: Arc<Ring<PktBuf>>,
    pub tap_out: Arc<Ring<PktBuf>>,
}

impl RingDevPort {
    /// Inject a frame as if the NIC had received it.
    pub fn inject(&self, pkt: PktBuf) -> std::result::Result<(), PktBuf> {
        self.rx.push(pkt)
    }

    /// Take a frame the worker transmitted.
    pub fn take_tx(&self) -> Option<PktBuf> {
        self.tx.pop()
    }

    /// Take a frame the worker diverted to the kernel tap.
    pub fn take_tap(&self) -> Option<PktBuf> {
        self.tap_out.pop()
    }
}

impl RingDev {
    /// A device plus its far-end port.
    pub fn with_port(ring_size: usize) -> (RingDev, RingDevPort) {
        let rx = Arc::new(Ring::new(ring_size));
        let tx = Arc::new(Ring::new(ring_size));
        let tap_in = Arc::new(Ring::new(ring_size));
        let tap_out = Arc::new(Ring::new(ring_size));
        let dev = RingDev {
            rx: rx.clone(),
            tx: tx.clone(),
            tap_in: Some(tap_in.clone()),
            tap_out: Some(tap_out.clone()),
        };
        let port = RingDevPort {
            rx,
            tx,
            tap_in,
            tap_out,
        };
        (dev, port)
    }

    /// A device whose far end nobody holds; TX frames accumulate until the
    /// ring fills, then count as drops.
    pub fn detached(ring_size: usize) -> RingDev {
        RingDev {
            rx: Arc::new(Ring::new(ring_size)),
            tx: Arc::new(Ring::new(ring_size)),
            tap_in: None,
            tap_out: None,
        }
    }
}

impl PollDev for RingDev {
    fn rx_poll(&mut self, out: &mut Vec<PktBuf>, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            match self.rx.pop() {
                Some(p) => {
                    out.push(p);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    fn tx_xmit(&mut self, pkts: &mut Vec<PktBuf>) -> usize {
        let mut sent = 0;
        while sent < pkts.len() {
            // peek-free: push and reclaim on failure
            let pkt = pkts.remove(0);
            match self.tx.push(pkt) {
                Ok(()) => sent += 1,
                Err(pkt) => {
                    pkts.insert(0, pkt);
                    break;
                }
            }
        }
        sent
    }

    fn tap_rx_burst(&mut self, out: &mut Vec<PktBuf>, max: usize) -> usize {
        let Some(tap_in) = &self.tap_in else {
            return 0;
        };
        let mut n = 0;
        while n < max {
            match tap_in.pop() {
                Some(p) => {
                    out.push(p);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    fn tap_tx_burst(&mut self, pkt: PktBuf) -> bool {
        match &self.tap_out {
            Some(t) => t.push(pkt).is_ok(),
            None => false,
        }
    }

    fn queue_depth(&self) -> Option<usize> {
        Some(self.rx.len() + self.tx.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mbuf::PktPool;

    #[test]
    fn rx_poll_respects_max() {
        let pool = PktPool::new(8, 0);
        let (mut dev, port) = RingDev::with_port(8);
        for i in 0..5u8 {
            port.inject(pool.alloc_from(&[i]).unwrap()).unwrap();
        }
        let mut out = Vec::new();
        assert_eq!(dev.rx_poll(&mut out, 3), 3);
        assert_eq!(dev.rx_poll(&mut out, 10), 2);
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn tx_retains_unsent_tail() {
        let pool = PktPool::new(8, 0);
        let (mut dev, port) = RingDev::with_port(2);
        let mut burst: Vec<_> = (0..4u8).map(|i| pool.alloc_from(&[i]).unwrap()).collect();
        // ring holds 2, so 2 go out and 2 stay
        assert_eq!(dev.tx_xmit(&mut burst), 2);
        assert_eq!(burst.len(), 2);
        assert_eq!(burst[0].data(), &[2]);
        assert_eq!(port.take_tx().unwrap().data(), &[0]);
    }

    #[test]
    fn queue_depth_tracks_rings() {
        let pool = PktPool::new(8, 0);
        let (dev, port) = RingDev::with_port(8);
        assert_eq!(dev.queue_depth(), Some(0));
        port.inject(pool.alloc_from(&[0]).unwrap()).unwrap();
        assert_eq!(dev.queue_depth(), Some(1));
    }
}
