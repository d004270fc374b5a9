//! Cross-worker RPC bus.
//!
//! Every worker owns a single-consumer inbound ring of `RpcMsg`. Producers
//! are application shim threads and peer workers. A synchronous call carries
//! a completion the handler signals after writing its result; fire-and-forget
//! messages (ARP copies, epoll cleanup) carry none. The ring never drops a
//! control message: a full ring makes the producer spin with bounded backoff
//! until the polling consumer frees a slot.

use std::net::SocketAddrV4;
use std::sync::{Arc, Condvar, Mutex};

use crate::error::Errno;
use crate::mbuf::PktBuf;
use crate::ring::Ring;
use crate::sock::Fd;
use crate::wakeup::WakeupPoll;

/// One variant per handler; typed fields instead of an argument union.
pub enum RpcReq {
    /// Inject a frame into the worker's TCP/IP instance (ARP broadcast
    /// copies and SYN hand-off from the dispatcher).
    PktIn(PktBuf),
    Socket,
    Close { fd: Fd },
    Bind { fd: Fd, addr: SocketAddrV4 },
    Listen { fd: Fd, backlog: u32 },
    Accept { fd: Fd, nonblock: bool },
    Connect { fd: Fd, addr: SocketAddrV4 },
    GetPeerName { fd: Fd },
    GetSockName { fd: Fd },
    GetSockOpt { fd: Fd, level: i32, name: i32 },
    SetSockOpt { fd: Fd, level: i32, name: i32, value: i64 },
    Fcntl { fd: Fd, cmd: i32, arg: i64 },
    Ioctl { fd: Fd, cmd: i64, arg: i64 },
    Recv { fd: Fd, max: usize },
    Send { fd: Fd, data: Vec<u8> },
    /// Clone a listen/bound socket onto this worker (shadow creation).
    ShadowFd { fd: Fd, addr: SocketAddrV4 },
    /// Drop this worker's linkage of the given wake-poll.
    CleanEpoll { wakeup: Arc<WakeupPoll> },
    /// Diagnostic: resolve an IP in this worker's ARP cache.
    ArpLookup { ip: u32 },
}

impl RpcReq {
    pub fn name(&self) -> &'static str {
        match self {
            RpcReq::PktIn(_) => "pkt_in",
            RpcReq::Socket => "socket",
            RpcReq::Close { .. } => "close",
            RpcReq::Bind { .. } => "bind",
            RpcReq::Listen { .. } => "listen",
            RpcReq::Accept { .. } => "accept",
            RpcReq::Connect { .. } => "connect",
            RpcReq::GetPeerName { .. } => "getpeername",
            RpcReq::GetSockName { .. } => "getsockname",
            RpcReq::GetSockOpt { .. } => "getsockopt",
            RpcReq::SetSockOpt { .. } => "setsockopt",
            RpcReq::Fcntl { .. } => "fcntl",
            RpcReq::Ioctl { .. } => "ioctl",
            RpcReq::Recv { .. } => "recv",
            RpcReq::Send { .. } => "send",
            RpcReq::ShadowFd { .. } => "shadow_fd",
            RpcReq::CleanEpoll { .. } => "clean_epoll",
            RpcReq::ArpLookup { .. } => "arp_lookup",
        }
    }
}

/// Result slot: one success shape per handler family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcRet {
    Unit,
    Fd(Fd),
    Addr(SocketAddrV4),
    Int(i64),
    Bytes(Vec<u8>),
    Mac(Option<[u8; 6]>),
}

pub type RpcResult = Result<RpcRet, Errno>;

impl RpcRet {
    pub fn fd(self) -> Fd {
        match self {
            RpcRet::Fd(fd) => fd,
            other => panic!("rpc returned {:?}, expected fd", other),
        }
    }

    pub fn addr(self) -> SocketAddrV4 {
        match self {
            RpcRet::Addr(a) => a,
            other => panic!("rpc returned {:?}, expected addr", other),
        }
    }

    pub fn int(self) -> i64 {
        match self {
            RpcRet::Int(v) => v,
            other => panic!("rpc returned {:?}, expected int", other),
        }
    }
}

/// Completion signal for synchronous calls. The handler stores the result
/// before notifying, so the caller observes it on wake.
pub struct Completion {
    slot: Mutex<Option<RpcResult>>,
    cv: Condvar,
}

impl Completion {
    pub fn new() -> Arc<Completion> {
        Arc::new(Completion {
            slot: Mutex::new(None),
            cv: Condvar::new(),
        })
    }

    pub fn complete(&self, result: RpcResult) {
        let mut slot = self.slot.lock().unwrap();
        *slot = Some(result);
        self.cv.notify_one();
    }

    /// Wait unconditionally; there is no cancellation model for RPCs.
    pub fn wait(&self) -> RpcResult {
        let mut slot = self.slot.lock().unwrap();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            slot = self.cv.wait(slot).unwrap();
        }
    }
}

pub struct RpcMsg {
    pub req: RpcReq,
    pub done: Option<Arc<Completion>>,
}

/// The per-worker inbound command queue (MPSC: many producers, the owning
/// worker consumes).
pub struct RpcRing {
    ring: Ring<RpcMsg>,
}

impl RpcRing {
    pub fn new(capacity: usize) -> RpcRing {
        RpcRing {
            ring: Ring::new(capacity),
        }
    }

    /// Synchronous call: enqueue and wait for the handler's result.
    pub fn call(&self, req: RpcReq) -> RpcResult {
        let done = Completion::new();
        self.ring.push_control(RpcMsg {
            req,
            done: Some(done.clone()),
        });
        done.wait()
    }

    /// Fire-and-forget: enqueue and return. The ring's release ordering makes
    /// everything written before the send visible to the handler.
    pub fn cast(&self, req: RpcReq) {
        self.ring.push_control(RpcMsg { req, done: None });
    }

    pub fn pop(&self) -> Option<RpcMsg> {
        self.ring.pop()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn sync_call_round_trip() {
        let ring = Arc::new(RpcRing::new(8));
        let consumer = {
            let ring = ring.clone();
            thread::spawn(move || loop {
                if let Some(msg) = ring.pop() {
                    let result = match msg.req {
                        RpcReq::Socket => Ok(RpcRet::Fd(1024)),
                        _ => Err(Errno::INVAL),
                    };
                    msg.done.unwrap().complete(result);
                    break;
                }
                thread::yield_now();
            })
        };
        assert_eq!(ring.call(RpcReq::Socket).unwrap().fd(), 1024);
        consumer.join().unwrap();
    }

    #[test]
    fn cast_is_fire_and_forget() {
        let ring = RpcRing::new(4);
        ring.cast(RpcReq::ArpLookup { ip: 1 });
        let msg = ring.pop().unwrap();
        assert!(msg.done.is_none());
        assert_eq!(msg.req.name(), "arp_lookup");
    }

    #[test]
    fn producers_spin_rather_than_drop() {
        let ring = Arc::new(RpcRing::new(2));
        let producer = {
            let ring = ring.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    ring.cast(RpcReq::Socket);
                }
            })
        };
        let mut got = 0;
        while got < 100 {
            if ring.pop().is_some() {
                got += 1;
            }
        }
        producer.join().unwrap();
    }
}
