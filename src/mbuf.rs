//! Packet buffers and per-worker pools.
//!
//! Every worker owns one pool, tagged with the worker's NUMA node. A buffer
//! belongs to the pool it was allocated from until it is handed to the device
//! by `tx_xmit` or copied into a peer worker's pool; buffers are never shared
//! across pool boundaries. Dropping a buffer returns its slot.
//!
//! `SegRegistry` stands in for the shared huge-page segment that cooperating
//! processes use to hand frames to each other over the bridge: the sender
//! publishes the bytes and sends the decimal token, ownership transfers on
//! the bridge write, and the receiver re-copies into its own pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

/// Fixed buffer size: an MTU-sized frame plus headroom.
pub const MBUF_DATA_ROOM: usize = 2048;
/// Largest single frame we accept from a device.
pub const FRAME_MAX_LEN: usize = 1514;

#[derive(Debug)]
struct PoolInner {
    numa_node: usize,
    capacity: usize,
    in_use: AtomicUsize,
    alloc_fail: AtomicU64,
}

/// NUMA-local pool of fixed-size packet buffers.
///
/// Clone is cheap; all clones account against the same capacity, so a peer
/// worker can allocate a copy "from this pool" without touching the owner.
#[derive(Clone)]
pub struct PktPool {
    inner: Arc<PoolInner>,
}

impl PktPool {
    pub fn new(capacity: usize, numa_node: usize) -> PktPool {
        PktPool {
            inner: Arc::new(PoolInner {
                numa_node,
                capacity,
                in_use: AtomicUsize::new(0),
                alloc_fail: AtomicU64::new(0),
            }),
        }
    }

    pub fn numa_node(&self) -> usize {
        self.inner.numa_node
    }

    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::Relaxed)
    }

    pub fn alloc_failures(&self) -> u64 {
        self.inner.alloc_fail.load(Ordering::Relaxed)
    }

    /// Allocate an empty buffer, or `None` when the pool is exhausted.
    pub fn alloc(&self) -> Option<PktBuf> {
        let prev = self.inner.in_use.fetch_add(1, Ordering::AcqRel);
        if prev >= self.inner.capacity {
            self.inner.in_use.fetch_sub(1, Ordering::AcqRel);
            self.inner.alloc_fail.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        Some(PktBuf {
            data: Vec::with_capacity(MBUF_DATA_ROOM),
            ts_ns: 0,
            next: None,
            _lease: PoolLease(self.inner.clone()),
        })
    }

    /// Allocate a buffer holding `bytes`.
    pub fn alloc_from(&self, bytes: &[u8]) -> Option<PktBuf> {
        let mut buf = self.alloc()?;
        buf.data.extend_from_slice(bytes);
        Some(buf)
    }

    /// Copy `src` (including its chain) into this pool.
    pub fn alloc_copy(&self, src: &PktBuf) -> Option<PktBuf> {
        let mut segs: Vec<&PktBuf> = Vec::new();
        let mut cur = Some(src);
        while let Some(s) = cur {
            segs.push(s);
            cur = s.next.as_deref();
        }
        // assemble back to front so each segment owns its tail
        let mut chain: Option<Box<PktBuf>> = None;
        for s in segs.iter().rev() {
            let mut buf = self.alloc_from(s.data())?;
            buf.next = chain.take();
            chain = Some(Box::new(buf));
        }
        let mut head = *chain?;
        head.ts_ns = src.ts_ns;
        Some(head)
    }
}

#[derive(Debug)]
struct PoolLease(Arc<PoolInner>);

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.0.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A driver-style packet buffer: fixed room, chain-linked for segmented
/// frames, leased from exactly one pool.
#[derive(Debug)]
pub struct PktBuf {
    data: Vec<u8>,
    ts_ns: u64,
    next: Option<Box<PktBuf>>,
    _lease: PoolLease,
}

impl PktBuf {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Length of this segment.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Total length across the chain.
    pub fn pkt_len(&self) -> usize {
        let mut n = self.data.len();
        let mut seg = self.next.as_deref();
        while let Some(s) = seg {
            n += s.data.len();
            seg = s.next.as_deref();
        }
        n
    }

    pub fn chain(&mut self, seg: PktBuf) {
        let mut slot = &mut self.next;
        while let Some(next) = slot {
            slot = &mut next.next;
        }
        *slot = Some(Box::new(seg));
    }

    pub fn set_timestamp(&mut self, ts_ns: u64) {
        self.ts_ns = ts_ns;
    }

    pub fn timestamp(&self) -> u64 {
        self.ts_ns
    }

    /// Flatten the chain into one contiguous byte vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pkt_len());
        out.extend_from_slice(&self.data);
        let mut seg = self.next.as_deref();
        while let Some(s) = seg {
            out.extend_from_slice(&s.data);
            seg = s.next.as_deref();
        }
        out
    }
}

static SEG_REGISTRY: Lazy<Mutex<HashMap<u64, Vec<u8>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));
static SEG_NEXT: AtomicU64 = AtomicU64::new(1);

/// Publish bytes into the shared segment; the returned token travels over the
/// bridge. Ownership moves with the token.
pub fn seg_publish(bytes: Vec<u8>) -> u64 {
    let token = SEG_NEXT.fetch_add(1, Ordering::Relaxed);
    SEG_REGISTRY.lock().unwrap().insert(token, bytes);
    token
}

/// Claim a published segment. The entry is removed; the producer must not
/// touch the buffer after sending the token.
pub fn seg_take(token: u64) -> Option<Vec<u8>> {
    SEG_REGISTRY.lock().unwrap().remove(&token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_capacity_enforced() {
        let pool = PktPool::new(2, 0);
        let a = pool.alloc().unwrap();
        let _b = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
        assert_eq!(pool.alloc_failures(), 1);
        drop(a);
        assert!(pool.alloc().is_some());
    }

    #[test]
    fn copy_crosses_pools() {
        let src_pool = PktPool::new(4, 0);
        let dst_pool = PktPool::new(4, 1);
        let mut src = src_pool.alloc_from(b"abcd").unwrap();
        src.chain(src_pool.alloc_from(b"efgh").unwrap());

        let copy = dst_pool.alloc_copy(&src).unwrap();
        assert_eq!(copy.pkt_len(), 8);
        assert_eq!(copy.to_vec(), b"abcdefgh");
        assert_eq!(dst_pool.in_use(), 2);
        drop(src);
        assert_eq!(src_pool.in_use(), 0);
    }

    #[test]
    fn seg_tokens_transfer_ownership() {
        let t = seg_publish(vec![1, 2, 3]);
        assert_eq!(seg_take(t), Some(vec![1, 2, 3]));
        assert_eq!(seg_take(t), None);
    }
}
