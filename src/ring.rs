//! Bounded lock-free rings.
//!
//! One shape serves all three transports in the engine: the per-worker RPC
//! inbound ring (MPSC), the RX/TX hand-off rings between a worker and its
//! device (SPSC), and the per-socket receive mailbox (SPSC, worker to app).
//! Consumers never block. Producers of data drop on full and let the caller
//! account for it; producers of *control* messages must not drop, so they
//! spin with bounded backoff until a slot frees up.

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::Backoff;

pub struct Ring<T> {
    q: ArrayQueue<T>,
}

impl<T> std::fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("len", &self.q.len())
            .field("capacity", &self.q.capacity())
            .finish()
    }
}

impl<T> Ring<T> {
    pub fn new(capacity: usize) -> Ring<T> {
        Ring {
            q: ArrayQueue::new(capacity),
        }
    }

    /// Try to enqueue; hands the value back on a full ring.
    pub fn push(&self, value: T) -> Result<(), T> {
        self.q.push(value)
    }

    /// Enqueue a control message. Spins with backoff while the ring is full;
    /// the consumer is a live polling worker, so a slot always frees up.
    pub fn push_control(&self, mut value: T) {
        let backoff = Backoff::new();
        loop {
            match self.q.push(value) {
                Ok(()) => return,
                Err(v) => {
                    value = v;
                    backoff.snooze();
                }
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        self.q.pop()
    }

    pub fn len(&self) -> usize {
        self.q.len()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.q.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_pop_fifo() {
        let r = Ring::new(4);
        r.push(1).unwrap();
        r.push(2).unwrap();
        assert_eq!(r.pop(), Some(1));
        assert_eq!(r.pop(), Some(2));
        assert_eq!(r.pop(), None);
    }

    #[test]
    fn full_ring_returns_value() {
        let r = Ring::new(2);
        r.push(1).unwrap();
        r.push(2).unwrap();
        assert_eq!(r.push(3), Err(3));
    }

    #[test]
    fn control_push_never_drops() {
        let r = Arc::new(Ring::new(2));
        let prod = {
            let r = r.clone();
            thread::spawn(move || {
                for i in 0..1000 {
                    r.push_control(i);
                }
            })
        };
        let mut seen = 0;
        while seen < 1000 {
            if let Some(v) = r.pop() {
                assert_eq!(v, seen);
                seen += 1;
            }
        }
        prod.join().unwrap();
    }
}
