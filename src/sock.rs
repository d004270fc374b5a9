//! Process-wide socket table.
//!
//! One record per shim descriptor. The record's owning worker is fixed at
//! creation: every TCP/IP operation on the descriptor is executed by that
//! worker, which is what makes per-record state single-writer. Fields touched
//! from application threads (event mask, acceptable flag, mailbox) are atomics
//! or lock-free rings; the rest sits behind the record mutex.
//!
//! Shadow listen sockets form a chain through `listen_next`. The chain is
//! stored as descriptor indices rather than references; traversal carries a
//! visited set so a corrupted cycle cannot hang `broadcast_close`.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use crate::error::Errno;
use crate::inet::ConnId;
use crate::ring::Ring;
use crate::wakeup::WakeupPoll;

pub type Fd = i32;

/// First descriptor value the table hands out; keeps shim descriptors
/// visually distinct from kernel fds in logs and traces.
pub const FD_BASE: Fd = 1024;

/// Event bits, matching the host epoll constants.
pub const EV_IN: u32 = libc::EPOLLIN as u32;
pub const EV_OUT: u32 = libc::EPOLLOUT as u32;
pub const EV_ERR: u32 = libc::EPOLLERR as u32;

#[derive(Debug)]
pub struct SockEntry {
    pub fd: Fd,
    /// Owning worker index; never changes for the lifetime of the fd.
    pub stack_idx: usize,
    /// Connection handle inside the owning worker's TCP/IP instance.
    pub conn: Mutex<Option<ConnId>>,
    /// Application-visible receive mailbox, filled by the owning worker.
    pub recvbox: Ring<Vec<u8>>,
    /// Pending event mask (EV_*), set by the worker, cleared by consumers.
    pub events: AtomicU32,
    /// Listener has connections ready to accept.
    pub acceptable: AtomicBool,
    /// This socket was counted into its worker's `conn_num` (shadow clones
    /// are not, so close can restore the balance exactly).
    pub counted: AtomicBool,
    pub inner: Mutex<SockInner>,
    /// Blocking recv/accept park here; the worker notifies on delivery.
    pub ready: Condvar,
}

#[derive(Default, Debug)]
pub struct SockInner {
    pub listen_next: Option<Fd>,
    pub is_master_fd: bool,
    pub is_listener: bool,
    pub nonblock: bool,
    pub eof: bool,
    pub bound: Option<SocketAddrV4>,
    pub wakeup: Option<Arc<WakeupPoll>>,
    /// User data echoed back by epoll_wait.
    pub epdata: u64,
    /// Interest mask registered via epoll_ctl.
    pub interest: u32,
    /// Tail of a mailbox chunk the application read only part of.
    pub rx_carry: VecDeque<u8>,
}

impl SockEntry {
    pub fn conn_id(&self) -> Result<ConnId, Errno> {
        self.conn.lock().unwrap().ok_or(Errno::BADF)
    }

    /// Set event bits and wake anyone parked on the record.
    pub fn post_events(&self, bits: u32) {
        self.events.fetch_or(bits, Ordering::AcqRel);
        let _guard = self.inner.lock().unwrap();
        self.ready.notify_all();
    }

    pub fn clear_events(&self, bits: u32) {
        self.events.fetch_and(!bits, Ordering::AcqRel);
    }

    pub fn wakeup(&self) -> Option<Arc<WakeupPoll>> {
        self.inner.lock().unwrap().wakeup.clone()
    }
}

pub struct SockTable {
    slots: RwLock<Vec<Option<Arc<SockEntry>>>>,
    free: Mutex<Vec<usize>>,
    next_unused: AtomicU32,
    capacity: usize,
    ring_size: usize,
}

impl SockTable {
    pub fn new(capacity: usize, ring_size: usize) -> SockTable {
        SockTable {
            slots: RwLock::new(vec![None; capacity]),
            free: Mutex::new(Vec::new()),
            next_unused: AtomicU32::new(0),
            capacity,
            ring_size,
        }
    }

    /// Allocate a record owned by worker `stack_idx`.
    pub fn alloc(&self, stack_idx: usize) -> Result<Arc<SockEntry>, Errno> {
        let idx = match self.free.lock().unwrap().pop() {
            Some(i) => i,
            None => {
                let i = self.next_unused.fetch_add(1, Ordering::AcqRel) as usize;
                if i >= self.capacity {
                    self.next_unused.fetch_sub(1, Ordering::AcqRel);
                    return Err(Errno::MFILE);
                }
                i
            }
        };
        let entry = Arc::new(SockEntry {
            fd: FD_BASE + idx as Fd,
            stack_idx,
            conn: Mutex::new(None),
            recvbox: Ring::new(self.ring_size),
            events: AtomicU32::new(0),
            acceptable: AtomicBool::new(false),
            counted: AtomicBool::new(false),
            inner: Mutex::new(SockInner::default()),
            ready: Condvar::new(),
        });
        self.slots.write().unwrap()[idx] = Some(entry.clone());
        Ok(entry)
    }

    pub fn get(&self, fd: Fd) -> Result<Arc<SockEntry>, Errno> {
        let idx = fd - FD_BASE;
        if idx < 0 {
            return Err(Errno::BADF);
        }
        self.slots
            .read()
            .unwrap()
            .get(idx as usize)
            .and_then(|s| s.clone())
            .ok_or(Errno::BADF)
    }

    pub fn owns(&self, fd: Fd) -> bool {
        self.get(fd).is_ok()
    }

    pub fn release(&self, fd: Fd) {
        let idx = (fd - FD_BASE) as usize;
        let mut slots = self.slots.write().unwrap();
        if idx < slots.len() && slots[idx].take().is_some() {
            self.free.lock().unwrap().push(idx);
        }
    }

    /// Walk the shadow-listen chain starting at `fd`, head included.
    /// A visited set breaks accidental cycles.
    pub fn walk_listen_chain(&self, fd: Fd) -> Vec<Arc<SockEntry>> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut cur = Some(fd);
        while let Some(f) = cur {
            if !seen.insert(f) {
                log::warn!("listen chain cycle at fd {}", f);
                break;
            }
            match self.get(f) {
                Ok(entry) => {
                    cur = entry.inner.lock().unwrap().listen_next;
                    out.push(entry);
                }
                Err(_) => break,
            }
        }
        out
    }

    /// Insert `clone_fd` into the chain right behind `head_fd`.
    pub fn link_shadow(&self, head_fd: Fd, clone_fd: Fd) -> Result<(), Errno> {
        let head = self.get(head_fd)?;
        let clone = self.get(clone_fd)?;
        let mut head_inner = head.inner.lock().unwrap();
        let mut clone_inner = clone.inner.lock().unwrap();
        clone_inner.listen_next = head_inner.listen_next;
        head_inner.listen_next = Some(clone_fd);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_get_release() {
        let t = SockTable::new(4, 8);
        let a = t.alloc(0).unwrap();
        assert_eq!(a.fd, FD_BASE);
        assert!(t.get(a.fd).is_ok());
        t.release(a.fd);
        assert_eq!(t.get(a.fd).unwrap_err(), Errno::BADF);

        // slot is reused
        let b = t.alloc(1).unwrap();
        assert_eq!(b.fd, FD_BASE);
        assert_eq!(b.stack_idx, 1);
    }

    #[test]
    fn capacity_is_enforced() {
        let t = SockTable::new(2, 8);
        let _a = t.alloc(0).unwrap();
        let _b = t.alloc(0).unwrap();
        assert_eq!(t.alloc(0).unwrap_err(), Errno::MFILE);
    }

    #[test]
    fn listen_chain_walk_and_cycle_guard() {
        let t = SockTable::new(8, 8);
        let head = t.alloc(0).unwrap();
        let s1 = t.alloc(1).unwrap();
        let s2 = t.alloc(2).unwrap();
        t.link_shadow(head.fd, s1.fd).unwrap();
        t.link_shadow(head.fd, s2.fd).unwrap();

        let chain = t.walk_listen_chain(head.fd);
        let fds: Vec<Fd> = chain.iter().map(|e| e.fd).collect();
        assert_eq!(fds, vec![head.fd, s2.fd, s1.fd]);

        // close the loop; walk must still terminate
        s1.inner.lock().unwrap().listen_next = Some(head.fd);
        assert_eq!(t.walk_listen_chain(head.fd).len(), 3);
    }

    #[test]
    fn bad_fd_is_rejected() {
        let t = SockTable::new(2, 8);
        assert_eq!(t.get(10).unwrap_err(), Errno::BADF);
        assert_eq!(t.get(FD_BASE + 1).unwrap_err(), Errno::BADF);
    }
}
