//! Application wake-poll: the epoll-like readiness surface.
//!
//! A `WakeupPoll` is created by the shim's `epoll_create` and parked on by
//! `epoll_wait`. Workers push socket readiness into it and kick the eventfd;
//! the waiting application thread wakes, harvests event masks, and goes back
//! to sleep if none remain. The kick is one syscall no matter how many
//! events were folded in.
//!
//! Each wakeup holds at most one linkage per worker. A linkage is only ever
//! added by that worker inside its poll loop, and only removed by the same
//! worker through a `clean_epoll` RPC, so teardown cannot race delivery.
//!
//! Kernel-delivered fds are watched by a per-worker `KernelSink`: an epoll
//! instance a helper thread blocks on. The helper parks results in the sink;
//! the worker folds them into wakeups every 16 loop iterations.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use byteorder::{ByteOrder, NativeEndian};

use crate::sock::{Fd, SockTable, EV_ERR};

/// Thin eventfd wrapper; the 8-byte counter travels through `byteorder` so
/// the encode matches the kernel's native-endian expectation.
#[derive(Debug)]
pub struct EventFd(RawFd);

impl EventFd {
    pub fn new() -> io::Result<EventFd> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EventFd(fd))
    }

    pub fn raw(&self) -> RawFd {
        self.0
    }

    /// Bump the counter by `n`, waking any poller.
    pub fn signal(&self, n: i64) {
        let mut buf = [0u8; 8];
        NativeEndian::write_i64(&mut buf, n);
        unsafe {
            libc::write(self.0, buf.as_ptr() as *const libc::c_void, 8);
        }
    }

    /// Reset the counter; returns the value it held.
    pub fn drain(&self) -> i64 {
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr() as *mut libc::c_void, 8) };
        if n == 8 {
            NativeEndian::read_i64(&buf)
        } else {
            0
        }
    }

    /// Block until the counter is nonzero or `timeout_ms` passes
    /// (negative = forever). Returns true when readable.
    pub fn poll_in(&self, timeout_ms: i32) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.0,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        rc > 0 && pfd.revents & libc::POLLIN != 0
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

#[derive(Debug)]
pub struct WakeupPoll {
    efd: EventFd,
    /// Worker the wakeup was placed on at creation; kernel fds registered
    /// through it land in this worker's sink.
    pub bind_stack_idx: usize,
    /// One linkage flag per worker; a worker links this wakeup into its
    /// signal list only when its flag flips false -> true.
    linked: Vec<AtomicBool>,
    /// Sockets with freshly posted events, per worker.
    ready_fds: Mutex<Vec<Fd>>,
    /// Kernel events folded in by workers: (user data, event mask).
    kernel_ready: Mutex<Vec<(u64, u32)>>,
    pub have_kernel_event: AtomicBool,
    /// Set while tearing down; workers skip closed wakeups.
    pub closed: AtomicBool,
}

impl WakeupPoll {
    pub fn new(bind_stack_idx: usize, stack_num: usize) -> io::Result<Arc<WakeupPoll>> {
        Ok(Arc::new(WakeupPoll {
            efd: EventFd::new()?,
            bind_stack_idx,
            linked: (0..stack_num).map(|_| AtomicBool::new(false)).collect(),
            ready_fds: Mutex::new(Vec::new()),
            kernel_ready: Mutex::new(Vec::new()),
            have_kernel_event: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    /// Record a ready socket. Returns true when the caller (a worker) newly
    /// acquired this worker's linkage and must signal later.
    pub fn push_ready(&self, fd: Fd, stack_idx: usize) -> bool {
        let mut ready = self.ready_fds.lock().unwrap();
        if !ready.contains(&fd) {
            ready.push(fd);
        }
        !self.linked[stack_idx].swap(true, Ordering::AcqRel)
    }

    pub fn push_kernel(&self, data: u64, events: u32, stack_idx: usize) -> bool {
        self.kernel_ready.lock().unwrap().push((data, events));
        self.have_kernel_event.store(true, Ordering::Release);
        !self.linked[stack_idx].swap(true, Ordering::AcqRel)
    }

    /// Drop the linkage for `stack_idx`; only the owning worker calls this.
    pub fn unlink(&self, stack_idx: usize) {
        self.linked[stack_idx].store(false, Ordering::Release);
    }

    /// Application-side arm: a socket registered with readiness already
    /// pending must surface without waiting for a worker pass.
    pub fn arm(&self, fd: Fd) {
        let mut ready = self.ready_fds.lock().unwrap();
        if !ready.contains(&fd) {
            ready.push(fd);
        }
        drop(ready);
        self.wake();
    }

    /// One syscall to wake every parked waiter.
    pub fn wake(&self) {
        self.efd.signal(1);
    }

    /// Harvest pending events into `out` as `(user data, mask)` pairs.
    /// Level-triggered: sockets whose mask is still live stay queued.
    pub fn harvest(&self, table: &SockTable, out: &mut Vec<(u64, u32)>, max: usize) {
        {
            let mut kernel = self.kernel_ready.lock().unwrap();
            out.extend(kernel.drain(..));
            self.have_kernel_event.store(false, Ordering::Release);
        }
        let mut ready = self.ready_fds.lock().unwrap();
        let mut keep = Vec::new();
        for &fd in ready.iter() {
            if out.len() >= max {
                keep.push(fd);
                continue;
            }
            let Ok(sock) = table.get(fd) else { continue };
            let inner = sock.inner.lock().unwrap();
            let mask = sock.events.load(Ordering::Acquire) & (inner.interest | EV_ERR);
            if mask != 0 {
                out.push((inner.epdata, mask));
                keep.push(fd); // level-triggered until the mask clears
            }
        }
        *ready = keep;
    }

    /// Park until woken or `timeout_ms` elapses (negative = forever).
    pub fn wait(&self, timeout_ms: i32) -> bool {
        let woken = self.efd.poll_in(timeout_ms);
        if woken {
            self.efd.drain();
        }
        woken
    }
}

const STOP_TOKEN: u64 = 0;

struct KernelWatch {
    wakeup: Weak<WakeupPoll>,
    data: u64,
}

/// Per-worker kernel-event funnel: an epoll instance the helper thread blocks
/// on, plus the parking area the worker drains.
pub struct KernelSink {
    epfd: RawFd,
    stop: EventFd,
    watches: Mutex<HashMap<u64, KernelWatch>>,
    fd_ids: Mutex<HashMap<RawFd, u64>>,
    next_id: AtomicU64,
    pending: Mutex<Vec<(u64, u32)>>,
    /// Count the helper spins on until the worker drains.
    pub pending_n: AtomicI32,
}

impl KernelSink {
    pub fn new() -> io::Result<KernelSink> {
        let epfd = unsafe { libc::epoll_create1(0) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let stop = EventFd::new()?;
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: STOP_TOKEN,
        };
        let rc = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, stop.raw(), &mut ev) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err);
        }
        Ok(KernelSink {
            epfd,
            stop,
            watches: Mutex::new(HashMap::new()),
            fd_ids: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(Vec::new()),
            pending_n: AtomicI32::new(0),
        })
    }

    pub fn add_watch(
        &self,
        fd: RawFd,
        wakeup: &Arc<WakeupPoll>,
        data: u64,
        interest: u32,
    ) -> io::Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        self.watches.lock().unwrap().insert(
            id,
            KernelWatch {
                wakeup: Arc::downgrade(wakeup),
                data,
            },
        );
        self.fd_ids.lock().unwrap().insert(fd, id);
        let mut ev = libc::epoll_event {
            events: interest | libc::EPOLLIN as u32,
            u64: id,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if rc < 0 {
            self.watches.lock().unwrap().remove(&id);
            self.fd_ids.lock().unwrap().remove(&fd);
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn del_watch(&self, fd: RawFd) {
        if let Some(id) = self.fd_ids.lock().unwrap().remove(&fd) {
            self.watches.lock().unwrap().remove(&id);
        }
        unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
    }

    /// Helper-thread step: block for kernel events, park them for the worker.
    /// Returns false once the stop token fires.
    pub fn block_collect(&self) -> bool {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 64];
        let n = unsafe { libc::epoll_wait(self.epfd, events.as_mut_ptr(), 64, -1) };
        if n <= 0 {
            return true; // EINTR and friends: keep going
        }
        let mut keep_running = true;
        let mut parked = 0;
        {
            let mut pending = self.pending.lock().unwrap();
            for ev in &events[..n as usize] {
                if ev.u64 == STOP_TOKEN {
                    keep_running = false;
                    continue;
                }
                pending.push((ev.u64, ev.events));
                parked += 1;
            }
        }
        if parked > 0 {
            self.pending_n.store(parked, Ordering::Release);
        }
        keep_running
    }

    /// Worker-side fold: resolve parked events to their wakeups.
    pub fn take_pending(&self) -> Vec<(Arc<WakeupPoll>, u64, u32)> {
        if self.pending_n.load(Ordering::Acquire) == 0 {
            return Vec::new();
        }
        let parked: Vec<(u64, u32)> = self.pending.lock().unwrap().drain(..).collect();
        self.pending_n.store(0, Ordering::Release);
        let watches = self.watches.lock().unwrap();
        parked
            .into_iter()
            .filter_map(|(id, events)| {
                let watch = watches.get(&id)?;
                let wakeup = watch.wakeup.upgrade()?;
                if wakeup.closed.load(Ordering::Acquire) {
                    return None;
                }
                Some((wakeup, watch.data, events))
            })
            .collect()
    }

    pub fn stop(&self) {
        self.stop.signal(1);
    }
}

impl Drop for KernelSink {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sock::{SockTable, EV_IN};

    #[test]
    fn eventfd_signal_and_drain() {
        let efd = EventFd::new().unwrap();
        assert!(!efd.poll_in(0));
        efd.signal(3);
        assert!(efd.poll_in(0));
        assert_eq!(efd.drain(), 3);
        assert!(!efd.poll_in(0));
    }

    #[test]
    fn linkage_acquired_once_per_worker() {
        let w = WakeupPoll::new(0, 2).unwrap();
        assert!(w.push_ready(1024, 0));
        assert!(!w.push_ready(1025, 0));
        assert!(w.push_ready(1024, 1));
        w.unlink(0);
        assert!(w.push_ready(1024, 0));
    }

    #[test]
    fn harvest_is_level_triggered() {
        let table = SockTable::new(4, 8);
        let sock = table.alloc(0).unwrap();
        {
            let mut inner = sock.inner.lock().unwrap();
            inner.interest = EV_IN;
            inner.epdata = 7;
        }
        let w = WakeupPoll::new(0, 1).unwrap();
        sock.post_events(EV_IN);
        w.push_ready(sock.fd, 0);

        let mut out = Vec::new();
        w.harvest(&table, &mut out, 16);
        assert_eq!(out, vec![(7, EV_IN)]);

        // still set: harvested again
        out.clear();
        w.harvest(&table, &mut out, 16);
        assert_eq!(out.len(), 1);

        sock.clear_events(EV_IN);
        out.clear();
        w.harvest(&table, &mut out, 16);
        assert!(out.is_empty());
    }

    #[test]
    fn kernel_sink_stop_unblocks_helper() {
        let sink = KernelSink::new().unwrap();
        let sink = std::sync::Arc::new(sink);
        let h = {
            let sink = sink.clone();
            std::thread::spawn(move || while sink.block_collect() {})
        };
        sink.stop();
        h.join().unwrap();
    }
}
