//! Small synchronization primitives used by staged init and placement.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use crossbeam::utils::Backoff;

/// Counting semaphore for the init barriers: workers post as they pass each
/// phase, the main thread waits for the expected count.
pub struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new() -> Semaphore {
        Semaphore {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cv.notify_all();
    }

    pub fn value(&self) -> usize {
        *self.count.lock().unwrap()
    }

    /// Block until the counter reaches `target`. The counter is not consumed.
    pub fn wait_value(&self, target: usize) {
        let mut count = self.count.lock().unwrap();
        while *count < target {
            count = self.cv.wait(count).unwrap();
        }
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Semaphore::new()
    }
}

/// Spinlock guarding the min-`conn_num` placement scan. Held for a handful
/// of loads; contenders back off instead of parking.
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> SpinLock {
        SpinLock {
            locked: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_> {
        let backoff = Backoff::new();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
        SpinGuard { lock: self }
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        SpinLock::new()
    }
}

pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn semaphore_wait_value() {
        let sem = Arc::new(Semaphore::new());
        let posters: Vec<_> = (0..4)
            .map(|_| {
                let sem = sem.clone();
                thread::spawn(move || sem.post())
            })
            .collect();
        sem.wait_value(4);
        assert_eq!(sem.value(), 4);
        for p in posters {
            p.join().unwrap();
        }
    }

    #[test]
    fn spinlock_excludes() {
        let lock = Arc::new(SpinLock::new());
        let counter = Arc::new(Mutex::new(0u32));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let _g = lock.lock();
                        *counter.lock().unwrap() += 1;
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*counter.lock().unwrap(), 4000);
    }
}
