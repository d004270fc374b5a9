//! The worker group: process-wide root of the engine.
//!
//! Initialized once before any worker polls, immutable in its array layout
//! afterwards. Mutable subfields keep to their own regimes: `conn_num` is
//! atomic and scanned under the placement spinlock, port tables are atomic
//! bytes, the worker array is sealed before the go barrier drops. There are
//! no true globals; the process-default group behind `set_default` exists
//! for the POSIX shim and is just an `Arc` like any other.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use once_cell::sync::OnceCell;

use crate::config::RuntimeConfig;
use crate::dev::{PollDev, RingDev};
use crate::error::{Error, Result};
use crate::flow::{FlowProgrammer, FlowTable, NullProgrammer};
use crate::inet::{Inet, LoopInet};
use crate::mbuf::PktBuf;
use crate::rpc::{RpcReq, RpcResult};
use crate::sock::SockTable;
use crate::stack::{Stack, StackRole};
use crate::sync::{Semaphore, SpinLock};
use crate::wakeup::WakeupPoll;

/// Sentinel for "no process owns this port".
pub const INVALID_PROCESS_IDX: u8 = u8::MAX;

/// Epoll descriptors live in their own range, far above socket descriptors.
pub const EPOLL_FD_BASE: i32 = 1 << 20;

/// 65,536-wide port ownership table; one byte per port, sentinel when free.
pub struct PortTable {
    slots: Box<[AtomicU8]>,
}

impl PortTable {
    pub fn new() -> PortTable {
        let slots: Vec<AtomicU8> = (0..=u16::MAX as usize)
            .map(|_| AtomicU8::new(INVALID_PROCESS_IDX))
            .collect();
        PortTable {
            slots: slots.into_boxed_slice(),
        }
    }

    pub fn get(&self, port: u16) -> Option<u8> {
        let v = self.slots[port as usize].load(Ordering::Acquire);
        (v != INVALID_PROCESS_IDX).then_some(v)
    }

    pub fn set(&self, port: u16, process_idx: u8) {
        self.slots[port as usize].store(process_idx, Ordering::Release);
    }

    pub fn clear(&self, port: u16) {
        self.slots[port as usize].store(INVALID_PROCESS_IDX, Ordering::Release);
    }
}

impl Default for PortTable {
    fn default() -> Self {
        PortTable::new()
    }
}

/// Collaborator factories handed to each worker at init. The defaults wire a
/// detached ring device and the loopback stack, which is enough for a single
/// process without hardware.
pub struct RunOpts {
    pub dev_factory: Box<dyn Fn(u16) -> Box<dyn PollDev> + Send + Sync>,
    pub inet_factory: Box<dyn Fn(u16) -> Box<dyn Inet> + Send + Sync>,
    pub flow_programmer: Box<dyn FlowProgrammer>,
}

impl RunOpts {
    pub fn new() -> RunOpts {
        RunOpts::default()
    }
}

impl Default for RunOpts {
    fn default() -> Self {
        RunOpts {
            dev_factory: Box::new(|_queue_id| Box::new(RingDev::detached(512))),
            inet_factory: Box::new(|_queue_id| Box::new(LoopInet::new())),
            flow_programmer: Box::new(NullProgrammer::default()),
        }
    }
}

thread_local! {
    /// Sticky worker binding: an application thread keeps creating sockets on
    /// the worker it first landed on. Tagged with the group id so a thread
    /// that outlives one group does not drag its binding into the next.
    static BIND_STACK: Cell<Option<(u64, usize)>> = const { Cell::new(None) };
}

static NEXT_GROUP_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

pub struct StackGroup {
    id: u64,
    pub cfg: RuntimeConfig,
    pub socktab: SockTable,
    /// Staging area workers register into during init.
    reg: Mutex<Vec<Option<Arc<Stack>>>>,
    /// Sealed, read-only worker array; populated before the go barrier.
    sealed: OnceCell<Vec<Arc<Stack>>>,
    /// Guards the min-`conn_num` placement scan. The round-robin path never
    /// takes it.
    pub placement_lock: SpinLock,
    round_robin: AtomicU16,
    pub listen_ports: PortTable,
    pub user_ports: PortTable,
    pub flow_table: FlowTable,
    /// Wake-polls currently alive in this process; diagnostic.
    pub poll_list: Mutex<Vec<Weak<WakeupPoll>>>,
    /// Live epoll descriptors handed out by the shim.
    epolls: Mutex<std::collections::HashMap<crate::sock::Fd, Arc<WakeupPoll>>>,
    next_epfd: std::sync::atomic::AtomicI32,
    pub sem_phase1: Semaphore,
    pub sem_ethdev: Semaphore,
    pub sem_all_init: Semaphore,
    pub sem_listen: Semaphore,
    pub sem_go: Semaphore,
    pub init_fail: AtomicBool,
    pub latency_start: AtomicBool,
    running: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

static DEFAULT_GROUP: OnceCell<Arc<StackGroup>> = OnceCell::new();

/// Install the process-default group the POSIX shim operates on.
pub fn set_default(group: Arc<StackGroup>) -> std::result::Result<(), Arc<StackGroup>> {
    DEFAULT_GROUP.set(group)
}

pub fn default_group() -> Option<Arc<StackGroup>> {
    DEFAULT_GROUP.get().cloned()
}

impl StackGroup {
    /// Run the staged init state machine and return the live group.
    ///
    /// 1. validate config, prepare the run dir (primary only);
    /// 2. spawn `stack_num` workers, each of which spawns its helper;
    /// 3. wait for `stack_num * 2` phase-1 posts, release the device barrier;
    /// 4. wait for every worker's all-init post, abort on `init_fail`;
    /// 5. seal the array, start the bridge listener, drop the go barrier.
    pub fn start(cfg: RuntimeConfig, opts: RunOpts) -> Result<Arc<StackGroup>> {
        cfg.validate()?;
        if cfg.is_primary {
            crate::bridge::prepare_run_dir(&cfg)?;
        }

        let stack_num = cfg.stack_num();
        let group = Arc::new(StackGroup {
            id: NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed),
            socktab: SockTable::new(
                crate::sock::FD_BASE as usize * 4,
                cfg.ring_size,
            ),
            reg: Mutex::new(vec![None; stack_num]),
            sealed: OnceCell::new(),
            placement_lock: SpinLock::new(),
            round_robin: AtomicU16::new(0),
            listen_ports: PortTable::new(),
            user_ports: PortTable::new(),
            flow_table: FlowTable::new(opts.flow_programmer),
            poll_list: Mutex::new(Vec::new()),
            epolls: Mutex::new(std::collections::HashMap::new()),
            next_epfd: std::sync::atomic::AtomicI32::new(EPOLL_FD_BASE),
            sem_phase1: Semaphore::new(),
            sem_ethdev: Semaphore::new(),
            sem_all_init: Semaphore::new(),
            sem_listen: Semaphore::new(),
            sem_go: Semaphore::new(),
            init_fail: AtomicBool::new(false),
            latency_start: AtomicBool::new(cfg.latency_trace),
            running: AtomicBool::new(true),
            threads: Mutex::new(Vec::new()),
            cfg,
        });

        let opts = Arc::new(StackFactories {
            dev_factory: opts.dev_factory,
            inet_factory: opts.inet_factory,
        });

        for idx in 0..stack_num {
            match crate::stack::spawn_stack(group.clone(), idx, opts.clone()) {
                Ok(handle) => group.threads.lock().unwrap().push(handle),
                Err(e) => {
                    // release the workers already spawned before bailing out
                    group.init_fail.store(true, Ordering::Release);
                    group.sem_ethdev.post();
                    group.stop();
                    return Err(e);
                }
            }
        }

        // workers and their helpers each post once
        group.sem_phase1.wait_value(stack_num * 2);
        group.sem_ethdev.post();
        group.sem_all_init.wait_value(stack_num);

        if group.init_fail.load(Ordering::Acquire) {
            group.stop();
            return Err(Error::InitFail);
        }

        let stacks: Vec<Arc<Stack>> = {
            let reg = group.reg.lock().unwrap();
            reg.iter()
                .map(|s| s.clone().ok_or(Error::InitFail))
                .collect::<Result<_>>()?
        };
        group
            .sealed
            .set(stacks)
            .map_err(|_| Error::InitFail)?;

        if group.cfg.num_process > 1 {
            let bridged = crate::bridge::start_listener(group.clone())
                .map(|handle| group.threads.lock().unwrap().push(handle))
                .and_then(|_| {
                    group.sem_listen.wait_value(1);
                    if group.cfg.is_primary {
                        Ok(())
                    } else {
                        crate::bridge::check_primary_stack_num(&group)
                    }
                });
            if let Err(e) = bridged {
                group.stop();
                return Err(e);
            }
        }

        for _ in 0..stack_num {
            group.sem_go.post();
        }

        log::info!(
            "stack group up: {} workers, process {}/{}",
            stack_num,
            group.cfg.process_idx,
            group.cfg.num_process
        );
        Ok(group)
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Tear the group down: workers and helpers exit, threads are joined.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        // unblock anyone still at the go barrier
        for _ in 0..self.stack_num_cfg() {
            self.sem_go.post();
        }
        if let Some(stacks) = self.sealed.get() {
            for s in stacks {
                s.kernel_sink.stop();
            }
        } else {
            let reg = self.reg.lock().unwrap();
            for s in reg.iter().flatten() {
                s.kernel_sink.stop();
            }
        }
        let threads: Vec<JoinHandle<()>> = self.threads.lock().unwrap().drain(..).collect();
        for t in threads {
            let _ = t.join();
        }
        // a worker that registered mid-teardown still has a parked helper
        let reg = self.reg.lock().unwrap();
        for s in reg.iter().flatten() {
            s.kernel_sink.stop();
        }
    }

    fn stack_num_cfg(&self) -> usize {
        self.cfg.stack_num()
    }

    pub fn stack_num(&self) -> usize {
        match self.sealed.get() {
            Some(s) => s.len(),
            None => self.stack_num_cfg(),
        }
    }

    pub fn register_stack(&self, idx: usize, stack: Arc<Stack>) {
        self.reg.lock().unwrap()[idx] = Some(stack);
    }

    pub fn stacks(&self) -> &[Arc<Stack>] {
        self.sealed.get().map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn stack(&self, idx: usize) -> Option<Arc<Stack>> {
        if let Some(sealed) = self.sealed.get() {
            return sealed.get(idx).cloned();
        }
        self.reg.lock().unwrap().get(idx).and_then(|s| s.clone())
    }

    /// Synchronous RPC to worker `idx`.
    pub fn rpc_call(&self, idx: usize, req: RpcReq) -> RpcResult {
        match self.stack(idx) {
            Some(stack) => stack.rpc.call(req),
            None => Err(crate::error::Errno::BADF),
        }
    }

    /// Worker with the fewest owned connections, restricted to recv-capable
    /// workers in split mode. Ties break toward the lowest index.
    pub fn min_conn_stack(&self) -> usize {
        let mut min_idx = 0;
        let mut min_conn = u32::MAX;
        for (i, stack) in self.stacks().iter().enumerate() {
            if self.cfg.split_send_recv && stack.role == StackRole::Send {
                continue;
            }
            let conn = stack.conn_num.load(Ordering::Acquire);
            if conn < min_conn {
                min_idx = i;
                min_conn = conn;
            }
        }
        min_idx
    }

    /// Select the worker that will own a new socket.
    ///
    /// Sticky per application thread. First placement: round-robin on an
    /// atomic counter (lock-free, wrapping) unless tuple filtering or listen
    /// shadowing is on, in which case the least-loaded worker wins under the
    /// placement lock. The chosen worker's `conn_num` is bumped here.
    pub fn get_bind_stack(&self) -> Option<Arc<Stack>> {
        let stacks = self.stacks();
        if stacks.is_empty() {
            return None;
        }

        if let Some((gid, idx)) = BIND_STACK.with(|b| b.get()) {
            if gid == self.id {
                let stack = stacks.get(idx)?;
                stack.conn_num.fetch_add(1, Ordering::AcqRel);
                return Some(stack.clone());
            }
        }

        let idx = if !self.cfg.tuple_filter && !self.cfg.listen_shadow {
            self.round_robin.fetch_add(1, Ordering::AcqRel) as usize % stacks.len()
        } else {
            let _guard = self.placement_lock.lock();
            let mut best = None;
            let mut min_conn = u32::MAX;
            for (i, stack) in stacks.iter().enumerate() {
                if self.cfg.split_send_recv && stack.role != StackRole::Send {
                    continue;
                }
                let conn = stack.conn_num.load(Ordering::Acquire);
                if conn < min_conn {
                    best = Some(i);
                    min_conn = conn;
                }
            }
            best?
        };

        let stack = stacks.get(idx)?;
        stack.conn_num.fetch_add(1, Ordering::AcqRel);
        BIND_STACK.with(|b| b.set(Some((self.id, idx))));
        Some(stack.clone())
    }

    /// Duplicate an ARP frame into every peer worker's own pool and inject it
    /// over RPC. Best-effort: an allocation failure counts and drops that
    /// copy. `cur_idx` is skipped according to the self-loop policy.
    pub fn broadcast_arp(&self, cur_idx: usize, frame: &PktBuf) {
        for (i, stack) in self.stacks().iter().enumerate() {
            if i == cur_idx && !self.cfg.arp_loop_to_self {
                continue;
            }
            match stack.pool.alloc_copy(frame) {
                Some(copy) => stack.rpc.cast(RpcReq::PktIn(copy)),
                None => {
                    stack.stats.arp_copy_fail.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Ask every worker to drop its linkage of `wakeup`. Fire-and-forget;
    /// failures are swallowed, the linkage flags make retries idempotent.
    pub fn broadcast_clean_epoll(&self, wakeup: &Arc<WakeupPoll>) {
        for stack in self.stacks() {
            stack.rpc.cast(RpcReq::CleanEpoll {
                wakeup: wakeup.clone(),
            });
        }
    }

    /// Drop the calling thread's sticky binding (test hook).
    pub fn reset_thread_binding() {
        BIND_STACK.with(|b| b.set(None));
    }

    /// Register a new epoll surface, returning its descriptor.
    pub fn register_epoll(&self, wakeup: Arc<WakeupPoll>) -> crate::sock::Fd {
        let epfd = self
            .next_epfd
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        self.poll_list.lock().unwrap().push(Arc::downgrade(&wakeup));
        self.epolls.lock().unwrap().insert(epfd, wakeup);
        epfd
    }

    pub fn epoll(&self, epfd: crate::sock::Fd) -> Option<Arc<WakeupPoll>> {
        self.epolls.lock().unwrap().get(&epfd).cloned()
    }

    pub fn remove_epoll(&self, epfd: crate::sock::Fd) -> Option<Arc<WakeupPoll>> {
        let wakeup = self.epolls.lock().unwrap().remove(&epfd);
        self.poll_list
            .lock()
            .unwrap()
            .retain(|w| w.upgrade().is_some());
        wakeup
    }
}

impl Drop for StackGroup {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// The factories workers pull their collaborators from.
pub struct StackFactories {
    pub dev_factory: Box<dyn Fn(u16) -> Box<dyn PollDev> + Send + Sync>,
    pub inet_factory: Box<dyn Fn(u16) -> Box<dyn Inet> + Send + Sync>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_table_boundaries_are_addressable() {
        let t = PortTable::new();
        assert_eq!(t.get(0), None);
        assert_eq!(t.get(65535), None);
        t.set(0, 3);
        t.set(65535, 7);
        assert_eq!(t.get(0), Some(3));
        assert_eq!(t.get(65535), Some(7));
    }

    #[test]
    fn clearing_a_port_restores_the_sentinel() {
        let t = PortTable::new();
        t.set(8080, 1);
        assert_eq!(t.get(8080), Some(1));
        t.clear(8080);
        assert_eq!(t.get(8080), None);
        // delete-after-delete is a no-op
        t.clear(8080);
        assert_eq!(t.get(8080), None);
    }

    #[test]
    fn sentinel_value_is_not_a_valid_owner() {
        let t = PortTable::new();
        t.set(80, INVALID_PROCESS_IDX);
        assert_eq!(t.get(80), None);
    }
}
