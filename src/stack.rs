//! The worker: one CPU-pinned protocol-stack thread per assigned core.
//!
//! A worker owns its TCP/IP instance, its device handle and its packet pool;
//! nothing else touches them. Everything the rest of the process wants done
//! on this worker arrives through the RPC ring and is executed inline in the
//! poll loop, which is what makes TCP/IP state single-threaded.
//!
//! Phase order in the loop is normative: draining RPC before polling the NIC
//! guarantees that RPC-installed state (a freshly accepted connection, a new
//! listener) is visible before the next RX burst can reference it. A worker
//! never yields to another worker; it only sleeps in the idle governor.

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

use crate::dev::PollDev;
use crate::dispatch::{self, Steer};
use crate::error::{Errno, Error, Result};
use crate::group::{StackFactories, StackGroup};
use crate::inet::{ConnId, Inet, InetEvent};
use crate::mbuf::{PktBuf, PktPool};
use crate::power::{low_power_idling, LowPowerCfg, LowPowerState};
use crate::rpc::{RpcMsg, RpcReq, RpcRet, RpcRing};
use crate::sock::{Fd, EV_IN};
use crate::stats::StackStats;
use crate::wakeup::{KernelSink, WakeupPoll};

const KERNEL_EVENT_SPIN: Duration = Duration::from_micros(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackRole {
    Unified,
    Send,
    Recv,
}

/// The shared face of a worker: what application threads and peer workers
/// may touch. The mutable bulk (TCP/IP instance, device, tx staging) lives
/// on the worker thread's stack and never escapes.
pub struct Stack {
    pub stack_idx: usize,
    /// Matches the NIC queue this worker polls and the flow-rule destination.
    pub queue_id: u16,
    pub cpu_id: u32,
    pub numa_node: usize,
    pub role: StackRole,
    /// Owned flows; placement and accept bump it, close drops it.
    pub conn_num: AtomicU32,
    pub low_power: AtomicBool,
    pub stats: StackStats,
    pub rpc: RpcRing,
    pub pool: PktPool,
    pub kernel_sink: KernelSink,
    /// Wake-polls with pending events, signalled every 16 iterations.
    pub wakeup_list: Mutex<Vec<Arc<WakeupPoll>>>,
    /// Same-NUMA-node shortcut ring, drained every 256 iterations.
    pub same_node_rx: crate::ring::Ring<PktBuf>,
}

/// Worker-private state; lives and dies on the worker thread.
struct StackCtx {
    inet: Box<dyn Inet>,
    dev: Box<dyn PollDev>,
    conn_fd: HashMap<ConnId, Fd>,
    tx_pending: Vec<PktBuf>,
    rx_scratch: Vec<PktBuf>,
    /// Connections with data the mailbox could not absorb; retried first.
    carry: Vec<ConnId>,
    lpm: LowPowerState,
}

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

pub fn now_ns() -> u64 {
    EPOCH.elapsed().as_nanos() as u64
}

pub(crate) fn spawn_stack(
    group: Arc<StackGroup>,
    idx: usize,
    facts: Arc<StackFactories>,
) -> Result<JoinHandle<()>> {
    let cfg = &group.cfg;
    let (_, role) = cfg.worker_cpu(idx);
    let name = match role {
        StackRole::Unified => format!("stack_{:02}", idx),
        StackRole::Recv => format!("stack_recv_{}_{}", cfg.process_idx, idx / 2),
        StackRole::Send => format!("stack_send_{}_{}", cfg.process_idx, idx / 2),
    };
    thread::Builder::new()
        .name(name)
        .spawn(move || stack_main(group, idx, facts))
        .map_err(Error::Io)
}

fn stack_main(group: Arc<StackGroup>, idx: usize, facts: Arc<StackFactories>) {
    let cfg = group.cfg.clone();
    let (cpu_id, role) = cfg.worker_cpu(idx);
    let queue_id = cfg.process_idx as u16 * cfg.num_queue() + idx as u16;
    let numa_node = numa_node_of_cpu(cpu_id);

    let kernel_sink = match KernelSink::new() {
        Ok(s) => s,
        Err(e) => {
            log::error!("stack_{:02}: kernel sink init failed: {}", idx, e);
            group.init_fail.store(true, Ordering::Release);
            // helper was never created, post its share too
            group.sem_phase1.post();
            group.sem_phase1.post();
            group.sem_all_init.post();
            return;
        }
    };

    let stack = Arc::new(Stack {
        stack_idx: idx,
        queue_id,
        cpu_id,
        numa_node,
        role,
        conn_num: AtomicU32::new(0),
        low_power: AtomicBool::new(false),
        stats: StackStats::default(),
        rpc: RpcRing::new(cfg.ring_size),
        pool: PktPool::new(cfg.mbufs_per_pool(), numa_node),
        kernel_sink,
        wakeup_list: Mutex::new(Vec::new()),
        same_node_rx: crate::ring::Ring::new(cfg.ring_size),
    });
    group.register_stack(idx, stack.clone());

    if spawn_kernel_event_thread(group.clone(), stack.clone()).is_err() {
        group.init_fail.store(true, Ordering::Release);
        group.sem_phase1.post();
        group.sem_phase1.post();
        group.sem_all_init.post();
        return;
    }

    if !core_affinity::set_for_current(core_affinity::CoreId {
        id: cpu_id as usize,
    }) {
        // survivable in containers with a restricted cpuset
        log::warn!("stack_{:02}: could not pin to cpu {}", idx, cpu_id);
    }

    let inet = (facts.inet_factory)(queue_id);

    group.sem_phase1.post();
    // non-primary device bring-up trails the primary's ethdev
    group.sem_ethdev.wait_value(1);

    let dev = (facts.dev_factory)(queue_id);

    group.sem_all_init.post();
    log::info!("stack_{:02} init success, queue {}", idx, queue_id);

    group.sem_go.wait_value(1);

    let ctx = StackCtx {
        inet,
        dev,
        conn_fd: HashMap::new(),
        tx_pending: Vec::new(),
        rx_scratch: Vec::new(),
        carry: Vec::new(),
        lpm: LowPowerState::new(),
    };
    poll_loop(&group, &stack, ctx);
}

fn spawn_kernel_event_thread(group: Arc<StackGroup>, stack: Arc<Stack>) -> Result<()> {
    let name = format!("kernelev_{:02}", stack.stack_idx);
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            // NUMA-pinned to the worker's node, deliberately not CPU-pinned
            bind_to_node(stack.numa_node);
            group.sem_phase1.post();
            log::info!("kernelevent_{:02} start", stack.stack_idx);
            while group.running() {
                if !stack.kernel_sink.block_collect() {
                    break;
                }
                while stack.kernel_sink.pending_n.load(Ordering::Acquire) > 0
                    && group.running()
                {
                    thread::sleep(KERNEL_EVENT_SPIN);
                }
            }
        })
        .map(|_| ())
        .map_err(Error::Io)
}

/// The worker main loop; phase order is load-bearing (see module docs).
fn poll_loop(group: &Arc<StackGroup>, stack: &Arc<Stack>, mut ctx: StackCtx) {
    let cfg = &group.cfg;
    let rpc_number = cfg.rpc_number as usize;
    let nic_read_number = cfg.nic_read_number as usize;
    let read_connect_number = cfg.read_connect_number as usize;
    let kernel_tap = cfg.kernel_tap;
    let same_node = cfg.same_node_fastpath;
    let lpm_cfg = LowPowerCfg {
        rx_pkts: cfg.lpm_rx_pkts,
        detect_ms: cfg.lpm_detect_ms,
        pkts_in_detect: cfg.lpm_pkts_in_detect,
    };
    let mut tick: u64 = 0;

    while group.running() {
        // 1. RPC drain: TCP/IP operations always run here, on the owner
        poll_rpc(group, stack, &mut ctx, rpc_number);

        // 2. NIC RX
        eth_dev_poll(group, stack, &mut ctx, nic_read_number);

        // 3. same-node shortcut
        if same_node && tick & 0xff == 0 {
            while let Some(pkt) = stack.same_node_rx.pop() {
                stack_input(stack, &mut ctx, pkt);
            }
        }

        // 4. socket receive fan-out
        read_recv_list(group, stack, &mut ctx, read_connect_number);

        // 5. TX flush; the unsent tail stays queued
        ctx.inet.tx_drain(&stack.pool, &mut ctx.tx_pending);
        if !ctx.tx_pending.is_empty() {
            let sent = ctx.dev.tx_xmit(&mut ctx.tx_pending);
            stack.stats.tx.fetch_add(sent as u64, Ordering::Relaxed);
        }

        // 6. wake delivery
        if tick & 0xf == 0 {
            wakeup_kernel_event(stack);
            wakeup_stack_epoll(stack);
        }

        // 7. control-plane tap; low-rate, queue 0 only
        if kernel_tap && stack.queue_id == 0 && tick & 0xfff == 0 {
            ctx.dev.handle_tap_requests();
            tap_handle_rx(stack, &mut ctx);
        }

        tick += 1;

        // 8. timers
        ctx.inet.timer_tick(now_ns() / 1_000_000);

        // 9. idle governor
        if cfg.low_power_mode {
            low_power_idling(
                &lpm_cfg,
                ctx.dev.queue_depth(),
                stack.stats.rx.load(Ordering::Relaxed),
                &mut ctx.lpm,
                &stack.low_power,
            );
        }
    }
    log::info!("stack_{:02} exiting", stack.stack_idx);
}

fn poll_rpc(group: &Arc<StackGroup>, stack: &Arc<Stack>, ctx: &mut StackCtx, max: usize) {
    for _ in 0..max {
        let Some(msg) = stack.rpc.pop() else { break };
        handle_rpc(group, stack, ctx, msg);
    }
}

fn handle_rpc(group: &Arc<StackGroup>, stack: &Arc<Stack>, ctx: &mut StackCtx, msg: RpcMsg) {
    stack.stats.call_msg_cnt.fetch_add(1, Ordering::Relaxed);
    let RpcMsg { req, done } = msg;
    let result = dispatch_rpc(group, stack, ctx, req);
    if let Some(done) = done {
        done.complete(result);
    } else if let Err(e) = result {
        log::debug!("stack_{:02}: async rpc failed: {}", stack.stack_idx, e);
    }
}

fn dispatch_rpc(
    group: &Arc<StackGroup>,
    stack: &Arc<Stack>,
    ctx: &mut StackCtx,
    req: RpcReq,
) -> std::result::Result<RpcRet, Errno> {
    match req {
        RpcReq::PktIn(pkt) => {
            stack_input(stack, ctx, pkt);
            Ok(RpcRet::Unit)
        }

        RpcReq::Socket => {
            // allocation may transiently fail; one retry before giving up
            let conn = match ctx.inet.socket() {
                Ok(c) => c,
                Err(_) => ctx.inet.socket()?,
            };
            let entry = match group.socktab.alloc(stack.stack_idx) {
                Ok(e) => e,
                Err(e) => {
                    let _ = ctx.inet.close(conn);
                    return Err(e);
                }
            };
            *entry.conn.lock().unwrap() = Some(conn);
            entry.counted.store(true, Ordering::Release);
            ctx.conn_fd.insert(conn, entry.fd);
            Ok(RpcRet::Fd(entry.fd))
        }

        RpcReq::Close { fd } => {
            let entry = group.socktab.get(fd)?;
            if let Ok(conn) = entry.conn_id() {
                let _ = ctx.inet.close(conn);
                ctx.conn_fd.remove(&conn);
            }
            if entry.counted.load(Ordering::Acquire) {
                stack.conn_num.fetch_sub(1, Ordering::AcqRel);
            }
            group.socktab.release(fd);
            Ok(RpcRet::Unit)
        }

        RpcReq::Bind { fd, addr } => {
            let entry = group.socktab.get(fd)?;
            ctx.inet.bind(entry.conn_id()?, addr)?;
            entry.inner.lock().unwrap().bound = Some(addr);
            Ok(RpcRet::Unit)
        }

        RpcReq::Listen { fd, backlog } => {
            let entry = group.socktab.get(fd)?;
            ctx.inet.listen(entry.conn_id()?, backlog)?;
            entry.inner.lock().unwrap().is_listener = true;
            Ok(RpcRet::Unit)
        }

        RpcReq::Accept { fd, nonblock } => {
            let entry = group.socktab.get(fd)?;
            let listener_conn = entry.conn_id()?;
            let (conn, peer) = ctx.inet.accept(listener_conn)?;

            let new_entry = match group.socktab.alloc(stack.stack_idx) {
                Ok(e) => e,
                Err(e) => {
                    let _ = ctx.inet.close(conn);
                    return Err(e);
                }
            };
            *new_entry.conn.lock().unwrap() = Some(conn);
            new_entry.counted.store(true, Ordering::Release);
            new_entry.inner.lock().unwrap().nonblock = nonblock;
            ctx.conn_fd.insert(conn, new_entry.fd);
            stack.conn_num.fetch_add(1, Ordering::AcqRel);

            // data may have raced ahead of the accept
            if ctx.inet.recv_pending(conn) {
                ctx.carry.push(conn);
            }
            entry
                .acceptable
                .store(ctx.inet.acceptable(listener_conn), Ordering::Release);

            // steer the rest of this flow straight to our queue
            if group.cfg.tuple_filter {
                if let Ok(local) = ctx.inet.local_addr(conn) {
                    let spec = crate::dev::FlowSpec {
                        src_ip: u32::from(*peer.ip()),
                        dst_ip: u32::from(*local.ip()),
                        src_port: peer.port(),
                        dst_port: local.port(),
                        queue_id: stack.queue_id,
                    };
                    if let Err(e) = crate::bridge::install_flow(group, &spec) {
                        log::error!(
                            "flow rule for accepted conn on stack_{:02}: {}",
                            stack.stack_idx,
                            e
                        );
                    }
                }
            }
            Ok(RpcRet::Fd(new_entry.fd))
        }

        RpcReq::Connect { fd, addr } => {
            let entry = group.socktab.get(fd)?;
            ctx.inet.connect(entry.conn_id()?, addr)?;
            Ok(RpcRet::Unit)
        }

        RpcReq::GetPeerName { fd } => {
            let entry = group.socktab.get(fd)?;
            Ok(RpcRet::Addr(ctx.inet.peer_addr(entry.conn_id()?)?))
        }

        RpcReq::GetSockName { fd } => {
            let entry = group.socktab.get(fd)?;
            Ok(RpcRet::Addr(ctx.inet.local_addr(entry.conn_id()?)?))
        }

        RpcReq::GetSockOpt { fd, level, name } => {
            let entry = group.socktab.get(fd)?;
            Ok(RpcRet::Int(ctx.inet.getsockopt(
                entry.conn_id()?,
                level,
                name,
            )?))
        }

        RpcReq::SetSockOpt {
            fd,
            level,
            name,
            value,
        } => {
            let entry = group.socktab.get(fd)?;
            ctx.inet.setsockopt(entry.conn_id()?, level, name, value)?;
            Ok(RpcRet::Unit)
        }

        RpcReq::Fcntl { fd, cmd, arg } => {
            let entry = group.socktab.get(fd)?;
            match cmd {
                libc::F_GETFL => {
                    let nonblock = entry.inner.lock().unwrap().nonblock;
                    Ok(RpcRet::Int(if nonblock {
                        libc::O_NONBLOCK as i64
                    } else {
                        0
                    }))
                }
                libc::F_SETFL => {
                    entry.inner.lock().unwrap().nonblock =
                        arg & libc::O_NONBLOCK as i64 != 0;
                    Ok(RpcRet::Int(0))
                }
                _ => Err(Errno::INVAL),
            }
        }

        RpcReq::Ioctl { fd, cmd, arg } => {
            let entry = group.socktab.get(fd)?;
            if cmd == libc::FIONBIO as i64 {
                entry.inner.lock().unwrap().nonblock = arg != 0;
                Ok(RpcRet::Int(0))
            } else {
                Err(Errno::INVAL)
            }
        }

        RpcReq::Recv { fd, max } => {
            let entry = group.socktab.get(fd)?;
            Ok(RpcRet::Bytes(ctx.inet.recv(entry.conn_id()?, max)?))
        }

        RpcReq::Send { fd, data } => {
            let entry = group.socktab.get(fd)?;
            let n = ctx.inet.send(entry.conn_id()?, &data)?;
            Ok(RpcRet::Int(n as i64))
        }

        RpcReq::ShadowFd { fd: _, addr } => {
            let conn = ctx.inet.socket()?;
            if let Err(e) = ctx.inet.bind(conn, addr) {
                let _ = ctx.inet.close(conn);
                return Err(e);
            }
            let entry = match group.socktab.alloc(stack.stack_idx) {
                Ok(e) => e,
                Err(e) => {
                    let _ = ctx.inet.close(conn);
                    return Err(e);
                }
            };
            *entry.conn.lock().unwrap() = Some(conn);
            entry.inner.lock().unwrap().bound = Some(addr);
            // shadows are not counted: conn_num tracks owned flows only
            ctx.conn_fd.insert(conn, entry.fd);
            Ok(RpcRet::Fd(entry.fd))
        }

        RpcReq::CleanEpoll { wakeup } => {
            let mut list = stack.wakeup_list.lock().unwrap();
            list.retain(|w| !Arc::ptr_eq(w, &wakeup));
            wakeup.unlink(stack.stack_idx);
            Ok(RpcRet::Unit)
        }

        RpcReq::ArpLookup { ip } => Ok(RpcRet::Mac(ctx.inet.arp_lookup(ip))),
    }
}

/// Feed a frame into this worker's TCP/IP instance. The buffer returns to
/// its pool on drop; chained frames are flattened first.
fn stack_input(stack: &Arc<Stack>, ctx: &mut StackCtx, pkt: PktBuf) {
    if pkt.timestamp() != 0 {
        stack
            .stats
            .latency
            .record(now_ns().saturating_sub(pkt.timestamp()));
    }
    if pkt.pkt_len() == pkt.len() {
        ctx.inet.input(pkt.data());
    } else {
        ctx.inet.input(&pkt.to_vec());
    }
}

fn eth_dev_poll(group: &Arc<StackGroup>, stack: &Arc<Stack>, ctx: &mut StackCtx, max: usize) {
    debug_assert!(ctx.rx_scratch.is_empty());
    let n = ctx.dev.rx_poll(&mut ctx.rx_scratch, max);
    if n == 0 {
        return;
    }

    let stamp = group.latency_start.load(Ordering::Relaxed);
    if stamp {
        let ts = now_ns();
        for pkt in ctx.rx_scratch.iter_mut() {
            pkt.set_timestamp(ts);
        }
    }

    // behind a co-process forwarder, ARP fan-out and steering already
    // happened before the frame reached our ring
    let direct_nic = !group.cfg.use_forwarder;
    let tuple_filter = group.cfg.tuple_filter;
    for pkt in std::mem::take(&mut ctx.rx_scratch) {
        if direct_nic && crate::packet::is_arp(pkt.data()) {
            group.broadcast_arp(stack.stack_idx, &pkt);
            let unicast = crate::packet::ether_dst(pkt.data())
                .map(|d| d != crate::packet::MAC_BROADCAST)
                .unwrap_or(false);
            if group.cfg.num_process > 1 && unicast {
                // peers take it from the shared segment; the original goes
                // back to the kernel
                crate::bridge::transfer_arp_to_peers(group, &pkt);
                tap_forward(stack, ctx, pkt);
            } else {
                stack_input(stack, ctx, pkt);
            }
        } else if direct_nic && tuple_filter && stack.queue_id == 0 {
            match dispatch::steer(group, stack, pkt) {
                Steer::Local(pkt) => stack_input(stack, ctx, pkt),
                Steer::Forwarded => {}
                Steer::Kernel(pkt) => tap_forward(stack, ctx, pkt),
            }
        } else {
            stack_input(stack, ctx, pkt);
        }
    }

    stack.stats.rx.fetch_add(n as u64, Ordering::Relaxed);
}

fn tap_forward(stack: &Arc<Stack>, ctx: &mut StackCtx, pkt: PktBuf) {
    if ctx.dev.tap_tx_burst(pkt) {
        stack.stats.kernel_forward.fetch_add(1, Ordering::Relaxed);
    } else {
        stack.stats.rx_drop.fetch_add(1, Ordering::Relaxed);
    }
}

/// Forward frames the kernel queued on the tap out through the NIC.
fn tap_handle_rx(stack: &Arc<Stack>, ctx: &mut StackCtx) {
    let mut burst = Vec::new();
    let n = ctx.dev.tap_rx_burst(&mut burst, 32);
    if n == 0 {
        return;
    }
    let sent = ctx.dev.tx_xmit(&mut burst);
    stack.stats.tx.fetch_add(sent as u64, Ordering::Relaxed);
    // whatever the NIC would not take is dropped, as the kernel will resend
    stack
        .stats
        .tx_drop
        .fetch_add((n - sent) as u64, Ordering::Relaxed);
}

/// Deliver ready connections into application-visible mailboxes and flag
/// readiness on the owning socket records.
fn read_recv_list(group: &Arc<StackGroup>, stack: &Arc<Stack>, ctx: &mut StackCtx, max: usize) {
    let mut events: Vec<InetEvent> = Vec::new();
    for conn in std::mem::take(&mut ctx.carry) {
        events.push(InetEvent::Readable { conn });
    }
    ctx.inet.poll_events(max, &mut events);

    for ev in events {
        match ev {
            InetEvent::Readable { conn } => {
                let Some(&fd) = ctx.conn_fd.get(&conn) else { continue };
                let Ok(sock) = group.socktab.get(fd) else { continue };
                let mut delivered = false;
                loop {
                    if sock.recvbox.len() >= sock.recvbox.capacity() {
                        // mailbox full: keep the rest queued in the stack
                        ctx.carry.push(conn);
                        break;
                    }
                    match ctx.inet.recv(conn, crate::mbuf::FRAME_MAX_LEN) {
                        Ok(data) if data.is_empty() => {
                            sock.inner.lock().unwrap().eof = true;
                            delivered = true;
                            break;
                        }
                        Ok(data) => {
                            let _ = sock.recvbox.push(data);
                            delivered = true;
                        }
                        Err(_) => break,
                    }
                }
                if delivered {
                    stack.stats.read_events.fetch_add(1, Ordering::Relaxed);
                    post_socket_event(stack, &sock, EV_IN);
                }
            }
            InetEvent::Acceptable { conn } => {
                let Some(&fd) = ctx.conn_fd.get(&conn) else { continue };
                let Ok(sock) = group.socktab.get(fd) else { continue };
                sock.acceptable.store(true, Ordering::Release);
                stack.stats.accept_events.fetch_add(1, Ordering::Relaxed);
                post_socket_event(stack, &sock, EV_IN);
            }
        }
    }
}

fn post_socket_event(stack: &Arc<Stack>, sock: &Arc<crate::sock::SockEntry>, bits: u32) {
    sock.post_events(bits);
    if let Some(wakeup) = sock.wakeup() {
        if wakeup.closed.load(Ordering::Acquire) {
            return;
        }
        if wakeup.push_ready(sock.fd, stack.stack_idx) {
            stack.wakeup_list.lock().unwrap().push(wakeup);
        }
    }
}

/// Fold kernel epoll results parked by the helper into their wake-polls.
fn wakeup_kernel_event(stack: &Arc<Stack>) {
    for (wakeup, data, events) in stack.kernel_sink.take_pending() {
        if wakeup.push_kernel(data, events, stack.stack_idx) {
            stack.wakeup_list.lock().unwrap().push(wakeup);
        }
    }
}

/// Signal every wake-poll this worker linked since the last pass.
fn wakeup_stack_epoll(stack: &Arc<Stack>) {
    let pending: Vec<Arc<WakeupPoll>> = {
        let mut list = stack.wakeup_list.lock().unwrap();
        list.drain(..).collect()
    };
    for wakeup in pending {
        wakeup.unlink(stack.stack_idx);
        if !wakeup.closed.load(Ordering::Acquire) {
            wakeup.wake();
        }
    }
}

/// NUMA node owning `cpu`, from sysfs; node 0 when the topology is flat or
/// unreadable.
pub fn numa_node_of_cpu(cpu: u32) -> usize {
    let Ok(entries) = fs::read_dir("/sys/devices/system/node") else {
        return 0;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(node) = name
            .to_str()
            .and_then(|n| n.strip_prefix("node"))
            .and_then(|n| n.parse::<usize>().ok())
        else {
            continue;
        };
        let Ok(list) = fs::read_to_string(entry.path().join("cpulist")) else {
            continue;
        };
        if cpulist_contains(list.trim(), cpu) {
            return node;
        }
    }
    0
}

fn cpulist_contains(list: &str, cpu: u32) -> bool {
    for part in list.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                if let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) {
                    if (lo..=hi).contains(&cpu) {
                        return true;
                    }
                }
            }
            None => {
                if part.parse::<u32>() == Ok(cpu) {
                    return true;
                }
            }
        }
    }
    false
}

fn node_cpus(node: usize) -> Vec<u32> {
    let path = format!("/sys/devices/system/node/node{}/cpulist", node);
    let Ok(list) = fs::read_to_string(path) else {
        return Vec::new();
    };
    let mut cpus = Vec::new();
    for part in list.trim().split(',') {
        let part = part.trim();
        match part.split_once('-') {
            Some((lo, hi)) => {
                if let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) {
                    cpus.extend(lo..=hi);
                }
            }
            None => {
                if let Ok(c) = part.parse::<u32>() {
                    cpus.push(c);
                }
            }
        }
    }
    cpus
}

/// Restrict the calling thread to the CPUs of one NUMA node.
fn bind_to_node(node: usize) {
    let cpus = node_cpus(node);
    if cpus.is_empty() {
        return;
    }
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for &c in &cpus {
            libc::CPU_SET(c as usize, &mut set);
        }
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            log::warn!("node {} affinity failed", node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpulist_parsing() {
        assert!(cpulist_contains("0-3", 2));
        assert!(cpulist_contains("0-3,8-11", 9));
        assert!(!cpulist_contains("0-3,8-11", 5));
        assert!(cpulist_contains("7", 7));
        assert!(!cpulist_contains("", 0));
    }

    #[test]
    fn numa_lookup_never_panics() {
        let _ = numa_node_of_cpu(0);
        let _ = numa_node_of_cpu(10_000);
    }
}
