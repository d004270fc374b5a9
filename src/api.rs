//! POSIX-superset socket shim.
//!
//! This is the surface an interposition layer calls into after deciding a
//! descriptor belongs to the fast path. Semantics track POSIX with two
//! documented departures: `listen` may silently install shadow listeners on
//! every worker, and a nonblocking `accept` returns `EAGAIN` whenever no
//! worker has a connection ready.
//!
//! Every function takes the group explicitly; `init` wires a process-default
//! group for interposers that need ambient access.

use std::net::SocketAddrV4;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::RuntimeConfig;
use crate::error::{Errno, Result};
use crate::group::{self, RunOpts, StackGroup};
use crate::listen;
use crate::rpc::RpcReq;
use crate::sock::{Fd, EV_IN};
use crate::wakeup::WakeupPoll;

const BLOCK_POLL: Duration = Duration::from_micros(500);

/// Start the engine and install it as the process default.
pub fn init(cfg: RuntimeConfig, opts: RunOpts) -> Result<Arc<StackGroup>> {
    let g = StackGroup::start(cfg, opts)?;
    let _ = group::set_default(g.clone());
    Ok(g)
}

/// Create a fast-path socket. The owning worker is chosen here and never
/// changes for the lifetime of the descriptor.
pub fn socket(
    group: &Arc<StackGroup>,
    domain: i32,
    ty: i32,
    _protocol: i32,
) -> std::result::Result<Fd, Errno> {
    if domain != libc::AF_INET {
        return Err(Errno::INVAL);
    }
    let base_ty = ty & !(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC);
    if base_ty != libc::SOCK_STREAM && base_ty != libc::SOCK_DGRAM {
        return Err(Errno::INVAL);
    }

    let stack = group.get_bind_stack().ok_or(Errno::NOMEM)?;
    let fd = group.rpc_call(stack.stack_idx, RpcReq::Socket)?.fd();
    if ty & libc::SOCK_NONBLOCK != 0 {
        if let Ok(sock) = group.socktab.get(fd) {
            sock.inner.lock().unwrap().nonblock = true;
        }
    }
    Ok(fd)
}

pub fn close(group: &Arc<StackGroup>, fd: Fd) -> std::result::Result<(), Errno> {
    let sock = group.socktab.get(fd)?;
    let is_listener = sock.inner.lock().unwrap().is_listener;

    if is_listener {
        return listen::broadcast_close(group, fd);
    }

    // tear the flow rule down before the connection record goes away
    if group.cfg.tuple_filter {
        let local = group.rpc_call(sock.stack_idx, RpcReq::GetSockName { fd });
        let peer = group.rpc_call(sock.stack_idx, RpcReq::GetPeerName { fd });
        if let (Ok(local), Ok(peer)) = (local, peer) {
            let (local, peer) = (local.addr(), peer.addr());
            crate::bridge::remove_flow(
                group,
                u32::from(*peer.ip()),
                local.port(),
                peer.port(),
            );
        }
    }

    if let Some(wakeup) = sock.wakeup() {
        group.broadcast_clean_epoll(&wakeup);
    }
    group
        .rpc_call(sock.stack_idx, RpcReq::Close { fd })
        .map(|_| ())
}

pub fn bind(
    group: &Arc<StackGroup>,
    fd: Fd,
    addr: SocketAddrV4,
) -> std::result::Result<(), Errno> {
    listen::single_bind(group, fd, addr)
}

/// Shared bind across every worker (UDP-style reuse).
pub fn bind_shared(
    group: &Arc<StackGroup>,
    fd: Fd,
    addr: SocketAddrV4,
) -> std::result::Result<(), Errno> {
    listen::broadcast_bind(group, fd, addr)
}

pub fn listen_fd(
    group: &Arc<StackGroup>,
    fd: Fd,
    backlog: u32,
) -> std::result::Result<(), Errno> {
    if group.cfg.tuple_filter || group.cfg.listen_shadow {
        listen::broadcast_listen(group, fd, backlog)
    } else {
        listen::single_listen(group, fd, backlog)
    }
}

pub fn accept(group: &Arc<StackGroup>, fd: Fd) -> std::result::Result<Fd, Errno> {
    accept4(group, fd, 0)
}

pub fn accept4(
    group: &Arc<StackGroup>,
    fd: Fd,
    flags: i32,
) -> std::result::Result<Fd, Errno> {
    let listener = group.socktab.get(fd)?;
    let listener_nonblock = listener.inner.lock().unwrap().nonblock;
    let new_nonblock = flags & libc::SOCK_NONBLOCK != 0;

    loop {
        match listen::broadcast_accept(group, fd, new_nonblock) {
            Ok(fd) => return Ok(fd),
            Err(Errno::AGAIN) if !listener_nonblock && group.running() => {
                std::thread::sleep(BLOCK_POLL);
            }
            Err(e) => return Err(e),
        }
    }
}

pub fn connect(
    group: &Arc<StackGroup>,
    fd: Fd,
    addr: SocketAddrV4,
) -> std::result::Result<(), Errno> {
    let sock = group.socktab.get(fd)?;
    group
        .rpc_call(sock.stack_idx, RpcReq::Connect { fd, addr })
        .map(|_| ())
}

pub fn send(
    group: &Arc<StackGroup>,
    fd: Fd,
    data: &[u8],
) -> std::result::Result<usize, Errno> {
    let sock = group.socktab.get(fd)?;
    let n = group
        .rpc_call(
            sock.stack_idx,
            RpcReq::Send {
                fd,
                data: data.to_vec(),
            },
        )?
        .int();
    Ok(n as usize)
}

pub fn write(
    group: &Arc<StackGroup>,
    fd: Fd,
    data: &[u8],
) -> std::result::Result<usize, Errno> {
    send(group, fd, data)
}

/// Drain up to `buf.len()` bytes from the mailbox the owning worker fills.
/// Blocks unless the socket is nonblocking; end-of-stream reads zero.
pub fn recv(
    group: &Arc<StackGroup>,
    fd: Fd,
    buf: &mut [u8],
) -> std::result::Result<usize, Errno> {
    let sock = group.socktab.get(fd)?;
    if buf.is_empty() {
        return Ok(0);
    }

    loop {
        let mut filled = 0;
        {
            let mut inner = sock.inner.lock().unwrap();
            while filled < buf.len() {
                if let Some(b) = inner.rx_carry.pop_front() {
                    buf[filled] = b;
                    filled += 1;
                    continue;
                }
                match sock.recvbox.pop() {
                    Some(chunk) => {
                        let take = chunk.len().min(buf.len() - filled);
                        buf[filled..filled + take].copy_from_slice(&chunk[..take]);
                        filled += take;
                        inner.rx_carry.extend(&chunk[take..]);
                    }
                    None => break,
                }
            }
            if filled > 0 {
                if inner.rx_carry.is_empty() && sock.recvbox.is_empty() {
                    sock.clear_events(EV_IN);
                }
                return Ok(filled);
            }
            if inner.eof {
                return Ok(0);
            }
            if inner.nonblock {
                return Err(Errno::AGAIN);
            }
            // park until the worker delivers; re-check on every wake
            let (guard, _timeout) = sock
                .ready
                .wait_timeout(inner, BLOCK_POLL * 20)
                .map_err(|_| Errno::INVAL)?;
            drop(guard);
        }
        if !group.running() {
            return Err(Errno::BADF);
        }
    }
}

pub fn read(
    group: &Arc<StackGroup>,
    fd: Fd,
    buf: &mut [u8],
) -> std::result::Result<usize, Errno> {
    recv(group, fd, buf)
}

pub fn getsockname(
    group: &Arc<StackGroup>,
    fd: Fd,
) -> std::result::Result<SocketAddrV4, Errno> {
    let sock = group.socktab.get(fd)?;
    Ok(group
        .rpc_call(sock.stack_idx, RpcReq::GetSockName { fd })?
        .addr())
}

pub fn getpeername(
    group: &Arc<StackGroup>,
    fd: Fd,
) -> std::result::Result<SocketAddrV4, Errno> {
    let sock = group.socktab.get(fd)?;
    Ok(group
        .rpc_call(sock.stack_idx, RpcReq::GetPeerName { fd })?
        .addr())
}

pub fn getsockopt(
    group: &Arc<StackGroup>,
    fd: Fd,
    level: i32,
    name: i32,
) -> std::result::Result<i64, Errno> {
    let sock = group.socktab.get(fd)?;
    Ok(group
        .rpc_call(sock.stack_idx, RpcReq::GetSockOpt { fd, level, name })?
        .int())
}

pub fn setsockopt(
    group: &Arc<StackGroup>,
    fd: Fd,
    level: i32,
    name: i32,
    value: i64,
) -> std::result::Result<(), Errno> {
    let sock = group.socktab.get(fd)?;
    group
        .rpc_call(
            sock.stack_idx,
            RpcReq::SetSockOpt {
                fd,
                level,
                name,
                value,
            },
        )
        .map(|_| ())
}

pub fn fcntl(
    group: &Arc<StackGroup>,
    fd: Fd,
    cmd: i32,
    arg: i64,
) -> std::result::Result<i64, Errno> {
    let sock = group.socktab.get(fd)?;
    Ok(group
        .rpc_call(sock.stack_idx, RpcReq::Fcntl { fd, cmd, arg })?
        .int())
}

pub fn ioctl(
    group: &Arc<StackGroup>,
    fd: Fd,
    cmd: i64,
    arg: i64,
) -> std::result::Result<i64, Errno> {
    let sock = group.socktab.get(fd)?;
    Ok(group
        .rpc_call(sock.stack_idx, RpcReq::Ioctl { fd, cmd, arg })?
        .int())
}

/// Create an epoll-like readiness surface backed by a wake-poll.
pub fn epoll_create(group: &Arc<StackGroup>) -> std::result::Result<Fd, Errno> {
    let bind_idx = group.min_conn_stack();
    let wakeup =
        WakeupPoll::new(bind_idx, group.stack_num()).map_err(|_| Errno::NOMEM)?;
    Ok(group.register_epoll(wakeup))
}

pub fn epoll_ctl(
    group: &Arc<StackGroup>,
    epfd: Fd,
    op: i32,
    fd: Fd,
    events: u32,
    data: u64,
) -> std::result::Result<(), Errno> {
    let wakeup = group.epoll(epfd).ok_or(Errno::BADF)?;

    if group.socktab.owns(fd) {
        let sock = group.socktab.get(fd)?;
        // a shadowed listener is registered through every shadow: readiness
        // surfaces on whichever worker completes the handshake
        let targets = if sock.inner.lock().unwrap().is_listener {
            group.socktab.walk_listen_chain(fd)
        } else {
            vec![sock]
        };
        match op {
            libc::EPOLL_CTL_ADD | libc::EPOLL_CTL_MOD => {
                for sock in targets {
                    {
                        let mut inner = sock.inner.lock().unwrap();
                        inner.wakeup = Some(wakeup.clone());
                        inner.interest = events;
                        inner.epdata = data;
                    }
                    // readiness that predates registration must still surface
                    if sock.events.load(Ordering::Acquire) & events != 0 {
                        wakeup.arm(sock.fd);
                    }
                }
                Ok(())
            }
            libc::EPOLL_CTL_DEL => {
                for sock in targets {
                    sock.inner.lock().unwrap().wakeup = None;
                }
                group.broadcast_clean_epoll(&wakeup);
                Ok(())
            }
            _ => Err(Errno::INVAL),
        }
    } else {
        // kernel-owned fd: watch it from the bind worker's sink
        let stack = group.stack(wakeup.bind_stack_idx).ok_or(Errno::BADF)?;
        match op {
            libc::EPOLL_CTL_ADD | libc::EPOLL_CTL_MOD => stack
                .kernel_sink
                .add_watch(fd, &wakeup, data, events)
                .map_err(|_| Errno::BADF),
            libc::EPOLL_CTL_DEL => {
                stack.kernel_sink.del_watch(fd);
                Ok(())
            }
            _ => Err(Errno::INVAL),
        }
    }
}

/// Wait for readiness; returns `(data, events)` pairs.
pub fn epoll_wait(
    group: &Arc<StackGroup>,
    epfd: Fd,
    max_events: usize,
    timeout_ms: i32,
) -> std::result::Result<Vec<(u64, u32)>, Errno> {
    let wakeup = group.epoll(epfd).ok_or(Errno::BADF)?;
    let deadline = (timeout_ms >= 0)
        .then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));

    let mut out = Vec::new();
    loop {
        wakeup.harvest(&group.socktab, &mut out, max_events);
        if !out.is_empty() {
            return Ok(out);
        }
        let wait_ms = match deadline {
            Some(d) => {
                let left = d.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Ok(out);
                }
                left.as_millis().max(1) as i32
            }
            None => 100,
        };
        wakeup.wait(wait_ms);
        if !group.running() {
            return Ok(out);
        }
    }
}

pub fn epoll_close(group: &Arc<StackGroup>, epfd: Fd) -> std::result::Result<(), Errno> {
    let wakeup = group.remove_epoll(epfd).ok_or(Errno::BADF)?;
    wakeup.closed.store(true, Ordering::Release);
    group.broadcast_clean_epoll(&wakeup);
    Ok(())
}
