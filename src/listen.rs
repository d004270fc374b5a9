//! Listen/accept coordination across workers.
//!
//! `broadcast_listen` clones a listener onto every worker so any of them can
//! complete handshakes locally; the clone on the least-loaded worker is
//! marked master. `broadcast_accept` then drains whichever shadow is ready,
//! preferring the worker with the fewest owned flows. Any failure while
//! broadcasting unwinds by closing the whole chain.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::Errno;
use crate::group::StackGroup;
use crate::rpc::RpcReq;
use crate::sock::{Fd, SockEntry, EV_IN};
use crate::stack::StackRole;

pub fn single_listen(group: &Arc<StackGroup>, fd: Fd, backlog: u32) -> Result<(), Errno> {
    let sock = group.socktab.get(fd)?;
    group
        .rpc_call(sock.stack_idx, RpcReq::Listen { fd, backlog })
        .map(|_| ())
}

pub fn single_bind(
    group: &Arc<StackGroup>,
    fd: Fd,
    addr: std::net::SocketAddrV4,
) -> Result<(), Errno> {
    let sock = group.socktab.get(fd)?;
    group
        .rpc_call(sock.stack_idx, RpcReq::Bind { fd, addr })
        .map(|_| ())
}

/// Install a shadow of `fd` on every worker and start them all listening.
///
/// 1. resolve the bound address on the originating worker;
/// 2. `shadow_fd` every other (recv-capable) worker, linking the clones into
///    the listen chain;
/// 3. mark the clone on the least-loaded worker as master;
/// 4. `listen` on every clone;
/// 5. unwind with `broadcast_close` if any leg fails.
pub fn broadcast_listen(group: &Arc<StackGroup>, fd: Fd, backlog: u32) -> Result<(), Errno> {
    let head = group.socktab.get(fd)?;
    let cur_idx = head.stack_idx;

    let addr = group
        .rpc_call(cur_idx, RpcReq::GetSockName { fd })?
        .addr();

    let min_idx = group.min_conn_stack();

    for (i, stack) in group.stacks().iter().enumerate() {
        if group.cfg.split_send_recv && stack.role == StackRole::Send {
            continue;
        }

        let clone_fd = if i == cur_idx {
            fd
        } else {
            match group.rpc_call(i, RpcReq::ShadowFd { fd, addr }) {
                Ok(ret) => {
                    let clone_fd = ret.fd();
                    let _ = group.socktab.link_shadow(fd, clone_fd);
                    clone_fd
                }
                Err(e) => {
                    log::error!("shadow of fd {} on stack {} failed: {}", fd, i, e);
                    let _ = broadcast_close(group, fd);
                    return Err(e);
                }
            }
        };

        if let Ok(clone) = group.socktab.get(clone_fd) {
            clone.inner.lock().unwrap().is_master_fd = i == min_idx;
        }

        if let Err(e) = group.rpc_call(i, RpcReq::Listen { fd: clone_fd, backlog }) {
            log::error!("listen on stack {} failed: {}", i, e);
            let _ = broadcast_close(group, fd);
            return Err(e);
        }
    }

    if group.cfg.tuple_filter {
        if let Err(e) = crate::bridge::register_listen_port(group, addr.port(), true) {
            log::error!("listen port {} registration failed: {}", addr.port(), e);
        }
    }
    Ok(())
}

/// Clone a bound (unlistened) socket onto every other worker; used for
/// shared binds. Unwinds like `broadcast_listen`.
pub fn broadcast_bind(
    group: &Arc<StackGroup>,
    fd: Fd,
    addr: std::net::SocketAddrV4,
) -> Result<(), Errno> {
    let head = group.socktab.get(fd)?;
    let cur_idx = head.stack_idx;

    group.rpc_call(cur_idx, RpcReq::Bind { fd, addr })?;

    for (i, _) in group.stacks().iter().enumerate() {
        if i == cur_idx {
            continue;
        }
        match group.rpc_call(i, RpcReq::ShadowFd { fd, addr }) {
            Ok(ret) => {
                let _ = group.socktab.link_shadow(fd, ret.fd());
            }
            Err(e) => {
                let _ = broadcast_close(group, fd);
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Shadow with connections ready, on the least-loaded worker; ties break
/// toward the head of the chain.
fn min_accept_sock(group: &Arc<StackGroup>, fd: Fd) -> Result<Option<Arc<SockEntry>>, Errno> {
    let chain = group.socktab.walk_listen_chain(fd);
    if chain.is_empty() {
        return Err(Errno::BADF);
    }
    let mut min: Option<(Arc<SockEntry>, u32)> = None;
    for entry in chain {
        if !entry.acceptable.load(Ordering::Acquire) {
            continue;
        }
        let conn = group
            .stack(entry.stack_idx)
            .map(|s| s.conn_num.load(Ordering::Acquire))
            .unwrap_or(u32::MAX);
        match &min {
            Some((_, best)) if conn >= *best => {}
            _ => min = Some((entry, conn)),
        }
    }
    Ok(min.map(|(e, _)| e))
}

/// Drop the level-triggered accept readiness once the backlog is drained.
/// Holding the record lock pairs this against the worker re-arming it.
fn del_accept_in_event(entry: &Arc<SockEntry>) {
    let _inner = entry.inner.lock().unwrap();
    if !entry.acceptable.load(Ordering::Acquire) {
        entry.clear_events(EV_IN);
    }
}

/// Accept from whichever shadow is ready. `EAGAIN` when none is.
pub fn broadcast_accept(
    group: &Arc<StackGroup>,
    fd: Fd,
    nonblock: bool,
) -> Result<Fd, Errno> {
    let target = min_accept_sock(group, fd)?.ok_or(Errno::AGAIN)?;

    let result = group.rpc_call(
        target.stack_idx,
        RpcReq::Accept {
            fd: target.fd,
            nonblock,
        },
    );

    if target.wakeup().is_some() {
        del_accept_in_event(&target);
    }

    match result {
        Ok(ret) => Ok(ret.fd()),
        Err(_) => Err(Errno::AGAIN),
    }
}

/// Close every shadow in the chain; reports failure if any leg failed.
pub fn broadcast_close(group: &Arc<StackGroup>, fd: Fd) -> Result<(), Errno> {
    let chain = group.socktab.walk_listen_chain(fd);
    if chain.is_empty() {
        return Err(Errno::BADF);
    }

    let listen_port = {
        let head = &chain[0];
        let inner = head.inner.lock().unwrap();
        if inner.is_listener {
            inner.bound.map(|a| a.port())
        } else {
            None
        }
    };

    let mut result = Ok(());
    for entry in chain {
        if group
            .rpc_call(entry.stack_idx, RpcReq::Close { fd: entry.fd })
            .is_err()
        {
            result = Err(Errno::INVAL);
        }
    }

    if let Some(port) = listen_port {
        if group.cfg.tuple_filter {
            let _ = crate::bridge::register_listen_port(group, port, false);
        }
    }
    result
}
