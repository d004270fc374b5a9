//! Inbound packet steering.
//!
//! Active only on the worker owning NIC queue 0 when tuple filtering is on,
//! which is the configuration where several processes share one NIC. Every
//! packet the flow rules have not already steered lands here and is routed:
//! kept local, handed to a peer worker over RPC, serialized to a peer
//! process over the bridge, or diverted to the kernel tap.
//!
//! Only SYNs are hashed: once the accepting worker installs a flow rule, the
//! NIC delivers the rest of the flow straight to the right queue, so a
//! non-SYN TCP packet seen here belongs to a local queue-0 flow.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::group::StackGroup;
use crate::mbuf::PktBuf;
use crate::packet::{self, TCP_FLAG_SYN};
use crate::rpc::RpcReq;
use crate::stack::Stack;

pub enum Steer {
    /// Process on this worker.
    Local(PktBuf),
    /// Moved to a peer worker or peer process; nothing left to do here.
    Forwarded,
    /// Not ours: return to the host stack through the tap.
    Kernel(PktBuf),
}

pub fn steer(group: &Arc<StackGroup>, stack: &Arc<Stack>, pkt: PktBuf) -> Steer {
    let Some(view) = packet::parse_tcp(pkt.data()) else {
        return Steer::Kernel(pkt);
    };

    let owner = match group
        .listen_ports
        .get(view.dst_port)
        .or_else(|| group.user_ports.get(view.dst_port))
    {
        Some(idx) => idx,
        None => return Steer::Kernel(pkt),
    };

    if view.flags & TCP_FLAG_SYN == 0 {
        return Steer::Local(pkt);
    }

    let per_process = group.cfg.num_queue();
    let idx = packet::syn_steer_index(view.src_ip, view.src_port, view.dst_port, per_process);
    let idx = if group.cfg.split_send_recv {
        // recv workers sit on even queues
        (idx / 2) * 2
    } else {
        idx
    };
    let queue_id = owner as u16 * per_process + idx;

    if queue_id == stack.queue_id {
        return Steer::Local(pkt);
    }

    if owner == group.cfg.process_idx {
        forward_to_worker(group, stack, pkt, idx as usize);
        return Steer::Forwarded;
    }

    // peer process: hand the frame over the shared segment
    let token = crate::mbuf::seg_publish(pkt.to_vec());
    if let Err(e) = crate::bridge::transfer_tcp_to_peer(group, owner, token, queue_id) {
        log::error!(
            "syn hand-off to process {} failed: {}; dropping",
            owner,
            e
        );
        let _ = crate::mbuf::seg_take(token);
        stack.stats.rx_drop.fetch_add(1, Ordering::Relaxed);
    }
    Steer::Forwarded
}

/// Copy into the target worker's pool and inject over RPC. Buffers never
/// cross pool boundaries.
pub fn forward_to_worker(
    group: &Arc<StackGroup>,
    stack: &Arc<Stack>,
    pkt: PktBuf,
    target_idx: usize,
) {
    let Some(target) = group.stack(target_idx) else {
        stack.stats.rx_drop.fetch_add(1, Ordering::Relaxed);
        return;
    };
    match target.pool.alloc_copy(&pkt) {
        Some(copy) => target.rpc.cast(RpcReq::PktIn(copy)),
        None => {
            target.stats.rx_alloc_fail.fetch_add(1, Ordering::Relaxed);
            stack.stats.rx_drop.fetch_add(1, Ordering::Relaxed);
        }
    }
}
