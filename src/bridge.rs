//! Multi-process bridge.
//!
//! Cooperating processes sharing a NIC talk over local-domain stream sockets,
//! one listener per process at `run_dir/server.socket<idx>`. Messages are
//! fixed-length ASCII and self-framing by length alone:
//!
//! | length | meaning                                                        |
//! |--------|----------------------------------------------------------------|
//! | 64     | ARP segment token (decimal)                                    |
//! | 67     | `"token,queue_id"` TCP hand-off                                |
//! | 30     | `"dst_ip,src_port,dst_port"` flow-rule delete                  |
//! | 60     | `"src_ip,dst_ip,src_port,dst_port,queue_id,process_idx"` create|
//! | 25     | `"port,process_idx,is_add"` listen-port registration           |
//! | 14     | `"get_lstack_num"`                                             |
//!
//! Replies are at most 10 ASCII bytes: `success`, `error`, or an integer.
//! Clients connect per message, exactly like the senders they interoperate
//! with. A peer that is not running yet is a normal condition, reported as
//! `BridgeConnect` and logged at INFO.

use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::{RuntimeConfig, PRIMARY_MARKER, RUN_DIR_MODE};
use crate::dev::FlowSpec;
use crate::error::{Error, Result};
use crate::group::StackGroup;
use crate::mbuf::{seg_publish, seg_take};
use crate::rpc::RpcReq;

pub const ARP_MSG_LEN: usize = 64;
pub const TCP_MSG_LEN: usize = ARP_MSG_LEN + 3;
pub const DELETE_RULE_LEN: usize = 30;
pub const CREATE_RULE_LEN: usize = 60;
pub const LISTEN_PORT_MSG_LEN: usize = 25;
pub const GET_STACK_NUM_LEN: usize = 14;
pub const REPLY_LEN: usize = 10;
pub const SUCCESS_REPLY: &str = "success";
pub const ERROR_REPLY: &str = "error";
pub const GET_STACK_NUM_MSG: &str = "get_lstack_num";

const READ_BUF_LEN: usize = 132;
const ACCEPT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeReply {
    Ok,
    Int(i64),
    None,
}

/// Create `run_dir` (mode 0700) and drop the primary-start marker.
pub fn prepare_run_dir(cfg: &RuntimeConfig) -> Result<()> {
    fs::create_dir_all(&cfg.run_dir)?;
    fs::set_permissions(&cfg.run_dir, fs::Permissions::from_mode(RUN_DIR_MODE))?;
    if cfg.is_primary {
        fs::write(cfg.run_dir.join(PRIMARY_MARKER), b"")?;
    }
    Ok(())
}

fn pad(msg: &str, len: usize) -> Vec<u8> {
    let mut buf = msg.as_bytes().to_vec();
    debug_assert!(buf.len() <= len, "bridge message overflows its frame");
    buf.resize(len, 0);
    buf
}

fn text_of(buf: &[u8]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).unwrap_or("")
}

fn fields_of(buf: &[u8]) -> Vec<u64> {
    text_of(buf)
        .split(',')
        .filter_map(|f| f.trim().parse::<u64>().ok())
        .collect()
}

/// Connect-per-message client, mirroring the listener's framing.
pub fn send_to_process(
    cfg: &RuntimeConfig,
    process_idx: u8,
    payload: &[u8],
    need_reply: bool,
) -> Result<BridgeReply> {
    let path = cfg.server_socket_path(process_idx);
    let mut stream =
        UnixStream::connect(&path).map_err(|_| Error::BridgeConnect(process_idx))?;
    stream.write_all(payload)?;

    if !need_reply {
        return Ok(BridgeReply::None);
    }
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .ok();
    let mut reply = [0u8; REPLY_LEN];
    let mut got = 0;
    while got < REPLY_LEN {
        match stream.read(&mut reply[got..]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(_) => break,
        }
    }
    if got == 0 {
        return Err(Error::BridgeReply);
    }
    match text_of(&reply) {
        SUCCESS_REPLY => Ok(BridgeReply::Ok),
        ERROR_REPLY => Err(Error::BridgeReply),
        other => other
            .trim()
            .parse::<i64>()
            .map(BridgeReply::Int)
            .map_err(|_| Error::BridgeReply),
    }
}

/// Start this process's listener. Binds, posts the listen semaphore, then
/// accepts and dispatches until the group stops.
pub fn start_listener(group: Arc<StackGroup>) -> Result<JoinHandle<()>> {
    let path = group.cfg.server_socket_path(group.cfg.process_idx);
    let _ = fs::remove_file(&path);
    fs::create_dir_all(&group.cfg.run_dir)?;
    let listener = UnixListener::bind(&path)?;
    listener.set_nonblocking(true)?;

    thread::Builder::new()
        .name("bridge_listen".into())
        .spawn(move || {
            group.sem_listen.post();
            log::info!("bridge listening at {:?}", path);
            while group.running() {
                match listener.accept() {
                    Ok((stream, _)) => handle_conn(&group, stream),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_POLL);
                    }
                    Err(e) => {
                        log::error!("bridge accept: {}", e);
                        thread::sleep(ACCEPT_POLL);
                    }
                }
            }
            let _ = fs::remove_file(&path);
        })
        .map_err(Error::Io)
}

fn handle_conn(group: &Arc<StackGroup>, mut stream: UnixStream) {
    stream
        .set_read_timeout(Some(Duration::from_millis(500)))
        .ok();
    let mut buf = [0u8; READ_BUF_LEN];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        if let Some(reply) = handle_message(group, &buf[..n]) {
            let _ = stream.write_all(&reply);
        }
    }
}

/// Dispatch one message by its length; returns the reply frame if one is due.
fn handle_message(group: &Arc<StackGroup>, msg: &[u8]) -> Option<Vec<u8>> {
    match msg.len() {
        ARP_MSG_LEN => {
            let token = text_of(msg).trim().parse::<u64>().ok()?;
            recv_arp_from_peer(group, token);
            None
        }
        TCP_MSG_LEN => {
            let f = fields_of(msg);
            if f.len() == 2 {
                recv_tcp_from_peer(group, f[0], f[1] as u16);
            }
            None
        }
        DELETE_RULE_LEN => {
            let f = fields_of(msg);
            if f.len() == 3 {
                group.flow_table.delete(f[0] as u32, f[1] as u16, f[2] as u16);
            }
            None
        }
        CREATE_RULE_LEN => {
            let f = fields_of(msg);
            if f.len() != 6 {
                return Some(pad(ERROR_REPLY, REPLY_LEN));
            }
            let spec = FlowSpec {
                src_ip: f[0] as u32,
                dst_ip: f[1] as u32,
                src_port: f[2] as u16,
                dst_port: f[3] as u16,
                queue_id: f[4] as u16,
            };
            if group.flow_table.configure(&spec).is_err() {
                return Some(pad(ERROR_REPLY, REPLY_LEN));
            }
            group.user_ports.set(spec.dst_port, f[5] as u8);
            Some(pad(SUCCESS_REPLY, REPLY_LEN))
        }
        GET_STACK_NUM_LEN => {
            Some(pad(&group.stack_num().to_string(), REPLY_LEN))
        }
        LISTEN_PORT_MSG_LEN => {
            let f = fields_of(msg);
            if f.len() != 3 {
                return Some(pad(ERROR_REPLY, REPLY_LEN));
            }
            let (port, process_idx, is_add) = (f[0] as u16, f[1] as u8, f[2] != 0);
            if is_add {
                group.listen_ports.set(port, process_idx);
            } else {
                group.listen_ports.clear(port);
            }
            Some(pad(SUCCESS_REPLY, REPLY_LEN))
        }
        other => {
            log::error!("bridge: unknown message length {}", other);
            None
        }
    }
}

/// An ARP copy arrived from a peer process: re-copy out of the shared
/// segment into every local worker's own pool.
fn recv_arp_from_peer(group: &Arc<StackGroup>, token: u64) {
    let Some(bytes) = seg_take(token) else {
        log::error!("bridge: stale arp token {}", token);
        return;
    };
    for stack in group.stacks() {
        match stack.pool.alloc_from(&bytes) {
            Some(copy) => stack.rpc.cast(RpcReq::PktIn(copy)),
            None => {
                stack.stats.arp_copy_fail.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// A steered SYN arrived: land it on the worker owning the target queue.
fn recv_tcp_from_peer(group: &Arc<StackGroup>, token: u64, queue_id: u16) {
    let Some(bytes) = seg_take(token) else {
        log::error!("bridge: stale tcp token {}", token);
        return;
    };
    let idx = (queue_id % group.cfg.num_queue()) as usize;
    let Some(stack) = group.stack(idx) else { return };
    match stack.pool.alloc_from(&bytes) {
        Some(copy) => stack.rpc.cast(RpcReq::PktIn(copy)),
        None => {
            stack.stats.rx_alloc_fail.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Duplicate an ARP frame to every peer process. Best-effort: an absent peer
/// is expected, anything else is worth an error.
pub fn transfer_arp_to_peers(group: &Arc<StackGroup>, pkt: &crate::mbuf::PktBuf) {
    for idx in 0..group.cfg.num_process {
        if idx == group.cfg.process_idx {
            continue;
        }
        let token = seg_publish(pkt.to_vec());
        let msg = pad(&token.to_string(), ARP_MSG_LEN);
        match send_to_process(&group.cfg, idx, &msg, false) {
            Ok(_) => {}
            Err(Error::BridgeConnect(_)) => {
                let _ = seg_take(token);
                log::info!("process {} not reachable, ensure it is started", idx);
            }
            Err(e) => {
                let _ = seg_take(token);
                log::error!("arp transfer to process {} failed: {}", idx, e);
            }
        }
    }
}

/// Hand a steered SYN to the peer process owning `queue_id`.
pub fn transfer_tcp_to_peer(
    group: &Arc<StackGroup>,
    process_idx: u8,
    token: u64,
    queue_id: u16,
) -> Result<()> {
    let msg = pad(&format!("{},{}", token, queue_id), TCP_MSG_LEN);
    send_to_process(&group.cfg, process_idx, &msg, false).map(|_| ())
}

/// Install a flow rule for an accepted flow: locally when this process is
/// primary, marshalled to the primary otherwise.
pub fn install_flow(group: &Arc<StackGroup>, spec: &FlowSpec) -> Result<()> {
    if group.cfg.is_primary {
        group.flow_table.configure(spec)?;
        group
            .user_ports
            .set(spec.dst_port, group.cfg.process_idx);
        return Ok(());
    }
    let msg = pad(
        &format!(
            "{},{},{},{},{},{}",
            spec.src_ip,
            spec.dst_ip,
            spec.src_port,
            spec.dst_port,
            spec.queue_id,
            group.cfg.process_idx
        ),
        CREATE_RULE_LEN,
    );
    match send_to_process(&group.cfg, 0, &msg, true)? {
        BridgeReply::Ok => Ok(()),
        _ => Err(Error::BridgeReply),
    }
}

/// Remove a flow rule, given in the connection's perspective.
pub fn remove_flow(
    group: &Arc<StackGroup>,
    remote_ip: u32,
    local_port: u16,
    remote_port: u16,
) {
    if group.cfg.is_primary {
        group.flow_table.delete(remote_ip, local_port, remote_port);
        return;
    }
    let msg = pad(
        &format!("{},{},{}", remote_ip, local_port, remote_port),
        DELETE_RULE_LEN,
    );
    if let Err(e) = send_to_process(&group.cfg, 0, &msg, false) {
        log::error!("flow delete hand-off failed: {}", e);
    }
}

/// Register or clear a listen port in the dispatcher's owner table, which
/// lives in the primary process.
pub fn register_listen_port(group: &Arc<StackGroup>, port: u16, is_add: bool) -> Result<()> {
    if group.cfg.is_primary {
        if is_add {
            group.listen_ports.set(port, group.cfg.process_idx);
        } else {
            group.listen_ports.clear(port);
        }
        return Ok(());
    }
    let msg = pad(
        &format!(
            "{},{},{}",
            port,
            group.cfg.process_idx,
            if is_add { 1 } else { 0 }
        ),
        LISTEN_PORT_MSG_LEN,
    );
    match send_to_process(&group.cfg, 0, &msg, true)? {
        BridgeReply::Ok => Ok(()),
        _ => Err(Error::BridgeReply),
    }
}

/// Sanity check at non-primary init: the primary must be up and sized the
/// way we expect.
pub fn check_primary_stack_num(group: &Arc<StackGroup>) -> Result<()> {
    let msg = pad(GET_STACK_NUM_MSG, GET_STACK_NUM_LEN);
    match send_to_process(&group.cfg, 0, &msg, true)? {
        BridgeReply::Int(n) if n == group.stack_num() as i64 => Ok(()),
        BridgeReply::Int(n) => Err(Error::Config(format!(
            "primary runs {} workers, this process expects {}",
            n,
            group.stack_num()
        ))),
        _ => Err(Error::BridgeReply),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_helpers() {
        let msg = pad("get_lstack_num", GET_STACK_NUM_LEN);
        assert_eq!(msg.len(), GET_STACK_NUM_LEN);
        assert_eq!(text_of(&msg), "get_lstack_num");

        let msg = pad("1,2,3", DELETE_RULE_LEN);
        assert_eq!(fields_of(&msg), vec![1, 2, 3]);
    }

    #[test]
    fn message_lengths_are_distinct() {
        let lens = [
            ARP_MSG_LEN,
            TCP_MSG_LEN,
            DELETE_RULE_LEN,
            CREATE_RULE_LEN,
            LISTEN_PORT_MSG_LEN,
            GET_STACK_NUM_LEN,
        ];
        for (i, a) in lens.iter().enumerate() {
            for b in &lens[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
