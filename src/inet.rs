//! The TCP/IP collaborator.
//!
//! Each worker owns exactly one `Inet` instance and is the only thread that
//! ever touches it; every operation below runs on the owning worker, either
//! inline in the poll loop or inside an RPC handler. The real deployment
//! links a single-threaded TCP/IP library here. `LoopInet` is the in-tree
//! implementation: an in-memory stack that pairs connections within one
//! instance, answers ARP, and feeds the same event surface the poll loop
//! drains. It exists so the engine is exercisable end-to-end without
//! hardware.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::Errno;
use crate::mbuf::{PktBuf, PktPool};
use crate::packet;

pub type ConnId = usize;

/// Readiness the poll loop folds into socket records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InetEvent {
    /// Connection has data queued; drain with `recv`.
    Readable { conn: ConnId },
    /// Listener has at least one pending connection.
    Acceptable { conn: ConnId },
}

pub trait Inet: Send {
    fn socket(&mut self) -> Result<ConnId, Errno>;
    fn close(&mut self, conn: ConnId) -> Result<(), Errno>;
    fn bind(&mut self, conn: ConnId, addr: SocketAddrV4) -> Result<(), Errno>;
    fn listen(&mut self, conn: ConnId, backlog: u32) -> Result<(), Errno>;
    /// Pop one pending connection; `EAGAIN` when the backlog is empty.
    fn accept(&mut self, conn: ConnId) -> Result<(ConnId, SocketAddrV4), Errno>;
    fn connect(&mut self, conn: ConnId, addr: SocketAddrV4) -> Result<(), Errno>;
    fn local_addr(&self, conn: ConnId) -> Result<SocketAddrV4, Errno>;
    fn peer_addr(&self, conn: ConnId) -> Result<SocketAddrV4, Errno>;
    fn setsockopt(&mut self, conn: ConnId, level: i32, name: i32, value: i64)
        -> Result<(), Errno>;
    fn getsockopt(&self, conn: ConnId, level: i32, name: i32) -> Result<i64, Errno>;
    fn send(&mut self, conn: ConnId, data: &[u8]) -> Result<usize, Errno>;
    /// Drain up to `max` queued bytes. `EAGAIN` when nothing is queued;
    /// an empty Ok is orderly end-of-stream.
    fn recv(&mut self, conn: ConnId, max: usize) -> Result<Vec<u8>, Errno>;
    fn acceptable(&self, conn: ConnId) -> bool;
    fn recv_pending(&self, conn: ConnId) -> bool;
    /// Feed one inbound frame.
    fn input(&mut self, frame: &[u8]);
    fn arp_lookup(&self, ip: u32) -> Option<[u8; 6]>;
    /// Drain readiness events produced since the last poll.
    fn poll_events(&mut self, max: usize, out: &mut Vec<InetEvent>) -> usize;
    fn timer_tick(&mut self, now_ms: u64);
    /// Move pending outbound frames into pool buffers.
    fn tx_drain(&mut self, pool: &PktPool, out: &mut Vec<PktBuf>);
}

#[derive(Debug, PartialEq, Eq)]
enum ConnState {
    Fresh,
    Bound,
    Listening,
    Connected,
    Closed,
}

struct Conn {
    state: ConnState,
    local: Option<SocketAddrV4>,
    remote: Option<SocketAddrV4>,
    /// In-instance peer for loopback pairs; `None` for wire-originated conns.
    peer: Option<ConnId>,
    backlog: VecDeque<ConnId>,
    backlog_cap: usize,
    rx: VecDeque<u8>,
    eof: bool,
    readable_armed: bool,
    opts: HashMap<(i32, i32), i64>,
}

impl Conn {
    fn fresh() -> Conn {
        Conn {
            state: ConnState::Fresh,
            local: None,
            remote: None,
            peer: None,
            backlog: VecDeque::new(),
            backlog_cap: 0,
            rx: VecDeque::new(),
            eof: false,
            readable_armed: false,
            opts: HashMap::new(),
        }
    }
}

/// In-memory loopback stack.
pub struct LoopInet {
    conns: Vec<Option<Conn>>,
    free: Vec<ConnId>,
    listeners: HashMap<u16, ConnId>,
    arp: HashMap<u32, [u8; 6]>,
    events: VecDeque<InetEvent>,
    txq: VecDeque<Vec<u8>>,
    own_ip: Option<u32>,
    own_mac: [u8; 6],
    next_ephemeral: u16,
    pub rx_frames: u64,
    pub rx_unmatched: u64,
    pub timer_ticks: u64,
}

impl Default for LoopInet {
    fn default() -> Self {
        LoopInet::new()
    }
}

impl LoopInet {
    pub fn new() -> LoopInet {
        LoopInet {
            conns: Vec::new(),
            free: Vec::new(),
            listeners: HashMap::new(),
            arp: HashMap::new(),
            events: VecDeque::new(),
            txq: VecDeque::new(),
            own_ip: None,
            own_mac: [0; 6],
            next_ephemeral: 49152,
            rx_frames: 0,
            rx_unmatched: 0,
            timer_ticks: 0,
        }
    }

    /// Identity used to answer ARP requests for our address.
    pub fn with_identity(ip: Ipv4Addr, mac: [u8; 6]) -> LoopInet {
        let mut inet = LoopInet::new();
        inet.own_ip = Some(u32::from(ip));
        inet.own_mac = mac;
        inet
    }

    fn conn(&self, id: ConnId) -> Result<&Conn, Errno> {
        self.conns
            .get(id)
            .and_then(|c| c.as_ref())
            .ok_or(Errno::BADF)
    }

    fn conn_mut(&mut self, id: ConnId) -> Result<&mut Conn, Errno> {
        self.conns
            .get_mut(id)
            .and_then(|c| c.as_mut())
            .ok_or(Errno::BADF)
    }

    fn alloc_conn(&mut self) -> ConnId {
        if let Some(id) = self.free.pop() {
            self.conns[id] = Some(Conn::fresh());
            id
        } else {
            self.conns.push(Some(Conn::fresh()));
            self.conns.len() - 1
        }
    }

    fn ephemeral_addr(&mut self) -> SocketAddrV4 {
        let port = self.next_ephemeral;
        self.next_ephemeral = self.next_ephemeral.wrapping_add(1).max(49152);
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    fn push_readable(&mut self, id: ConnId) {
        let conn = match self.conns.get_mut(id).and_then(|c| c.as_mut()) {
            Some(c) => c,
            None => return,
        };
        if !conn.readable_armed {
            conn.readable_armed = true;
            self.events.push_back(InetEvent::Readable { conn: id });
        }
    }

    fn find_by_tuple(&self, local: SocketAddrV4, remote: SocketAddrV4) -> Option<ConnId> {
        self.conns.iter().enumerate().find_map(|(id, c)| {
            let c = c.as_ref()?;
            if c.state == ConnState::Connected && c.local == Some(local) && c.remote == Some(remote)
            {
                Some(id)
            } else {
                None
            }
        })
    }

    fn input_arp(&mut self, view: packet::ArpView) {
        self.arp.insert(view.sender_ip, view.sender_mac);
        if view.oper == packet::ARP_OPER_REQUEST && self.own_ip == Some(view.target_ip) {
            let reply = packet::build_arp(
                packet::ARP_OPER_REPLY,
                self.own_mac,
                view.target_ip,
                view.sender_mac,
                view.sender_ip,
            );
            self.txq.push_back(reply);
        }
    }

    fn input_tcp(&mut self, frame: &[u8], view: packet::TcpView) {
        let local = SocketAddrV4::new(Ipv4Addr::from(view.dst_ip), view.dst_port);
        let remote = SocketAddrV4::new(Ipv4Addr::from(view.src_ip), view.src_port);

        if view.flags & packet::TCP_FLAG_SYN != 0 {
            let Some(&listener) = self.listeners.get(&view.dst_port) else {
                self.rx_unmatched += 1;
                return;
            };
            let cap = self.conn(listener).map(|c| c.backlog_cap).unwrap_or(0);
            if self.conn(listener).map(|c| c.backlog.len()).unwrap_or(0) >= cap {
                self.rx_unmatched += 1;
                return;
            }
            let id = self.alloc_conn();
            {
                let conn = self.conns[id].as_mut().unwrap();
                conn.state = ConnState::Connected;
                conn.local = Some(local);
                conn.remote = Some(remote);
            }
            if let Ok(l) = self.conn_mut(listener) {
                l.backlog.push_back(id);
            }
            self.events.push_back(InetEvent::Acceptable { conn: listener });
            return;
        }

        let payload = &frame[view.payload_off..];
        if payload.is_empty() {
            return;
        }
        match self.find_by_tuple(local, remote) {
            Some(id) => {
                let conn = self.conns[id].as_mut().unwrap();
                conn.rx.extend(payload);
                self.push_readable(id);
            }
            None => self.rx_unmatched += 1,
        }
    }
}

impl Inet for LoopInet {
    fn socket(&mut self) -> Result<ConnId, Errno> {
        Ok(self.alloc_conn())
    }

    fn close(&mut self, conn: ConnId) -> Result<(), Errno> {
        let record = self.conns.get_mut(conn).and_then(|c| c.take()).ok_or(Errno::BADF)?;
        if record.state == ConnState::Listening {
            if let Some(port) = record.local.map(|a| a.port()) {
                if self.listeners.get(&port) == Some(&conn) {
                    self.listeners.remove(&port);
                }
            }
        }
        if let Some(peer) = record.peer {
            if let Some(p) = self.conns.get_mut(peer).and_then(|c| c.as_mut()) {
                p.peer = None;
                p.eof = true;
            }
            self.push_readable(peer);
        }
        self.free.push(conn);
        Ok(())
    }

    fn bind(&mut self, conn: ConnId, addr: SocketAddrV4) -> Result<(), Errno> {
        let c = self.conn_mut(conn)?;
        if c.state != ConnState::Fresh {
            return Err(Errno::INVAL);
        }
        c.local = Some(addr);
        c.state = ConnState::Bound;
        Ok(())
    }

    fn listen(&mut self, conn: ConnId, backlog: u32) -> Result<(), Errno> {
        let c = self.conn_mut(conn)?;
        let port = c.local.ok_or(Errno::INVAL)?.port();
        match c.state {
            ConnState::Bound | ConnState::Listening => {}
            _ => return Err(Errno::INVAL),
        }
        c.state = ConnState::Listening;
        c.backlog_cap = backlog.max(1) as usize;
        self.listeners.entry(port).or_insert(conn);
        Ok(())
    }

    fn accept(&mut self, conn: ConnId) -> Result<(ConnId, SocketAddrV4), Errno> {
        let c = self.conn_mut(conn)?;
        if c.state != ConnState::Listening {
            return Err(Errno::INVAL);
        }
        let id = c.backlog.pop_front().ok_or(Errno::AGAIN)?;
        let remote = self.conn(id)?.remote.ok_or(Errno::NOTCONN)?;
        Ok((id, remote))
    }

    fn connect(&mut self, conn: ConnId, addr: SocketAddrV4) -> Result<(), Errno> {
        {
            let c = self.conn(conn)?;
            match c.state {
                ConnState::Fresh | ConnState::Bound => {}
                ConnState::Connected => return Err(Errno::ISCONN),
                _ => return Err(Errno::INVAL),
            }
        }
        let &listener = self
            .listeners
            .get(&addr.port())
            .ok_or(Errno::CONNREFUSED)?;
        let cap = self.conn(listener)?.backlog_cap;
        if self.conn(listener)?.backlog.len() >= cap {
            return Err(Errno::CONNREFUSED);
        }

        let local = match self.conn(conn)?.local {
            Some(a) => a,
            None => self.ephemeral_addr(),
        };
        let server = self.alloc_conn();
        {
            let s = self.conns[server].as_mut().unwrap();
            s.state = ConnState::Connected;
            s.local = Some(addr);
            s.remote = Some(local);
            s.peer = Some(conn);
        }
        {
            let c = self.conns[conn].as_mut().unwrap();
            c.state = ConnState::Connected;
            c.local = Some(local);
            c.remote = Some(addr);
            c.peer = Some(server);
        }
        if let Ok(l) = self.conn_mut(listener) {
            l.backlog.push_back(server);
        }
        self.events.push_back(InetEvent::Acceptable { conn: listener });
        Ok(())
    }

    fn local_addr(&self, conn: ConnId) -> Result<SocketAddrV4, Errno> {
        self.conn(conn)?.local.ok_or(Errno::INVAL)
    }

    fn peer_addr(&self, conn: ConnId) -> Result<SocketAddrV4, Errno> {
        self.conn(conn)?.remote.ok_or(Errno::NOTCONN)
    }

    fn setsockopt(
        &mut self,
        conn: ConnId,
        level: i32,
        name: i32,
        value: i64,
    ) -> Result<(), Errno> {
        self.conn_mut(conn)?.opts.insert((level, name), value);
        Ok(())
    }

    fn getsockopt(&self, conn: ConnId, level: i32, name: i32) -> Result<i64, Errno> {
        Ok(*self.conn(conn)?.opts.get(&(level, name)).unwrap_or(&0))
    }

    fn send(&mut self, conn: ConnId, data: &[u8]) -> Result<usize, Errno> {
        let peer = {
            let c = self.conn(conn)?;
            if c.state != ConnState::Connected {
                return Err(Errno::NOTCONN);
            }
            c.peer.ok_or(Errno::PIPE)?
        };
        self.conn_mut(peer)?.rx.extend(data);
        self.push_readable(peer);
        Ok(data.len())
    }

    fn recv(&mut self, conn: ConnId, max: usize) -> Result<Vec<u8>, Errno> {
        let c = self.conn_mut(conn)?;
        if c.rx.is_empty() {
            if c.eof {
                return Ok(Vec::new());
            }
            return Err(Errno::AGAIN);
        }
        let n = c.rx.len().min(max);
        Ok(c.rx.drain(..n).collect())
    }

    fn acceptable(&self, conn: ConnId) -> bool {
        self.conn(conn)
            .map(|c| c.state == ConnState::Listening && !c.backlog.is_empty())
            .unwrap_or(false)
    }

    fn recv_pending(&self, conn: ConnId) -> bool {
        self.conn(conn).map(|c| !c.rx.is_empty()).unwrap_or(false)
    }

    fn input(&mut self, frame: &[u8]) {
        self.rx_frames += 1;
        if let Some(view) = packet::parse_arp(frame) {
            self.input_arp(view);
            return;
        }
        if let Some(view) = packet::parse_tcp(frame) {
            self.input_tcp(frame, view);
            return;
        }
        self.rx_unmatched += 1;
    }

    fn arp_lookup(&self, ip: u32) -> Option<[u8; 6]> {
        self.arp.get(&ip).copied()
    }

    fn poll_events(&mut self, max: usize, out: &mut Vec<InetEvent>) -> usize {
        let mut n = 0;
        while n < max {
            let Some(ev) = self.events.pop_front() else {
                break;
            };
            if let InetEvent::Readable { conn } = ev {
                if let Some(c) = self.conns.get_mut(conn).and_then(|c| c.as_mut()) {
                    c.readable_armed = false;
                }
            }
            out.push(ev);
            n += 1;
        }
        n
    }

    fn timer_tick(&mut self, _now_ms: u64) {
        self.timer_ticks += 1;
    }

    fn tx_drain(&mut self, pool: &PktPool, out: &mut Vec<PktBuf>) {
        while let Some(frame) = self.txq.pop_front() {
            match pool.alloc_from(&frame) {
                Some(buf) => out.push(buf),
                None => {
                    // retried on the next drain
                    self.txq.push_front(frame);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    #[test]
    fn loopback_connect_accept_echo() {
        let mut inet = LoopInet::new();
        let l = inet.socket().unwrap();
        inet.bind(l, addr(20000)).unwrap();
        inet.listen(l, 128).unwrap();

        let c = inet.socket().unwrap();
        inet.connect(c, addr(20000)).unwrap();
        assert!(inet.acceptable(l));

        let (s, peer) = inet.accept(l).unwrap();
        assert_eq!(peer.ip(), &Ipv4Addr::LOCALHOST);

        inet.send(c, b"ping").unwrap();
        assert_eq!(inet.recv(s, 64).unwrap(), b"ping");
        inet.send(s, b"ping").unwrap();
        assert_eq!(inet.recv(c, 64).unwrap(), b"ping");
        assert_eq!(inet.recv(c, 64), Err(Errno::AGAIN));
    }

    #[test]
    fn close_propagates_eof() {
        let mut inet = LoopInet::new();
        let l = inet.socket().unwrap();
        inet.bind(l, addr(7)).unwrap();
        inet.listen(l, 8).unwrap();
        let c = inet.socket().unwrap();
        inet.connect(c, addr(7)).unwrap();
        let (s, _) = inet.accept(l).unwrap();

        inet.close(c).unwrap();
        assert_eq!(inet.recv(s, 16).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn arp_request_updates_cache_and_replies() {
        let mut inet =
            LoopInet::with_identity(Ipv4Addr::new(10, 0, 0, 2), [2, 2, 2, 2, 2, 2]);
        let req = packet::build_arp(
            packet::ARP_OPER_REQUEST,
            [1, 1, 1, 1, 1, 1],
            packet::ip_of(10, 0, 0, 1),
            [0; 6],
            packet::ip_of(10, 0, 0, 2),
        );
        inet.input(&req);
        assert_eq!(
            inet.arp_lookup(packet::ip_of(10, 0, 0, 1)),
            Some([1, 1, 1, 1, 1, 1])
        );

        let pool = PktPool::new(4, 0);
        let mut out = Vec::new();
        inet.tx_drain(&pool, &mut out);
        assert_eq!(out.len(), 1);
        let reply = packet::parse_arp(out[0].data()).unwrap();
        assert_eq!(reply.oper, packet::ARP_OPER_REPLY);
        assert_eq!(reply.sender_mac, [2, 2, 2, 2, 2, 2]);
    }

    #[test]
    fn wire_syn_lands_in_backlog() {
        let mut inet = LoopInet::new();
        let l = inet.socket().unwrap();
        inet.bind(l, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 8080))
            .unwrap();
        inet.listen(l, 4).unwrap();

        let syn = packet::build_tcp(
            packet::ip_of(10, 0, 0, 9),
            packet::ip_of(10, 0, 0, 2),
            3333,
            8080,
            packet::TCP_FLAG_SYN,
            b"",
        );
        inet.input(&syn);
        assert!(inet.acceptable(l));
        let (s, remote) = inet.accept(l).unwrap();
        assert_eq!(remote, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 3333));

        let data = packet::build_tcp(
            packet::ip_of(10, 0, 0, 9),
            packet::ip_of(10, 0, 0, 2),
            3333,
            8080,
            0x18, // psh|ack
            b"hello",
        );
        inet.input(&data);
        assert_eq!(inet.recv(s, 64).unwrap(), b"hello");
    }
}
