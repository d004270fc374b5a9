//! Wire-format views and builders.
//!
//! Just enough Ethernet/ARP/IPv4/TCP to steer packets: the dispatcher needs
//! the ethertype, the TCP 4-tuple and the SYN flag; the ARP broadcast needs
//! the sender binding. Parsing is zero-copy over the frame bytes; builders
//! exist for tests and the loopback stack.

use byteorder::{BigEndian, ByteOrder};

pub const ETH_HDR_LEN: usize = 14;
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const IPV4_HDR_LEN: usize = 20;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const ARP_OPER_REQUEST: u16 = 1;
pub const ARP_OPER_REPLY: u16 = 2;

pub const MAC_BROADCAST: [u8; 6] = [0xff; 6];

pub fn ether_type(frame: &[u8]) -> Option<u16> {
    if frame.len() < ETH_HDR_LEN {
        return None;
    }
    Some(BigEndian::read_u16(&frame[12..14]))
}

pub fn ether_dst(frame: &[u8]) -> Option<[u8; 6]> {
    if frame.len() < ETH_HDR_LEN {
        return None;
    }
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&frame[0..6]);
    Some(mac)
}

pub fn is_arp(frame: &[u8]) -> bool {
    ether_type(frame) == Some(ETHERTYPE_ARP)
}

/// Parsed view of an Ethernet/ARP frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpView {
    pub oper: u16,
    pub sender_mac: [u8; 6],
    pub sender_ip: u32,
    pub target_mac: [u8; 6],
    pub target_ip: u32,
}

pub fn parse_arp(frame: &[u8]) -> Option<ArpView> {
    if !is_arp(frame) || frame.len() < ETH_HDR_LEN + 28 {
        return None;
    }
    let p = &frame[ETH_HDR_LEN..];
    let mut sender_mac = [0u8; 6];
    let mut target_mac = [0u8; 6];
    sender_mac.copy_from_slice(&p[8..14]);
    target_mac.copy_from_slice(&p[18..24]);
    Some(ArpView {
        oper: BigEndian::read_u16(&p[6..8]),
        sender_mac,
        sender_ip: BigEndian::read_u32(&p[14..18]),
        target_mac,
        target_ip: BigEndian::read_u32(&p[24..28]),
    })
}

/// Parsed view of the IPv4+TCP portion of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpView {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: u8,
    pub payload_off: usize,
}

/// Parse an Ethernet/IPv4/TCP frame; `None` for anything else.
pub fn parse_tcp(frame: &[u8]) -> Option<TcpView> {
    if ether_type(frame)? != ETHERTYPE_IPV4 {
        return None;
    }
    let ip = &frame[ETH_HDR_LEN..];
    if ip.len() < IPV4_HDR_LEN {
        return None;
    }
    if ip[0] >> 4 != 4 {
        return None;
    }
    let ihl = ((ip[0] & 0x0f) as usize) * 4;
    if ip[9] != IPPROTO_TCP || ip.len() < ihl + 20 {
        return None;
    }
    let tcp = &ip[ihl..];
    let data_off = ((tcp[12] >> 4) as usize) * 4;
    Some(TcpView {
        src_ip: BigEndian::read_u32(&ip[12..16]),
        dst_ip: BigEndian::read_u32(&ip[16..20]),
        src_port: BigEndian::read_u16(&tcp[0..2]),
        dst_port: BigEndian::read_u16(&tcp[2..4]),
        flags: tcp[13],
        payload_off: ETH_HDR_LEN + ihl + data_off,
    })
}

pub fn ipv4_proto(frame: &[u8]) -> Option<u8> {
    if ether_type(frame)? != ETHERTYPE_IPV4 {
        return None;
    }
    let ip = &frame[ETH_HDR_LEN..];
    if ip.len() < IPV4_HDR_LEN || ip[0] >> 4 != 4 {
        return None;
    }
    Some(ip[9])
}

/// Jenkins lookup3 final mix over three words, as used for SYN steering.
/// Deterministic across processes, which is what keeps a flow's packets on
/// the same queue no matter which process hashes them.
pub fn jhash_3words(mut a: u32, mut b: u32, mut c: u32) -> u32 {
    const INITVAL: u32 = 0xdeadbeef;
    a = a.wrapping_add(INITVAL);
    b = b.wrapping_add(INITVAL);
    c = c.wrapping_add(INITVAL);

    c ^= b;
    c = c.wrapping_sub(b.rotate_left(14));
    a ^= c;
    a = a.wrapping_sub(c.rotate_left(11));
    b ^= a;
    b = b.wrapping_sub(a.rotate_left(25));
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(16));
    a ^= c;
    a = a.wrapping_sub(c.rotate_left(4));
    b ^= a;
    b = b.wrapping_sub(a.rotate_left(14));
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(24));
    c
}

/// Queue index a SYN is steered to, out of `queues_per_process`.
pub fn syn_steer_index(src_ip: u32, src_port: u16, dst_port: u16, queues: u16) -> u16 {
    let h = jhash_3words(src_ip, src_port as u32 | ((dst_port as u32) << 16), 0);
    (h % queues as u32) as u16
}

fn eth_header(dst: [u8; 6], src: [u8; 6], ethertype: u16) -> Vec<u8> {
    let mut f = Vec::with_capacity(64);
    f.extend_from_slice(&dst);
    f.extend_from_slice(&src);
    let mut et = [0u8; 2];
    BigEndian::write_u16(&mut et, ethertype);
    f.extend_from_slice(&et);
    f
}

/// Build an ARP frame (request or reply).
pub fn build_arp(
    oper: u16,
    sender_mac: [u8; 6],
    sender_ip: u32,
    target_mac: [u8; 6],
    target_ip: u32,
) -> Vec<u8> {
    let dst = if oper == ARP_OPER_REQUEST {
        MAC_BROADCAST
    } else {
        target_mac
    };
    let mut f = eth_header(dst, sender_mac, ETHERTYPE_ARP);
    let mut w = [0u8; 28];
    BigEndian::write_u16(&mut w[0..2], 1); // ethernet
    BigEndian::write_u16(&mut w[2..4], ETHERTYPE_IPV4);
    w[4] = 6;
    w[5] = 4;
    BigEndian::write_u16(&mut w[6..8], oper);
    w[8..14].copy_from_slice(&sender_mac);
    BigEndian::write_u32(&mut w[14..18], sender_ip);
    w[18..24].copy_from_slice(&target_mac);
    BigEndian::write_u32(&mut w[24..28], target_ip);
    f.extend_from_slice(&w);
    f
}

/// Build an Ethernet/IPv4/TCP frame with the given flags and payload.
pub fn build_tcp(
    src_ip: u32,
    dst_ip: u32,
    src_port: u16,
    dst_port: u16,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut f = eth_header([0u8; 6], [0u8; 6], ETHERTYPE_IPV4);

    let total = (IPV4_HDR_LEN + 20 + payload.len()) as u16;
    let mut ip = [0u8; IPV4_HDR_LEN];
    ip[0] = 0x45;
    BigEndian::write_u16(&mut ip[2..4], total);
    ip[8] = 64; // ttl
    ip[9] = IPPROTO_TCP;
    BigEndian::write_u32(&mut ip[12..16], src_ip);
    BigEndian::write_u32(&mut ip[16..20], dst_ip);
    f.extend_from_slice(&ip);

    let mut tcp = [0u8; 20];
    BigEndian::write_u16(&mut tcp[0..2], src_port);
    BigEndian::write_u16(&mut tcp[2..4], dst_port);
    tcp[12] = 0x50; // data offset 5 words
    tcp[13] = flags;
    f.extend_from_slice(&tcp);
    f.extend_from_slice(payload);
    f
}

pub fn ip_of(a: u8, b: u8, c: u8, d: u8) -> u32 {
    u32::from(a) << 24 | u32::from(b) << 16 | u32::from(c) << 8 | u32::from(d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arp_roundtrip() {
        let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
        let f = build_arp(ARP_OPER_REPLY, mac, ip_of(10, 0, 0, 1), [1; 6], ip_of(10, 0, 0, 2));
        assert!(is_arp(&f));
        let v = parse_arp(&f).unwrap();
        assert_eq!(v.oper, ARP_OPER_REPLY);
        assert_eq!(v.sender_mac, mac);
        assert_eq!(v.sender_ip, ip_of(10, 0, 0, 1));
    }

    #[test]
    fn tcp_view_fields() {
        let f = build_tcp(ip_of(1, 2, 3, 4), ip_of(5, 6, 7, 8), 1000, 80, TCP_FLAG_SYN, b"x");
        let v = parse_tcp(&f).unwrap();
        assert_eq!(v.src_ip, ip_of(1, 2, 3, 4));
        assert_eq!(v.dst_port, 80);
        assert_eq!(v.flags & TCP_FLAG_SYN, TCP_FLAG_SYN);
        assert_eq!(&f[v.payload_off..], b"x");
    }

    #[test]
    fn non_tcp_is_rejected() {
        let arp = build_arp(ARP_OPER_REQUEST, [0; 6], 1, [0; 6], 2);
        assert!(parse_tcp(&arp).is_none());
    }

    #[test]
    fn steering_is_deterministic_and_bounded() {
        for q in [1u16, 2, 4, 8] {
            let a = syn_steer_index(ip_of(9, 9, 9, 9), 1234, 80, q);
            let b = syn_steer_index(ip_of(9, 9, 9, 9), 1234, 80, q);
            assert_eq!(a, b);
            assert!(a < q);
        }
    }
}
