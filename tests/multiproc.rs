//! Two cooperating "processes" (two groups in one test binary, sharing the
//! bridge directory and the shared buffer segment) exercising SYN steering,
//! flow-rule marshalling, and cross-process ARP.

mod common;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use fastpath::api;
use fastpath::group::StackGroup;
use fastpath::mbuf::PktPool;
use fastpath::packet::{self, TCP_FLAG_SYN};
use fastpath::rpc::{RpcReq, RpcRet};

use common::{base_cfg, conn_sum, init_logging, ring_opts, wait_until};

fn start_pair(
    dir: &std::path::Path,
    tuple_filter: bool,
) -> (
    Arc<StackGroup>,
    Arc<StackGroup>,
    std::collections::HashMap<u16, fastpath::dev::RingDevPort>,
) {
    let mut cfg0 = base_cfg(2, dir);
    cfg0.num_process = 2;
    cfg0.process_idx = 0;
    cfg0.is_primary = true;
    cfg0.tuple_filter = tuple_filter;
    let (opts0, ports0) = ring_opts(&cfg0);
    let g0 = StackGroup::start(cfg0, opts0).unwrap();

    let mut cfg1 = base_cfg(2, dir);
    cfg1.num_process = 2;
    cfg1.process_idx = 1;
    cfg1.is_primary = false;
    cfg1.tuple_filter = tuple_filter;
    let (opts1, _ports1) = ring_opts(&cfg1);
    let g1 = StackGroup::start(cfg1, opts1).unwrap();

    (g0, g1, ports0)
}

fn arp_resolves(group: &Arc<StackGroup>, idx: usize, ip: u32) -> Option<[u8; 6]> {
    match group.rpc_call(idx, RpcReq::ArpLookup { ip }) {
        Ok(RpcRet::Mac(mac)) => mac,
        _ => None,
    }
}

#[test]
fn syn_steering_hands_off_to_owning_process() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (g0, g1, ports0) = start_pair(dir.path(), true);

    // process 1 owns port 8080; the registration lands in the primary's table
    let lfd = api::socket(&g1, libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    api::bind(
        &g1,
        lfd,
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 8080),
    )
    .unwrap();
    api::listen_fd(&g1, lfd, 128).unwrap();
    assert_eq!(g0.listen_ports.get(8080), Some(1));

    // a SYN for that port arrives on process 0, queue 0
    let pool = PktPool::new(16, 0);
    let syn = packet::build_tcp(
        packet::ip_of(10, 0, 0, 9),
        packet::ip_of(10, 0, 0, 2),
        3333,
        8080,
        TCP_FLAG_SYN,
        b"",
    );
    ports0
        .get(&0)
        .unwrap()
        .inject(pool.alloc_from(&syn).unwrap())
        .unwrap();

    // it must surface as an acceptable connection on process 1 only
    api::fcntl(&g1, lfd, libc::F_SETFL, libc::O_NONBLOCK as i64).unwrap();
    let mut afd = None;
    assert!(wait_until(
        || match api::accept4(&g1, lfd, 0) {
            Ok(fd) => {
                afd = Some(fd);
                true
            }
            Err(_) => false,
        },
        Duration::from_secs(2)
    ));
    let afd = afd.unwrap();
    assert_eq!(
        api::getpeername(&g1, afd).unwrap(),
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 3333)
    );
    assert_eq!(conn_sum(&g0), 0, "no local delivery on process 0");

    // accepting with tuple filtering installs the flow rule on the primary
    assert!(wait_until(
        || g0.flow_table.count() == 1,
        Duration::from_secs(2)
    ));
    assert!(g0.flow_table.contains(packet::ip_of(10, 0, 0, 9), 3333, 8080));
    assert_eq!(g0.user_ports.get(8080), Some(1));

    // closing the accepted socket removes the rule over the same channel
    api::close(&g1, afd).unwrap();
    assert!(wait_until(
        || g0.flow_table.count() == 0,
        Duration::from_secs(2)
    ));

    api::close(&g1, lfd).unwrap();
    g1.stop();
    g0.stop();
}

#[test]
fn arp_reply_reaches_every_worker_in_every_process() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (g0, g1, ports0) = start_pair(dir.path(), false);

    let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
    let ip = packet::ip_of(10, 0, 0, 1);
    let reply = packet::build_arp(
        packet::ARP_OPER_REPLY,
        mac,
        ip,
        [0x02, 0, 0, 0, 0, 1],
        packet::ip_of(10, 0, 0, 2),
    );

    let pool = PktPool::new(16, 0);
    ports0
        .get(&0)
        .unwrap()
        .inject(pool.alloc_from(&reply).unwrap())
        .unwrap();

    // within bounded time every worker of both processes holds the binding
    for (group, name) in [(&g0, "p0"), (&g1, "p1")] {
        for idx in 0..group.stack_num() {
            assert!(
                wait_until(
                    || arp_resolves(group, idx, ip) == Some(mac),
                    Duration::from_secs(2)
                ),
                "{} stack {} never resolved the ARP binding",
                name,
                idx
            );
        }
    }

    g1.stop();
    g0.stop();
}

#[test]
fn primary_reports_worker_count_over_bridge() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (g0, g1, _ports0) = start_pair(dir.path(), false);

    // the non-primary already verified this at init; ask again directly
    let reply = fastpath::bridge::send_to_process(
        &g1.cfg,
        0,
        &{
            let mut m = fastpath::bridge::GET_STACK_NUM_MSG.as_bytes().to_vec();
            m.resize(fastpath::bridge::GET_STACK_NUM_LEN, 0);
            m
        },
        true,
    )
    .unwrap();
    assert_eq!(reply, fastpath::bridge::BridgeReply::Int(2));

    g1.stop();
    g0.stop();
}
