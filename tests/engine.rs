//! Single-process engine scenarios: loopback echo, listen fan-out, epoll
//! delivery, placement behavior, and the idle governor.

mod common;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fastpath::api;
use fastpath::group::StackGroup;
use fastpath::mbuf::PktPool;
use fastpath::sock::EV_IN;

use common::{base_cfg, conn_sum, init_logging, ring_opts, wait_until};

fn addr(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
}

#[test]
fn single_worker_tcp_echo() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let cfg = base_cfg(1, dir.path());
    let (opts, _ports) = ring_opts(&cfg);
    let group = StackGroup::start(cfg, opts).unwrap();

    assert_eq!(conn_sum(&group), 0);

    let lfd = api::socket(&group, libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    api::bind(&group, lfd, addr(20000)).unwrap();
    api::listen_fd(&group, lfd, 128).unwrap();

    let cfd = api::socket(&group, libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    api::connect(&group, cfd, addr(20000)).unwrap();

    let afd = api::accept(&group, lfd).unwrap();
    assert_eq!(conn_sum(&group), 3); // listener + client + accepted

    assert_eq!(api::send(&group, cfd, b"ping").unwrap(), 4);
    let mut buf = [0u8; 16];
    let n = api::recv(&group, afd, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");

    assert_eq!(api::send(&group, afd, &buf[..n]).unwrap(), 4);
    let n = api::recv(&group, cfd, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");

    api::close(&group, afd).unwrap();
    api::close(&group, cfd).unwrap();
    api::close(&group, lfd).unwrap();
    assert!(wait_until(
        || conn_sum(&group) == 0,
        Duration::from_secs(1)
    ));

    group.stop();
}

#[test]
fn listen_broadcast_fans_out_to_every_worker() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = base_cfg(4, dir.path());
    cfg.listen_shadow = true;
    let (opts, _ports) = ring_opts(&cfg);
    let group = StackGroup::start(cfg, opts).unwrap();

    let lfd = api::socket(&group, libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    api::bind(&group, lfd, addr(20001)).unwrap();
    api::listen_fd(&group, lfd, 128).unwrap();

    // one shadow per worker, all bound to the same address
    let chain = group.socktab.walk_listen_chain(lfd);
    assert_eq!(chain.len(), 4);
    let mut owners: Vec<usize> = chain.iter().map(|e| e.stack_idx).collect();
    owners.sort_unstable();
    assert_eq!(owners, vec![0, 1, 2, 3]);

    for entry in &chain {
        assert_eq!(api::getsockname(&group, entry.fd).unwrap(), addr(20001));
    }
    let masters = chain
        .iter()
        .filter(|e| e.inner.lock().unwrap().is_master_fd)
        .count();
    assert_eq!(masters, 1);

    // a client on another thread lands on some worker and its connection is
    // drained through that worker's shadow
    let g2 = group.clone();
    let client = thread::spawn(move || {
        let cfd = api::socket(&g2, libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        api::connect(&g2, cfd, addr(20001)).unwrap();
        assert_eq!(api::send(&g2, cfd, b"hi").unwrap(), 2);
        cfd
    });
    let afd = api::accept(&group, lfd).unwrap();
    let mut buf = [0u8; 8];
    let n = api::recv(&group, afd, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"hi");

    let cfd = client.join().unwrap();
    api::close(&group, afd).unwrap();
    api::close(&group, cfd).unwrap();
    api::close(&group, lfd).unwrap();
    assert!(group.socktab.get(lfd).is_err());

    group.stop();
}

#[test]
fn epoll_surfaces_fastpath_and_kernel_events() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = base_cfg(2, dir.path());
    // shadows on every worker, so the client may land anywhere
    cfg.listen_shadow = true;
    let (opts, _ports) = ring_opts(&cfg);
    let group = StackGroup::start(cfg, opts).unwrap();

    let lfd = api::socket(&group, libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    api::bind(&group, lfd, addr(20002)).unwrap();
    api::listen_fd(&group, lfd, 16).unwrap();

    let epfd = api::epoll_create(&group).unwrap();
    api::epoll_ctl(&group, epfd, libc::EPOLL_CTL_ADD, lfd, EV_IN, 41).unwrap();

    let g2 = group.clone();
    let client = thread::spawn(move || {
        let cfd = api::socket(&g2, libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        api::connect(&g2, cfd, addr(20002)).unwrap();
        cfd
    });

    let events = api::epoll_wait(&group, epfd, 8, 2000).unwrap();
    assert!(events.iter().any(|&(data, ev)| data == 41 && ev & EV_IN != 0));
    let afd = api::accept(&group, lfd).unwrap();

    // kernel-owned fd goes through the per-worker kernel-event thread
    let mut pipe = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(pipe.as_mut_ptr()) }, 0);
    api::epoll_ctl(&group, epfd, libc::EPOLL_CTL_ADD, pipe[0], EV_IN, 42).unwrap();
    assert_eq!(
        unsafe { libc::write(pipe[1], b"x".as_ptr() as *const libc::c_void, 1) },
        1
    );
    let events = api::epoll_wait(&group, epfd, 8, 2000).unwrap();
    assert!(events.iter().any(|&(data, ev)| data == 42 && ev & EV_IN != 0));

    unsafe {
        libc::close(pipe[0]);
        libc::close(pipe[1]);
    }
    let cfd = client.join().unwrap();
    api::close(&group, afd).unwrap();
    api::close(&group, cfd).unwrap();
    api::close(&group, lfd).unwrap();
    api::epoll_close(&group, epfd).unwrap();
    group.stop();
}

#[test]
fn placement_wraps_past_worker_count() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let cfg = base_cfg(2, dir.path());
    let (opts, _ports) = ring_opts(&cfg);
    let group = StackGroup::start(cfg, opts).unwrap();

    // more threads than workers: round-robin must wrap, not fail
    let fds: Vec<_> = (0..8)
        .map(|_| {
            let g = group.clone();
            thread::spawn(move || {
                api::socket(&g, libc::AF_INET, libc::SOCK_STREAM, 0).unwrap()
            })
        })
        .collect();
    let fds: Vec<_> = fds.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(fds.len(), 8);
    assert_eq!(conn_sum(&group), 8);

    let spread: std::collections::HashSet<usize> = fds
        .iter()
        .map(|&fd| group.socktab.get(fd).unwrap().stack_idx)
        .collect();
    assert_eq!(spread.len(), 2, "both workers should receive placements");

    for fd in fds {
        api::close(&group, fd).unwrap();
    }
    assert!(wait_until(
        || conn_sum(&group) == 0,
        Duration::from_secs(1)
    ));
    group.stop();
}

#[test]
fn sticky_binding_keeps_a_thread_on_one_worker() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let cfg = base_cfg(4, dir.path());
    let (opts, _ports) = ring_opts(&cfg);
    let group = StackGroup::start(cfg, opts).unwrap();

    let fds: Vec<_> = (0..4)
        .map(|_| api::socket(&group, libc::AF_INET, libc::SOCK_STREAM, 0).unwrap())
        .collect();
    let owners: std::collections::HashSet<usize> = fds
        .iter()
        .map(|&fd| group.socktab.get(fd).unwrap().stack_idx)
        .collect();
    assert_eq!(owners.len(), 1, "one thread stays on one worker");

    for fd in fds {
        api::close(&group, fd).unwrap();
    }
    group.stop();
}

#[test]
fn idle_governor_tracks_traffic() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = base_cfg(1, dir.path());
    cfg.low_power_mode = true;
    // threshold 0 keeps the governor on the detect-window path, which makes
    // the flip observable without racing the drain rate
    cfg.lpm_rx_pkts = 0;
    cfg.lpm_detect_ms = 50;
    cfg.lpm_pkts_in_detect = 20;
    let (opts, ports) = ring_opts(&cfg);
    let group = StackGroup::start(cfg, opts).unwrap();
    let stack = group.stack(0).unwrap();
    let port = ports.get(&0).unwrap().clone();

    // nothing arriving: the worker must start dozing
    assert!(wait_until(
        || stack.low_power.load(Ordering::Relaxed),
        Duration::from_secs(1)
    ));

    // sustained traffic flips it back within a detect window
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let injector = {
        let stop = stop.clone();
        let pool = PktPool::new(4096, 0);
        thread::spawn(move || {
            let frame = vec![0u8; 60];
            while !stop.load(Ordering::Relaxed) {
                if let Some(buf) = pool.alloc_from(&frame) {
                    let _ = port.inject(buf);
                }
            }
        })
    };
    assert!(wait_until(
        || !stack.low_power.load(Ordering::Relaxed),
        Duration::from_secs(2)
    ));

    // traffic stops: back to low power within a window
    stop.store(true, Ordering::Relaxed);
    injector.join().unwrap();
    assert!(wait_until(
        || stack.low_power.load(Ordering::Relaxed),
        Duration::from_secs(2)
    ));

    group.stop();
}
