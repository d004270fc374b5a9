/*!
A userspace network fast path that keeps TCP/UDP traffic out of the kernel.

An application links against a shim that intercepts socket-family calls;
traffic is served by a fleet of poll-mode workers, one per assigned CPU core,
each bound to a dedicated NIC receive/transmit queue. Packets enter through a
poll-mode device (no interrupts), run through the worker's own single-threaded
TCP/IP instance, and reach the application over lock-free rings. Anything the
fast path does not own is diverted back to the host kernel through a tap.

The pieces:

* one [`stack::Stack`] per core: pinned thread, poll loop, TCP/IP instance,
  packet pool, RPC inbound ring;
* a process-wide [`group::StackGroup`]: placement, port ownership, flow
  rules, staged init;
* [`listen`]: shadow listeners on every worker, accepts drained from the
  least-loaded one;
* [`dispatch`]: 4-tuple steering on queue 0 when several processes share the
  NIC, with the [`bridge`] carrying cross-process hand-off;
* [`api`]: the POSIX-superset surface the shim calls into.

The TCP/IP state machine and the real NIC driver stay behind the
[`inet::Inet`] and [`dev::PollDev`] traits; the in-tree `LoopInet` and
`RingDev` implementations make the whole engine runnable in tests without
hardware.

```
use fastpath::config::RuntimeConfig;
use fastpath::group::{RunOpts, StackGroup};

let cfg = RuntimeConfig {
    cpus: vec![0],
    run_dir: std::env::temp_dir().join("fastpath-doc"),
    ..RuntimeConfig::default()
};
let group = StackGroup::start(cfg, RunOpts::default()).unwrap();

let fd = fastpath::api::socket(&group, libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
fastpath::api::close(&group, fd).unwrap();
group.stop();
```

Linux-only: the engine leans on eventfd, epoll and sched affinity.
*/

pub mod api;
pub mod bridge;
pub mod config;
pub mod dev;
pub mod dispatch;
pub mod error;
pub mod flow;
pub mod group;
pub mod inet;
pub mod listen;
pub mod mbuf;
pub mod packet;
pub mod power;
pub mod ring;
pub mod rpc;
pub mod sock;
pub mod stack;
pub mod stats;
pub mod sync;
pub mod wakeup;

pub use config::RuntimeConfig;
pub use error::{Errno, Error, Result};
pub use group::{RunOpts, StackGroup};
pub use sock::Fd;
