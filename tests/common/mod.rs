//! Shared plumbing for the integration tests: ring-backed devices whose far
//! ends the test holds, and a tiny poll-until helper.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fastpath::config::RuntimeConfig;
use fastpath::dev::{RingDev, RingDevPort};
use fastpath::group::{RunOpts, StackGroup};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn base_cfg(workers: usize, run_dir: &Path) -> RuntimeConfig {
    let online = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1) as u32;
    RuntimeConfig {
        cpus: (0..workers).map(|i| i as u32 % online).collect(),
        run_dir: run_dir.to_path_buf(),
        ..RuntimeConfig::default()
    }
}

/// Build run options whose devices are ring pairs; the returned map holds the
/// far end of each queue, keyed by queue id.
pub fn ring_opts(cfg: &RuntimeConfig) -> (RunOpts, HashMap<u16, RingDevPort>) {
    let mut devs: HashMap<u16, RingDev> = HashMap::new();
    let mut ports = HashMap::new();
    let base = cfg.process_idx as u16 * cfg.num_queue();
    for i in 0..cfg.num_queue() {
        let (dev, port) = RingDev::with_port(cfg.ring_size);
        devs.insert(base + i, dev);
        ports.insert(base + i, port);
    }
    let devs = Mutex::new(devs);
    let opts = RunOpts {
        dev_factory: Box::new(move |q| {
            Box::new(devs.lock().unwrap().remove(&q).expect("queue already taken"))
        }),
        ..RunOpts::default()
    };
    (opts, ports)
}

pub fn wait_until<F: FnMut() -> bool>(mut pred: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    pred()
}

pub fn conn_sum(group: &Arc<StackGroup>) -> u32 {
    group
        .stacks()
        .iter()
        .map(|s| s.conn_num.load(Ordering::Acquire))
        .sum()
}
