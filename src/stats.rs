//! Per-worker counters.
//!
//! Counters are plain relaxed atomics: each is written by one worker and read
//! by the diagnostic surface, so no ordering is needed beyond atomicity.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

#[derive(Default)]
pub struct StackStats {
    pub rx: CachePadded<AtomicU64>,
    pub tx: CachePadded<AtomicU64>,
    pub rx_drop: AtomicU64,
    pub tx_drop: AtomicU64,
    pub rx_alloc_fail: AtomicU64,
    pub arp_copy_fail: AtomicU64,
    pub call_msg_cnt: AtomicU64,
    pub kernel_forward: AtomicU64,
    pub accept_events: AtomicU64,
    pub read_events: AtomicU64,
    pub latency: LatencyStats,
}

impl StackStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rx: self.rx.load(Ordering::Relaxed),
            tx: self.tx.load(Ordering::Relaxed),
            rx_drop: self.rx_drop.load(Ordering::Relaxed),
            tx_drop: self.tx_drop.load(Ordering::Relaxed),
            rx_alloc_fail: self.rx_alloc_fail.load(Ordering::Relaxed),
            arp_copy_fail: self.arp_copy_fail.load(Ordering::Relaxed),
            call_msg_cnt: self.call_msg_cnt.load(Ordering::Relaxed),
            kernel_forward: self.kernel_forward.load(Ordering::Relaxed),
            accept_events: self.accept_events.load(Ordering::Relaxed),
            read_events: self.read_events.load(Ordering::Relaxed),
            latency_pkts: self.latency.pkts.load(Ordering::Relaxed),
            latency_total_ns: self.latency.total_ns.load(Ordering::Relaxed),
            latency_max_ns: self.latency.max_ns.load(Ordering::Relaxed),
        }
    }
}

/// RX-to-delivery latency accumulators, active only with latency tracing on.
#[derive(Default)]
pub struct LatencyStats {
    pub pkts: AtomicU64,
    pub total_ns: AtomicU64,
    pub max_ns: AtomicU64,
}

impl LatencyStats {
    pub fn record(&self, ns: u64) {
        self.pkts.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub rx: u64,
    pub tx: u64,
    pub rx_drop: u64,
    pub tx_drop: u64,
    pub rx_alloc_fail: u64,
    pub arp_copy_fail: u64,
    pub call_msg_cnt: u64,
    pub kernel_forward: u64,
    pub accept_events: u64,
    pub read_events: u64,
    pub latency_pkts: u64,
    pub latency_total_ns: u64,
    pub latency_max_ns: u64,
}
