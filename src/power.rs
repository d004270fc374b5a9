//! Low-power idle governor.
//!
//! A poll-mode worker burns its core even when nothing arrives. With
//! `low_power_mode` on, the worker yields 1 ns per iteration whenever the
//! observed traffic falls under the thresholds:
//!
//! 1. queue depth below `lpm_rx_pkts` puts the worker to sleep immediately;
//! 2. otherwise a detect window runs: once `lpm_detect_ms` elapses or the
//!    packet delta reaches `lpm_pkts_in_detect`, `low_power` is recomputed
//!    from the delta and the window resets.
//!
//! In direct-NIC mode there is no queue to measure, so a sentinel above the
//! threshold forces the window path. The governor takes no lock; `low_power`
//! is a relaxed store read only by diagnostics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct LowPowerCfg {
    pub rx_pkts: u32,
    pub detect_ms: u32,
    pub pkts_in_detect: u32,
}

pub struct LowPowerState {
    window_start: Option<Instant>,
    window_pkts: u64,
}

impl LowPowerState {
    pub fn new() -> LowPowerState {
        LowPowerState {
            window_start: None,
            window_pkts: 0,
        }
    }
}

impl Default for LowPowerState {
    fn default() -> Self {
        LowPowerState::new()
    }
}

fn doze() {
    thread::sleep(Duration::from_nanos(1));
}

/// One governor step. `queue_depth` is the device's RX+TX depth, or `None`
/// in direct-NIC mode; `rx_total` is the worker's lifetime RX counter.
pub fn low_power_idling(
    cfg: &LowPowerCfg,
    queue_depth: Option<usize>,
    rx_total: u64,
    state: &mut LowPowerState,
    low_power: &AtomicBool,
) {
    let traffic = queue_depth.unwrap_or(cfg.rx_pkts as usize + 1);
    if traffic < cfg.rx_pkts as usize {
        low_power.store(true, Ordering::Relaxed);
        doze();
        return;
    }

    let now = Instant::now();
    let start = match state.window_start {
        Some(t) => t,
        None => {
            state.window_start = Some(now);
            state.window_pkts = rx_total;
            now
        }
    };

    let delta = rx_total.saturating_sub(state.window_pkts);
    let window_over = now.duration_since(start).as_millis() as u64 > cfg.detect_ms as u64;
    if window_over || delta >= cfg.pkts_in_detect as u64 {
        low_power.store(delta < cfg.pkts_in_detect as u64, Ordering::Relaxed);
        state.window_start = Some(now);
        state.window_pkts = rx_total;
    }

    if low_power.load(Ordering::Relaxed) {
        doze();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CFG: LowPowerCfg = LowPowerCfg {
        rx_pkts: 16,
        detect_ms: 10,
        pkts_in_detect: 100,
    };

    #[test]
    fn shallow_queue_sleeps_immediately() {
        let mut st = LowPowerState::new();
        let lp = AtomicBool::new(false);
        low_power_idling(&CFG, Some(3), 0, &mut st, &lp);
        assert!(lp.load(Ordering::Relaxed));
    }

    #[test]
    fn busy_window_clears_low_power() {
        let mut st = LowPowerState::new();
        let lp = AtomicBool::new(true);
        // first step opens the window at rx=0
        low_power_idling(&CFG, Some(1000), 0, &mut st, &lp);
        // enough packets arrive inside the window
        low_power_idling(&CFG, Some(1000), 500, &mut st, &lp);
        assert!(!lp.load(Ordering::Relaxed));
    }

    #[test]
    fn quiet_window_sets_low_power() {
        let mut st = LowPowerState::new();
        let lp = AtomicBool::new(false);
        low_power_idling(&CFG, None, 0, &mut st, &lp);
        assert!(!lp.load(Ordering::Relaxed));
        std::thread::sleep(Duration::from_millis(15));
        // window expired with a delta of zero
        low_power_idling(&CFG, None, 0, &mut st, &lp);
        assert!(lp.load(Ordering::Relaxed));
    }

    #[test]
    fn recovers_within_one_window() {
        let mut st = LowPowerState::new();
        let lp = AtomicBool::new(false);
        low_power_idling(&CFG, None, 0, &mut st, &lp);
        std::thread::sleep(Duration::from_millis(15));
        low_power_idling(&CFG, None, 0, &mut st, &lp);
        assert!(lp.load(Ordering::Relaxed));
        // traffic returns: the delta crosses the threshold and flips it back
        low_power_idling(&CFG, None, 200, &mut st, &lp);
        assert!(!lp.load(Ordering::Relaxed));
    }
}
