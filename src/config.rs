//! Runtime configuration.
//!
//! The engine is configured from a TOML file (typically named on the command
//! line of the embedding application). Every tunable has a serde default so a
//! minimal file only needs the CPU list. `RuntimeConfig::validate` runs before
//! any worker is spawned; a bad CPU mask or a zero queue count is fatal at
//! init, never later.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default runtime directory holding the bridge sockets and primary marker.
pub const DEFAULT_RUN_DIR: &str = "/var/run/gazelle";
/// Bridge socket filename prefix; the process index is appended.
pub const SERVER_SOCKET: &str = "server.socket";
/// Marker file the primary process creates once its device is up.
pub const PRIMARY_MARKER: &str = "primary";
/// Mode for `run_dir` and everything under it.
pub const RUN_DIR_MODE: u32 = 0o700;

fn default_true() -> bool {
    true
}
fn default_rpc_number() -> u32 {
    32
}
fn default_nic_read_number() -> u32 {
    128
}
fn default_read_connect_number() -> u32 {
    32
}
fn default_ring_size() -> usize {
    512
}
fn default_num_process() -> u8 {
    1
}
fn default_is_primary() -> bool {
    true
}
fn default_tcp_conn_count() -> u32 {
    1500
}
fn default_mbuf_count_per_conn() -> u32 {
    170
}
fn default_lpm_rx_pkts() -> u32 {
    16
}
fn default_lpm_detect_ms() -> u32 {
    1000
}
fn default_lpm_pkts_in_detect() -> u32 {
    1000
}
fn default_run_dir() -> PathBuf {
    PathBuf::from(DEFAULT_RUN_DIR)
}
fn default_cpus() -> Vec<u32> {
    let n = std::cmp::min(num_cpus::get(), 4) as u32;
    (0..n).collect()
}

/// Runtime options for the whole process.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// CPU ids the workers are pinned to, one worker per entry. Ignored when
    /// `split_send_recv` is set.
    #[serde(default = "default_cpus")]
    pub cpus: Vec<u32>,

    /// Dedicated send-role worker CPUs (split mode only).
    #[serde(default)]
    pub send_cpus: Vec<u32>,

    /// Dedicated recv-role worker CPUs (split mode only).
    #[serde(default)]
    pub recv_cpus: Vec<u32>,

    /// Run separate send-role and recv-role workers instead of unified ones.
    #[serde(default)]
    pub split_send_recv: bool,

    /// Steer inbound flows by 4-tuple on queue 0 (multi-process NIC sharing).
    #[serde(default)]
    pub tuple_filter: bool,

    /// Install a shadow listen socket on every worker on `listen`.
    #[serde(default)]
    pub listen_shadow: bool,

    /// Packets arrive via a co-process forwarder instead of a directly owned
    /// NIC queue.
    #[serde(default)]
    pub use_forwarder: bool,

    /// Divert non-accelerated traffic to the host kernel through the tap.
    #[serde(default)]
    pub kernel_tap: bool,

    /// Same-NUMA-node receive shortcut, drained every 256 loop iterations.
    #[serde(default)]
    pub same_node_fastpath: bool,

    /// Stamp RX packets and keep latency counters.
    #[serde(default)]
    pub latency_trace: bool,

    /// Also deliver a worker's own ARP broadcast copy back to itself. In
    /// multi-process mode the receiving worker diverts the original frame to
    /// the kernel, so the looped copy is how its own ARP cache learns the
    /// binding. Turn off under a co-process forwarder, which already loops
    /// the frame.
    #[serde(default = "default_true")]
    pub arp_loop_to_self: bool,

    /// Low-power idling.
    #[serde(default)]
    pub low_power_mode: bool,
    #[serde(default = "default_lpm_rx_pkts")]
    pub lpm_rx_pkts: u32,
    #[serde(default = "default_lpm_detect_ms")]
    pub lpm_detect_ms: u32,
    #[serde(default = "default_lpm_pkts_in_detect")]
    pub lpm_pkts_in_detect: u32,

    /// Batch limits for the poll-loop phases.
    #[serde(default = "default_rpc_number")]
    pub rpc_number: u32,
    #[serde(default = "default_nic_read_number")]
    pub nic_read_number: u32,
    #[serde(default = "default_read_connect_number")]
    pub read_connect_number: u32,

    /// Capacity of the per-worker RPC / RX / mailbox rings.
    #[serde(default = "default_ring_size")]
    pub ring_size: usize,

    /// Cooperating processes sharing the NIC.
    #[serde(default = "default_num_process")]
    pub num_process: u8,
    #[serde(default)]
    pub process_idx: u8,
    #[serde(default = "default_is_primary")]
    pub is_primary: bool,

    /// Packet-pool sizing.
    #[serde(default = "default_tcp_conn_count")]
    pub tcp_conn_count: u32,
    #[serde(default = "default_mbuf_count_per_conn")]
    pub mbuf_count_per_conn: u32,

    /// Directory for bridge sockets and the primary marker.
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl RuntimeConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<RuntimeConfig> {
        let text = fs::read_to_string(path)?;
        let cfg: RuntimeConfig =
            toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Number of workers this process runs.
    pub fn stack_num(&self) -> usize {
        if self.split_send_recv {
            // one recv + one send worker per configured core pair
            self.recv_cpus.len() + self.send_cpus.len()
        } else {
            self.cpus.len()
        }
    }

    /// NIC queues owned per process; queue ids are dense across processes.
    pub fn num_queue(&self) -> u16 {
        self.stack_num() as u16
    }

    pub fn total_queue_num(&self) -> u16 {
        self.num_queue() * self.num_process as u16
    }

    /// CPU id and role for worker `idx`.
    pub fn worker_cpu(&self, idx: usize) -> (u32, crate::stack::StackRole) {
        use crate::stack::StackRole;
        if self.split_send_recv {
            // even idx = recv worker, odd idx = send worker
            if idx % 2 == 0 {
                (self.recv_cpus[idx / 2], StackRole::Recv)
            } else {
                (self.send_cpus[idx / 2], StackRole::Send)
            }
        } else {
            (self.cpus[idx], StackRole::Unified)
        }
    }

    /// Per-pool buffer count, derived the same way the pool is provisioned.
    pub fn mbufs_per_pool(&self) -> usize {
        let total = self.mbuf_count_per_conn as usize * self.tcp_conn_count as usize;
        std::cmp::max(64, total / std::cmp::max(1, self.stack_num()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.split_send_recv {
            if self.send_cpus.is_empty() || self.send_cpus.len() != self.recv_cpus.len() {
                return Err(Error::Config(
                    "split_send_recv requires equal, non-empty send_cpus/recv_cpus".into(),
                ));
            }
        } else if self.cpus.is_empty() {
            return Err(Error::Config("cpus must name at least one core".into()));
        }
        let online = num_cpus::get() as u32;
        let bad = self
            .cpus
            .iter()
            .chain(&self.send_cpus)
            .chain(&self.recv_cpus)
            .find(|&&c| c >= online);
        if let Some(&c) = bad {
            return Err(Error::Config(format!(
                "cpu {} not present (host has {})",
                c, online
            )));
        }
        if self.num_process == 0 || self.process_idx >= self.num_process {
            return Err(Error::Config(format!(
                "process_idx {} out of range for num_process {}",
                self.process_idx, self.num_process
            )));
        }
        if self.ring_size == 0 || !self.ring_size.is_power_of_two() {
            return Err(Error::Config("ring_size must be a power of two".into()));
        }
        if self.num_process > 1 && self.tuple_filter && self.is_primary && self.process_idx != 0 {
            return Err(Error::Config("primary process must have index 0".into()));
        }
        Ok(())
    }

    pub fn server_socket_path(&self, process_idx: u8) -> PathBuf {
        self.run_dir
            .join(format!("{}{}", SERVER_SOCKET, process_idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = RuntimeConfig::default();
        cfg.validate().unwrap();
        assert!(cfg.stack_num() >= 1);
        assert_eq!(cfg.num_process, 1);
        assert!(cfg.is_primary);
    }

    #[test]
    fn minimal_toml() {
        let cfg: RuntimeConfig = toml::from_str("cpus = [0]").unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.stack_num(), 1);
        assert_eq!(cfg.nic_read_number, 128);
    }

    #[test]
    fn split_mode_requires_cpu_lists() {
        let cfg: RuntimeConfig = toml::from_str("split_send_recv = true").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn ring_size_must_be_pow2() {
        let cfg: RuntimeConfig = toml::from_str("cpus = [0]\nring_size = 500").unwrap();
        assert!(cfg.validate().is_err());
    }
}
