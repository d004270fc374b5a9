//! Flow-rule table.
//!
//! Rules steer a flow's packets straight to the owning worker's NIC queue so
//! only the first packet (the SYN) crosses the dispatcher. The table is keyed
//! by `"src_ip_src_port_dst_port"` as seen in the inbound packet; a delete
//! arrives in the connection's perspective (remote ip, local port, remote
//! port) and re-derives the same key. Creating an existing key is a no-op;
//! deleting a missing key is a no-op. Only the primary process programs the
//! NIC — peers marshal requests over the bridge before this table is touched.
//!
//! The rule counter is diagnostic only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::dev::{FlowHandle, FlowSpec};
use crate::error::Result;

/// What actually programs steering rules into hardware. The ring-backed
/// device has no hardware, so the default programmer just mints handles.
pub trait FlowProgrammer: Send {
    fn create(&mut self, spec: &FlowSpec) -> Result<FlowHandle>;
    fn destroy(&mut self, handle: FlowHandle) -> Result<()>;
}

/// Handle-minting programmer for devices without flow hardware.
#[derive(Default)]
pub struct NullProgrammer {
    next: u64,
}

impl FlowProgrammer for NullProgrammer {
    fn create(&mut self, _spec: &FlowSpec) -> Result<FlowHandle> {
        self.next += 1;
        Ok(self.next)
    }

    fn destroy(&mut self, _handle: FlowHandle) -> Result<()> {
        Ok(())
    }
}

fn rule_key(ip: u32, port_a: u16, port_b: u16) -> String {
    format!("{}_{}_{}", ip, port_a, port_b)
}

pub struct FlowTable {
    rules: Mutex<HashMap<String, FlowHandle>>,
    programmer: Mutex<Box<dyn FlowProgrammer>>,
    count: AtomicU32,
}

impl FlowTable {
    pub fn new(programmer: Box<dyn FlowProgrammer>) -> FlowTable {
        FlowTable {
            rules: Mutex::new(HashMap::new()),
            programmer: Mutex::new(programmer),
            count: AtomicU32::new(0),
        }
    }

    /// Install a rule for the flow. No-op when the key already exists.
    pub fn configure(&self, spec: &FlowSpec) -> Result<()> {
        let key = rule_key(spec.src_ip, spec.src_port, spec.dst_port);
        let mut rules = self.rules.lock().unwrap();
        if rules.contains_key(&key) {
            return Ok(());
        }
        let handle = self.programmer.lock().unwrap().create(spec)?;
        log::info!(
            "flow rule {} -> queue {} installed",
            key,
            spec.queue_id
        );
        rules.insert(key, handle);
        self.count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Remove the rule for the flow, given in the connection's perspective.
    /// Frees on hit; a miss is a no-op.
    pub fn delete(&self, remote_ip: u32, local_port: u16, remote_port: u16) {
        let key = rule_key(remote_ip, remote_port, local_port);
        let mut rules = self.rules.lock().unwrap();
        if let Some(handle) = rules.remove(&key) {
            if let Err(e) = self.programmer.lock().unwrap().destroy(handle) {
                log::error!("flow rule {} destroy failed: {}", key, e);
            }
            self.count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn contains(&self, src_ip: u32, src_port: u16, dst_port: u16) -> bool {
        self.rules
            .lock()
            .unwrap()
            .contains_key(&rule_key(src_ip, src_port, dst_port))
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        FlowTable::new(Box::new(NullProgrammer::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ip_of;

    fn spec() -> FlowSpec {
        FlowSpec {
            src_ip: ip_of(1, 2, 3, 4),
            dst_ip: ip_of(5, 6, 7, 8),
            src_port: 1000,
            dst_port: 80,
            queue_id: 2,
        }
    }

    #[test]
    fn create_is_idempotent() {
        let t = FlowTable::default();
        t.configure(&spec()).unwrap();
        t.configure(&spec()).unwrap();
        assert_eq!(t.count(), 1);
    }

    #[test]
    fn delete_in_conn_perspective_cancels_create() {
        let t = FlowTable::default();
        t.configure(&spec()).unwrap();
        // the owning connection sees remote=1.2.3.4:1000, local port 80
        t.delete(ip_of(1, 2, 3, 4), 80, 1000);
        assert_eq!(t.count(), 0);
    }

    #[test]
    fn delete_miss_is_noop() {
        let t = FlowTable::default();
        t.configure(&spec()).unwrap();
        t.delete(ip_of(9, 9, 9, 9), 80, 1000);
        t.delete(ip_of(9, 9, 9, 9), 80, 1000);
        assert_eq!(t.count(), 1);
    }
}
