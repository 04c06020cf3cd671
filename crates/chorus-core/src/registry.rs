//! Per-device bookkeeping owned by the intent worker.

use std::collections::{HashMap, HashSet};

use chorus_bluetooth::{Address, ControllerId};

/// Coarse link state of a tracked device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Runtime state for one device. Created on first reference and kept
/// across disconnects; the record is bookkeeping, not a connection handle.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub address: Address,
    /// Part of the configured speaker set.
    pub allowed: bool,
    /// Controller this device is meant to occupy, once known.
    pub assigned_controller: Option<ControllerId>,
    pub state: LinkState,
    /// Attempt count of the most recent reconnection session.
    pub attempts: u32,
    /// Whether an audio route is currently live.
    pub routed: bool,
}

impl DeviceRecord {
    fn new(address: Address) -> Self {
        Self {
            address,
            allowed: false,
            assigned_controller: None,
            state: LinkState::default(),
            attempts: 0,
            routed: false,
        }
    }
}

/// All device records. Mutated only from the intent worker's task.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    records: HashMap<Address, DeviceRecord>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record for the address, created on first reference.
    pub fn record_mut(&mut self, address: &Address) -> &mut DeviceRecord {
        self.records
            .entry(address.clone())
            .or_insert_with(|| DeviceRecord::new(address.clone()))
    }

    pub fn get(&self, address: &Address) -> Option<&DeviceRecord> {
        self.records.get(address)
    }

    pub fn get_mut(&mut self, address: &Address) -> Option<&mut DeviceRecord> {
        self.records.get_mut(address)
    }

    /// Reconcile `allowed` flags with a replacement speaker set. Records
    /// are kept for bookkeeping even when a device leaves the set.
    pub fn set_allowed_exactly(&mut self, allowed: &HashSet<Address>) {
        for record in self.records.values_mut() {
            record.allowed = allowed.contains(&record.address);
        }
        for address in allowed {
            self.record_mut(address).allowed = true;
        }
    }

    /// Snapshot of the records, for external readers.
    pub fn records(&self) -> Vec<DeviceRecord> {
        self.records.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_created_on_first_reference() {
        let mut registry = DeviceRegistry::new();
        let addr = Address::new("00:11:22:33:44:55");
        assert!(registry.get(&addr).is_none());

        registry.record_mut(&addr).allowed = true;
        assert!(registry.get(&addr).is_some_and(|r| r.allowed));
    }

    #[test]
    fn replacement_set_prunes_allowed_but_keeps_records() {
        let mut registry = DeviceRegistry::new();
        let a = Address::new("AA:AA:AA:AA:AA:AA");
        let b = Address::new("BB:BB:BB:BB:BB:BB");
        registry.record_mut(&a).allowed = true;
        registry.record_mut(&a).attempts = 2;

        registry.set_allowed_exactly(&HashSet::from([b.clone()]));

        assert!(!registry.get(&a).is_some_and(|r| r.allowed));
        assert_eq!(registry.get(&a).map(|r| r.attempts), Some(2));
        assert!(registry.get(&b).is_some_and(|r| r.allowed));
    }
}
