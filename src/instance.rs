//! A resolved service instance and its internal resolution state.

use crate::lookup::QueryId;
use std::collections::HashSet;
use std::fmt;

/// One resolved service instance.
///
/// Snapshots of these are what user queries receive. All fields except the
/// name and service type start empty and are filled in as the TXT, SRV and
/// address records resolve; the engine only surfaces an instance once every
/// outstanding sub-query has completed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceInstance {
    name: String,
    service_type: String,
    txt_records: Vec<String>,
    host_name: String,
    port: u16,
    host_address: String,
}

impl ServiceInstance {
    pub(crate) fn new(name: &str, service_type: &str) -> Self {
        Self {
            name: name.to_string(),
            service_type: service_type.to_string(),
            txt_records: Vec::new(),
            host_name: String::new(),
            port: 0,
            host_address: String::new(),
        }
    }

    /// The instance name, i.e. the left-most label of the full instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The service type this instance was discovered under.
    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// TXT record strings, in answer order.
    pub fn txt_records(&self) -> &[String] {
        &self.txt_records
    }

    /// The target host from the SRV record.
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// The target port from the SRV record.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The textual IPv4 or IPv6 address of the target host.
    pub fn host_address(&self) -> &str {
        &self.host_address
    }

    pub(crate) fn set_txt_records(&mut self, texts: Vec<String>) {
        self.txt_records = texts;
    }

    pub(crate) fn set_host_name(&mut self, host_name: &str) {
        self.host_name = host_name.to_string();
    }

    pub(crate) fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    pub(crate) fn set_host_address(&mut self, address: &str) {
        self.host_address = address.to_string();
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{})",
            self.name, self.host_address, self.port
        )
    }
}

/// Engine-side bookkeeping wrapped around one [`ServiceInstance`].
pub(crate) struct InstanceEntry {
    pub(crate) info: ServiceInstance,

    /// Backend query ids whose completion is still required before the
    /// instance counts as fully resolved.
    pub(crate) outstanding: HashSet<QueryId>,

    /// Set when the instance fully resolved in the current refresh cycle;
    /// cleared by the purge pass to arm the next cycle.
    pub(crate) updated: bool,

    /// Consecutive refresh cycles in which the instance failed to refresh.
    pub(crate) error_count: u32,
}

impl InstanceEntry {
    pub(crate) fn new(name: &str, service_type: &str) -> Self {
        Self {
            info: ServiceInstance::new(name, service_type),
            outstanding: HashSet::new(),
            updated: false,
            error_count: 0,
        }
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.outstanding.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_entry_is_resolved_but_empty() {
        let entry = InstanceEntry::new("printer", "_ipp._tcp.local");
        assert!(entry.is_resolved());
        assert!(!entry.updated);
        assert_eq!(entry.error_count, 0);
        assert_eq!(entry.info.name(), "printer");
        assert_eq!(entry.info.service_type(), "_ipp._tcp.local");
        assert!(entry.info.host_name().is_empty());
    }

    #[test]
    fn outstanding_gates_resolution() {
        let mut entry = InstanceEntry::new("printer", "_ipp._tcp.local");
        entry.outstanding.insert(7);
        entry.outstanding.insert(8);
        assert!(!entry.is_resolved());

        entry.outstanding.remove(&7);
        assert!(!entry.is_resolved());
        entry.outstanding.remove(&8);
        assert!(entry.is_resolved());
    }
}
