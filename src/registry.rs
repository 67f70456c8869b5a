//! Correlation between backend query ids and the work they belong to.

use crate::lookup::{QueryId, RecordType};
use std::collections::HashMap;

/// Locates one instance entry in the engine's tables.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct InstanceKey {
    pub(crate) service_type: String,
    pub(crate) name: String,
}

impl InstanceKey {
    pub(crate) fn new(service_type: &str, name: &str) -> Self {
        Self {
            service_type: service_type.to_string(),
            name: name.to_string(),
        }
    }
}

/// Tracks every live backend query.
///
/// A live id is either a scan (the long-running per-service-type query) or an
/// instance sub-query (TXT/SRV/A/AAAA), never both. Late results for an id
/// that was removed find no binding here and are dropped by the caller, which
/// is what makes cancel-then-remove safe against queued callbacks.
#[derive(Default)]
pub(crate) struct QueryRegistry {
    /// Record type fetched by each live query.
    record_types: HashMap<QueryId, RecordType>,

    /// Service type each scan query belongs to.
    scans: HashMap<QueryId, String>,

    /// Instance each sub-query is resolving.
    resolves: HashMap<QueryId, InstanceKey>,
}

impl QueryRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a scan query for `service_type`.
    pub(crate) fn insert_scan(&mut self, id: QueryId, rtype: RecordType, service_type: String) {
        self.record_types.insert(id, rtype);
        self.scans.insert(id, service_type);
    }

    /// Registers an instance sub-query.
    pub(crate) fn insert_resolve(&mut self, id: QueryId, rtype: RecordType, key: InstanceKey) {
        self.record_types.insert(id, rtype);
        self.resolves.insert(id, key);
    }

    /// Drops every entry for `id`. Unknown ids are a no-op.
    pub(crate) fn remove(&mut self, id: QueryId) {
        self.record_types.remove(&id);
        self.scans.remove(&id);
        self.resolves.remove(&id);
    }

    pub(crate) fn record_type(&self, id: QueryId) -> Option<RecordType> {
        self.record_types.get(&id).copied()
    }

    pub(crate) fn service_type(&self, id: QueryId) -> Option<&str> {
        self.scans.get(&id).map(String::as_str)
    }

    pub(crate) fn instance_key(&self, id: QueryId) -> Option<&InstanceKey> {
        self.resolves.get(&id)
    }

    /// The live scan for `service_type`, if any. At most one exists.
    pub(crate) fn scan_for_type(&self, service_type: &str) -> Option<QueryId> {
        self.scans
            .iter()
            .find(|(_, ty)| ty.as_str() == service_type)
            .map(|(id, _)| *id)
    }

    /// All sub-query ids currently resolving `key`.
    pub(crate) fn resolve_ids_for(&self, key: &InstanceKey) -> Vec<QueryId> {
        self.resolves
            .iter()
            .filter(|(_, k)| *k == key)
            .map(|(id, _)| *id)
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.record_types.clear();
        self.scans.clear();
        self.resolves.clear();
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.record_types.is_empty() && self.scans.is_empty() && self.resolves.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_and_resolve_are_exclusive() {
        let mut registry = QueryRegistry::new();
        registry.insert_scan(1, RecordType::Ptr, "_http._tcp.local".to_string());
        registry.insert_resolve(
            2,
            RecordType::Txt,
            InstanceKey::new("_http._tcp.local", "web"),
        );

        assert_eq!(registry.record_type(1), Some(RecordType::Ptr));
        assert!(registry.service_type(1).is_some());
        assert!(registry.instance_key(1).is_none());

        assert_eq!(registry.record_type(2), Some(RecordType::Txt));
        assert!(registry.service_type(2).is_none());
        assert!(registry.instance_key(2).is_some());
    }

    #[test]
    fn remove_is_atomic_and_idempotent() {
        let mut registry = QueryRegistry::new();
        registry.insert_scan(5, RecordType::Ptr, "_ipp._tcp.local".to_string());
        registry.remove(5);
        assert!(registry.record_type(5).is_none());
        assert!(registry.service_type(5).is_none());
        assert!(registry.is_empty());

        // removing again must not panic or disturb anything
        registry.remove(5);
        assert!(registry.is_empty());
    }

    #[test]
    fn scan_for_type_finds_the_single_scan() {
        let mut registry = QueryRegistry::new();
        registry.insert_scan(10, RecordType::Ptr, "_a._tcp.local".to_string());
        registry.insert_scan(11, RecordType::Ptr, "_b._tcp.local".to_string());

        assert_eq!(registry.scan_for_type("_a._tcp.local"), Some(10));
        assert_eq!(registry.scan_for_type("_b._tcp.local"), Some(11));
        assert_eq!(registry.scan_for_type("_c._tcp.local"), None);
    }

    #[test]
    fn resolve_ids_collects_all_subqueries_of_one_instance() {
        let mut registry = QueryRegistry::new();
        let key = InstanceKey::new("_http._tcp.local", "web");
        let other = InstanceKey::new("_http._tcp.local", "api");
        registry.insert_resolve(20, RecordType::Txt, key.clone());
        registry.insert_resolve(21, RecordType::Srv, key.clone());
        registry.insert_resolve(22, RecordType::Txt, other);

        let mut ids = registry.resolve_ids_for(&key);
        ids.sort_unstable();
        assert_eq!(ids, vec![20, 21]);
    }

    #[test]
    fn clear_empties_everything() {
        let mut registry = QueryRegistry::new();
        registry.insert_scan(1, RecordType::Ptr, "_x._udp.local".to_string());
        registry.insert_resolve(2, RecordType::Srv, InstanceKey::new("_x._udp.local", "n"));
        registry.clear();
        assert!(registry.is_empty());
    }
}
