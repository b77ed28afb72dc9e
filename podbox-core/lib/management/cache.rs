//! In-memory cache of compute records.
//!
//! The cache is an optimization only: it speeds up reads and absorbs repeated lookups,
//! but every code path that mutates cluster state re-reads the cluster instead of
//! trusting an entry here. The lock is never held across an await point.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::models::ComputeInfo;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Map from compute identifier to its last-known state.
#[derive(Debug, Default)]
pub struct ComputeCache {
    entries: RwLock<HashMap<String, ComputeInfo>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ComputeCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the cached record for a compute, if present.
    pub fn get(&self, compute_id: &str) -> Option<ComputeInfo> {
        self.entries
            .read()
            .expect("compute cache poisoned")
            .get(compute_id)
            .cloned()
    }

    /// Inserts or replaces the record for a compute.
    pub fn insert(&self, info: ComputeInfo) {
        self.entries
            .write()
            .expect("compute cache poisoned")
            .insert(info.compute_id.clone(), info);
    }

    /// Evicts one compute. Returns the evicted record, if any.
    pub fn remove(&self, compute_id: &str) -> Option<ComputeInfo> {
        self.entries
            .write()
            .expect("compute cache poisoned")
            .remove(compute_id)
    }

    /// Evicts every compute belonging to a preset. Returns how many were evicted.
    pub fn remove_preset(&self, preset_id: &str) -> usize {
        let mut entries = self.entries.write().expect("compute cache poisoned");
        let before = entries.len();
        entries.retain(|_, info| info.preset_id != preset_id);
        before - entries.len()
    }

    /// Number of cached computes.
    pub fn len(&self) -> usize {
        self.entries.read().expect("compute cache poisoned").len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ComputeStatus, Resources};
    use std::collections::BTreeMap;

    fn info(compute_id: &str, preset_id: &str) -> ComputeInfo {
        ComputeInfo {
            compute_id: compute_id.to_string(),
            pod_name: format!("preset-{}-00001", preset_id),
            preset_id: preset_id.to_string(),
            deployment_name: format!("preset-{}", preset_id),
            status: ComputeStatus::default(),
            resources: Resources::default(),
            pod_ip: None,
            host_ip: None,
            ports: BTreeMap::new(),
            created_at: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    #[test]
    fn test_insert_get_remove() {
        let cache = ComputeCache::new();
        assert!(cache.is_empty());
        cache.insert(info("c1", "py"));
        assert_eq!(cache.get("c1").unwrap().preset_id, "py");
        assert_eq!(cache.len(), 1);
        assert!(cache.remove("c1").is_some());
        assert!(cache.get("c1").is_none());
        assert!(cache.remove("c1").is_none());
    }

    #[test]
    fn test_insert_replaces_by_compute_id() {
        let cache = ComputeCache::new();
        cache.insert(info("c1", "py"));
        let mut changed = info("c1", "py");
        changed.pod_name = "preset-py-00002".to_string();
        cache.insert(changed);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("c1").unwrap().pod_name, "preset-py-00002");
    }

    #[test]
    fn test_remove_preset_scopes_to_owner() {
        let cache = ComputeCache::new();
        cache.insert(info("c1", "py"));
        cache.insert(info("c2", "py"));
        cache.insert(info("c3", "js"));
        assert_eq!(cache.remove_preset("py"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("c3").is_some());
    }
}
