//! # Entity Map
//!
//! Authoritative cluster records keyed by stable [`ClusterKey`]. Absorbed
//! clusters leave a redirect behind so old keys still resolve to their
//! survivor. [`Store`] keeps everything in memory; the RocksDB-backed
//! [`crate::persistence::PersistentStore`] implements the same contract.

use crate::model::{ClusterId, ClusterKey, ClusterRecord, RefId};
use anyhow::{anyhow, Result};
use hashbrown::HashMap;
use std::collections::BTreeMap;

/// Storage contract for cluster records.
pub trait ClusterStore: Send {
    fn get(&self, key: ClusterKey) -> Option<&ClusterRecord>;

    /// Insert or replace a live cluster.
    fn put(&mut self, record: ClusterRecord) -> Result<()>;

    /// Drop an absorbed cluster, leaving a redirect to its survivor.
    fn tombstone(&mut self, absorbed: ClusterKey, survivor: ClusterKey) -> Result<()>;

    /// Every `(absorbed, survivor)` redirect.
    fn redirects(&self) -> Vec<(ClusterKey, ClusterKey)>;

    /// Live cluster keys in creation order.
    fn keys(&self) -> Vec<ClusterKey>;

    /// Live cluster holding an id, either current or in its lineage.
    fn key_for_id(&self, id: &ClusterId) -> Option<ClusterKey>;

    /// Live cluster holding a reference.
    fn key_for_reference(&self, ref_id: &RefId) -> Option<ClusterKey>;

    /// Reserve a fresh key. Keys are never reused.
    fn allocate_key(&mut self) -> Result<ClusterKey>;

    /// Highest modification id across live clusters, 0 when empty.
    fn max_modification_id(&self) -> u64;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Follow redirects to the live key.
    fn resolve(&self, key: ClusterKey) -> Option<ClusterKey> {
        let redirects: HashMap<ClusterKey, ClusterKey> = self.redirects().into_iter().collect();
        let mut current = key;
        for _ in 0..=redirects.len() {
            if self.get(current).is_some() {
                return Some(current);
            }
            current = *redirects.get(&current)?;
        }
        None
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory entity map.
#[derive(Debug, Clone, Default)]
pub struct Store {
    /// Keys are allocated monotonically, so key order is creation order
    records: BTreeMap<ClusterKey, ClusterRecord>,
    redirects: HashMap<ClusterKey, ClusterKey>,
    ids: HashMap<ClusterId, ClusterKey>,
    references: HashMap<RefId, ClusterKey>,
    next_key: u32,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_key(&self) -> u32 {
        self.next_key
    }

    /// Restore the key counter when loading persisted state.
    pub fn set_next_key(&mut self, next_key: u32) {
        self.next_key = self.next_key.max(next_key);
    }

    /// Restore a redirect when loading persisted state.
    pub fn insert_redirect(&mut self, absorbed: ClusterKey, survivor: ClusterKey) {
        self.redirects.insert(absorbed, survivor);
        self.next_key = self.next_key.max(absorbed.0 + 1);
    }

    fn unmap(&mut self, record: &ClusterRecord) {
        for id in std::iter::once(&record.id).chain(record.lineage.iter()) {
            if self.ids.get(id) == Some(&record.key) {
                self.ids.remove(id);
            }
        }
        for member in &record.members {
            if self.references.get(&member.ref_id) == Some(&record.key) {
                self.references.remove(&member.ref_id);
            }
        }
    }

    fn map(&mut self, record: &ClusterRecord) {
        for id in record.lineage.iter().chain(std::iter::once(&record.id)) {
            self.ids.insert(id.clone(), record.key);
        }
        for member in &record.members {
            self.references.insert(member.ref_id.clone(), record.key);
        }
    }
}

impl ClusterStore for Store {
    fn get(&self, key: ClusterKey) -> Option<&ClusterRecord> {
        self.records.get(&key)
    }

    fn put(&mut self, record: ClusterRecord) -> Result<()> {
        if self.redirects.contains_key(&record.key) {
            return Err(anyhow!("cluster {} was absorbed and cannot be revived", record.key));
        }
        if let Some(previous) = self.records.remove(&record.key) {
            self.unmap(&previous);
        }
        self.map(&record);
        self.next_key = self.next_key.max(record.key.0 + 1);
        self.records.insert(record.key, record);
        Ok(())
    }

    fn tombstone(&mut self, absorbed: ClusterKey, survivor: ClusterKey) -> Result<()> {
        if absorbed == survivor {
            return Err(anyhow!("cluster {absorbed} cannot absorb itself"));
        }
        if !self.records.contains_key(&survivor) {
            return Err(anyhow!("survivor cluster {survivor} is not live"));
        }
        if let Some(previous) = self.records.remove(&absorbed) {
            self.unmap(&previous);
        }
        self.redirects.insert(absorbed, survivor);
        Ok(())
    }

    fn redirects(&self) -> Vec<(ClusterKey, ClusterKey)> {
        let mut redirects: Vec<_> = self.redirects.iter().map(|(a, s)| (*a, *s)).collect();
        redirects.sort();
        redirects
    }

    fn keys(&self) -> Vec<ClusterKey> {
        self.records.keys().copied().collect()
    }

    fn key_for_id(&self, id: &ClusterId) -> Option<ClusterKey> {
        self.ids.get(id).copied()
    }

    fn key_for_reference(&self, ref_id: &RefId) -> Option<ClusterKey> {
        self.references.get(ref_id).copied()
    }

    fn allocate_key(&mut self) -> Result<ClusterKey> {
        let key = ClusterKey(self.next_key);
        self.next_key = self
            .next_key
            .checked_add(1)
            .ok_or_else(|| anyhow!("cluster key space exhausted"))?;
        Ok(key)
    }

    fn max_modification_id(&self) -> u64 {
        self.records
            .values()
            .map(|r| r.modification_id)
            .max()
            .unwrap_or(0)
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttrId, AttrValues, ResolvedReference};

    fn reference(id: &str, last: &str) -> ResolvedReference {
        let mut values = AttrValues::new();
        values.insert(AttrId(0), last);
        ResolvedReference {
            ref_id: RefId::new("crm", id),
            values,
            assertion: None,
        }
    }

    fn singleton(store: &mut Store, id: &str, cluster_id: &str, modification_id: u64) -> ClusterKey {
        let key = store.allocate_key().unwrap();
        let record = ClusterRecord::singleton(
            key,
            ClusterId::new(cluster_id),
            &reference(id, "Smith"),
            modification_id,
        );
        store.put(record).unwrap();
        key
    }

    #[test]
    fn test_store_creation() {
        let store = Store::new();
        assert!(store.is_empty());
        assert_eq!(store.max_modification_id(), 0);
    }

    #[test]
    fn test_put_and_lookup() {
        let mut store = Store::new();
        let first = singleton(&mut store, "1", "AAA", 1);
        let second = singleton(&mut store, "2", "BBB", 2);

        assert_eq!(store.keys(), vec![first, second]);
        assert_eq!(store.key_for_id(&ClusterId::new("BBB")), Some(second));
        assert_eq!(store.key_for_reference(&RefId::new("crm", "1")), Some(first));
        assert_eq!(store.max_modification_id(), 2);
    }

    #[test]
    fn test_tombstone_redirects_and_lineage_lookup() {
        let mut store = Store::new();
        let first = singleton(&mut store, "1", "AAA", 1);
        let second = singleton(&mut store, "2", "BBB", 1);

        let mut survivor = store.get(first).cloned().unwrap();
        let absorbed = store.get(second).cloned().unwrap();
        survivor.absorb(absorbed, 2);
        store.put(survivor).unwrap();
        store.tombstone(second, first).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.resolve(second), Some(first));
        assert_eq!(store.key_for_id(&ClusterId::new("BBB")), Some(first));
        assert_eq!(store.key_for_reference(&RefId::new("crm", "2")), Some(first));
        assert_eq!(store.redirects(), vec![(second, first)]);
        assert!(store.put(ClusterRecord::singleton(
            second,
            ClusterId::new("CCC"),
            &reference("3", "Doe"),
            2
        ))
        .is_err());
    }

    #[test]
    fn test_put_replacing_record_unmaps_removed_members() {
        let mut store = Store::new();
        let key = singleton(&mut store, "1", "AAA", 1);
        let mut record = store.get(key).cloned().unwrap();
        record.add_member(&reference("2", "Smith"), 1);
        store.put(record.clone()).unwrap();
        assert_eq!(store.key_for_reference(&RefId::new("crm", "2")), Some(key));

        record.remove_member(&RefId::new("crm", "2"));
        store.put(record).unwrap();
        assert_eq!(store.key_for_reference(&RefId::new("crm", "2")), None);
    }

    #[test]
    fn test_keys_are_never_reused() {
        let mut store = Store::new();
        let a = store.allocate_key().unwrap();
        let b = store.allocate_key().unwrap();
        assert_ne!(a, b);
        store.insert_redirect(ClusterKey(10), ClusterKey(0));
        assert_eq!(store.allocate_key().unwrap(), ClusterKey(11));
    }
}
