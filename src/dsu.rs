//! # Disjoint Set Union over Cluster Keys
//!
//! Tracks which cluster keys have been absorbed into which survivors. Roots
//! are live clusters; every other key is a tombstone that resolves to its
//! survivor through `find`.

use crate::model::ClusterKey;
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Default)]
pub struct ClusterDsu {
    parent: FxHashMap<ClusterKey, ClusterKey>,
    roots: usize,
}

impl ClusterDsu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a key as its own root. Returns false if already known.
    pub fn add(&mut self, key: ClusterKey) -> bool {
        if self.parent.contains_key(&key) {
            return false;
        }
        self.parent.insert(key, key);
        self.roots += 1;
        true
    }

    /// Find the live root of a key (path halving).
    pub fn find(&mut self, key: ClusterKey) -> Option<ClusterKey> {
        let mut current = key;
        let mut parent = *self.parent.get(&current)?;
        while parent != current {
            let grandparent = self.parent.get(&parent).copied().unwrap_or(parent);
            self.parent.insert(current, grandparent);
            current = grandparent;
            parent = self.parent.get(&current).copied().unwrap_or(current);
        }
        Some(current)
    }

    /// Absorb one set into another. The survivor's root stays the root.
    ///
    /// Returns false when both keys already share a root.
    pub fn union_into(&mut self, survivor: ClusterKey, absorbed: ClusterKey) -> bool {
        self.add(survivor);
        self.add(absorbed);
        let (Some(survivor_root), Some(absorbed_root)) = (self.find(survivor), self.find(absorbed))
        else {
            return false;
        };
        if survivor_root == absorbed_root {
            return false;
        }
        self.parent.insert(absorbed_root, survivor_root);
        self.roots -= 1;
        true
    }

    /// Number of live roots.
    pub fn cluster_count(&self) -> usize {
        self.roots
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }
}
