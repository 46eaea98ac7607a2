//! # Merge-Purge Linker
//!
//! Incremental RSwoosh clustering. Each reference is probed against the
//! blocking index, pruned by the LCRD filter and evaluated against the
//! surviving candidates. Matches are merged into one survivor, which is then
//! re-probed with its union values until nothing else matches.

use crate::dsu::ClusterDsu;
use crate::error::LinkError;
use crate::events::{ClusterEvent, EventSink};
use crate::identity::{HashAlgorithm, IdGenerator};
use crate::index::BlockingIndex;
use crate::lcrd::LcrdFilter;
use crate::model::{AttrValues, ClusterId, ClusterKey, ClusterRecord, RefId, ResolvedReference};
use crate::ontology::Ontology;
use crate::rules::RuleEngine;
use crate::store::ClusterStore;
use anyhow::anyhow;
use lru::LruCache;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;
use tracing::debug;

/// Upper bound on salts tried when a derived id clashes with another cluster.
const MAX_ID_SALT: u32 = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkerSettings {
    pub bypass_filter: bool,
    /// Only the N most recently touched clusters are candidates
    pub window_size: Option<usize>,
    pub id_hash: HashAlgorithm,
    pub complete_firing: bool,
}

/// Counters accumulated over a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub references: u64,
    /// Probe rounds, one per reference plus one per closure step
    pub iterations: u64,
    pub candidates: u64,
    pub lcrd_skips: u64,
    pub window_skips: u64,
    pub comparisons: u64,
    pub clusters_created: u64,
    pub clusters_updated: u64,
    pub clusters_merged: u64,
    pub rule_firings: BTreeMap<String, u64>,
    pub complete_firings: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    Created,
    Joined,
    /// Joined after merging this many clusters together
    Merged(usize),
    /// Reference already linked with these values
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkOutcome {
    pub key: ClusterKey,
    pub id: ClusterId,
    pub action: LinkAction,
}

pub struct MergePurgeLinker {
    dsu: ClusterDsu,
    index: BlockingIndex,
    lcrd: LcrdFilter,
    engine: RuleEngine,
    ids: IdGenerator,
    window: Option<LruCache<ClusterKey, ()>>,
    modification_id: u64,
    /// Clusters with a smaller key existed before the current run
    run_start_key: u32,
    stats: LinkStats,
}

impl MergePurgeLinker {
    /// Build linker state over an existing repository and start a run.
    pub fn new(store: &dyn ClusterStore, ontology: &Ontology, settings: LinkerSettings) -> Self {
        let mut dsu = ClusterDsu::new();
        let mut index = BlockingIndex::for_ontology(ontology);
        let mut window = settings
            .window_size
            .and_then(NonZeroUsize::new)
            .map(LruCache::new);

        for key in store.keys() {
            dsu.add(key);
            if let Some(record) = store.get(key) {
                index.add_index(ontology, key, &record.values);
            }
            if let Some(window) = window.as_mut() {
                window.put(key, ());
            }
        }
        for (absorbed, survivor) in store.redirects() {
            dsu.union_into(survivor, absorbed);
        }

        let mut linker = Self {
            dsu,
            index,
            lcrd: LcrdFilter::build(ontology.rules()).with_bypass(settings.bypass_filter),
            engine: RuleEngine::new(settings.complete_firing),
            ids: IdGenerator::new(settings.id_hash),
            window,
            modification_id: 0,
            run_start_key: 0,
            stats: LinkStats::default(),
        };
        linker.begin_run(store);
        linker
    }

    /// Start a new run: bump the modification id and anchor existing clusters.
    pub fn begin_run(&mut self, store: &dyn ClusterStore) {
        self.modification_id = store.max_modification_id() + 1;
        self.run_start_key = store.keys().last().map(|k| k.0 + 1).unwrap_or(0);
        self.stats = LinkStats::default();
    }

    pub fn modification_id(&self) -> u64 {
        self.modification_id
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn lcrd(&self) -> &LcrdFilter {
        &self.lcrd
    }

    pub fn id_generator(&self) -> &IdGenerator {
        &self.ids
    }

    pub fn cluster_count(&self) -> usize {
        self.dsu.cluster_count()
    }

    /// Live cluster for a possibly absorbed key.
    pub fn find(&mut self, key: ClusterKey) -> Option<ClusterKey> {
        self.dsu.find(key)
    }

    fn is_anchored(&self, key: ClusterKey) -> bool {
        key.0 < self.run_start_key
    }

    /// Link one reference into the repository.
    pub fn link_reference(
        &mut self,
        store: &mut dyn ClusterStore,
        ontology: &Ontology,
        reference: &ResolvedReference,
        sink: &mut dyn EventSink,
    ) -> Result<LinkOutcome, LinkError> {
        self.stats.references += 1;

        if let Some(existing) = store.key_for_reference(&reference.ref_id) {
            return self.relink(store, ontology, existing, reference, sink);
        }

        let matched = self.matching_clusters(&*store, ontology, &reference.values, None);
        if matched.is_empty() {
            let (key, id) = self.create_cluster(store, ontology, reference)?;
            sink.emit(&ClusterEvent::ClusterCreated {
                id: id.clone(),
                reference: reference.ref_id.clone(),
            })?;
            return Ok(LinkOutcome {
                key,
                id,
                action: LinkAction::Created,
            });
        }

        let merged_before = self.stats.clusters_merged;
        let survivor = self.merge_clusters(store, ontology, &matched, sink)?;
        let mut record = live_record(&*store, survivor)?;
        record.add_member(reference, self.modification_id);
        self.index.add_index(ontology, survivor, &record.values);
        store.put(record)?;
        self.touch(survivor);

        let survivor = self.close(store, ontology, survivor, sink)?;
        let (id, previous_id) = self.finalize_id(store, ontology, survivor)?;
        self.stats.clusters_updated += 1;
        sink.emit(&ClusterEvent::ClusterUpdated {
            id: id.clone(),
            previous_id,
            reference: reference.ref_id.clone(),
        })?;

        let merged = (self.stats.clusters_merged - merged_before) as usize;
        Ok(LinkOutcome {
            key: survivor,
            id,
            action: if merged == 0 {
                LinkAction::Joined
            } else {
                LinkAction::Merged(merged)
            },
        })
    }

    /// A reference seen before: union any new values into its member entry.
    fn relink(
        &mut self,
        store: &mut dyn ClusterStore,
        ontology: &Ontology,
        key: ClusterKey,
        reference: &ResolvedReference,
        sink: &mut dyn EventSink,
    ) -> Result<LinkOutcome, LinkError> {
        let mut record = live_record(&*store, key)?;
        let added = record
            .members
            .iter_mut()
            .find(|m| m.ref_id == reference.ref_id)
            .map(|m| m.values.extend(&reference.values))
            .unwrap_or(0);
        if added == 0 {
            return Ok(LinkOutcome {
                key,
                id: record.id,
                action: LinkAction::Unchanged,
            });
        }

        record.values.extend(&reference.values);
        record.modification_id = self.modification_id;
        self.index.add_index(ontology, key, &record.values);
        store.put(record)?;
        self.touch(key);

        let merged_before = self.stats.clusters_merged;
        let survivor = self.close(store, ontology, key, sink)?;
        let (id, previous_id) = self.finalize_id(store, ontology, survivor)?;
        self.stats.clusters_updated += 1;
        sink.emit(&ClusterEvent::ClusterUpdated {
            id: id.clone(),
            previous_id,
            reference: reference.ref_id.clone(),
        })?;
        let merged = (self.stats.clusters_merged - merged_before) as usize;
        Ok(LinkOutcome {
            key: survivor,
            id,
            action: if merged == 0 {
                LinkAction::Joined
            } else {
                LinkAction::Merged(merged)
            },
        })
    }

    /// Identities a reference would join, without touching the repository.
    pub fn resolve_matches(
        &mut self,
        store: &dyn ClusterStore,
        ontology: &Ontology,
        reference: &ResolvedReference,
        sink: &mut dyn EventSink,
    ) -> Result<Vec<ClusterId>, LinkError> {
        self.stats.references += 1;
        let ids: Vec<ClusterId> = self
            .matching_clusters(store, ontology, &reference.values, None)
            .into_iter()
            .filter_map(|key| store.get(key).map(|r| r.id.clone()))
            .collect();
        sink.emit(&ClusterEvent::ReferenceResolved {
            reference: reference.ref_id.clone(),
            ids: ids.clone(),
        })?;
        Ok(ids)
    }

    /// Run the closure over every live cluster. Returns the merges made.
    pub fn consolidate(
        &mut self,
        store: &mut dyn ClusterStore,
        ontology: &Ontology,
        sink: &mut dyn EventSink,
    ) -> Result<u64, LinkError> {
        let merged_before = self.stats.clusters_merged;
        let mut touched = BTreeSet::new();
        for key in store.keys() {
            if self.dsu.find(key) != Some(key) || store.get(key).is_none() {
                continue;
            }
            let before = self.stats.clusters_merged;
            let survivor = self.close(store, ontology, key, sink)?;
            if self.stats.clusters_merged > before {
                touched.insert(survivor);
            }
        }

        for key in touched {
            let Some(survivor) = self.dsu.find(key) else {
                continue;
            };
            if store.get(survivor).is_none() {
                continue;
            }
            let (id, previous_id) = self.finalize_id(store, ontology, survivor)?;
            if let Some(previous_id) = previous_id {
                sink.emit(&ClusterEvent::ClusterRenamed { id, previous_id })?;
            }
        }
        Ok(self.stats.clusters_merged - merged_before)
    }

    /// Add a reference to a cluster without rule evaluation.
    pub fn attach(
        &mut self,
        store: &mut dyn ClusterStore,
        ontology: &Ontology,
        target: ClusterKey,
        reference: &ResolvedReference,
        sink: &mut dyn EventSink,
    ) -> Result<LinkOutcome, LinkError> {
        self.stats.references += 1;
        let mut record = live_record(&*store, target)?;
        record.add_member(reference, self.modification_id);
        self.index.add_index(ontology, target, &record.values);
        store.put(record)?;
        self.touch(target);

        let (id, previous_id) = self.finalize_id(store, ontology, target)?;
        self.stats.clusters_updated += 1;
        sink.emit(&ClusterEvent::ClusterUpdated {
            id: id.clone(),
            previous_id,
            reference: reference.ref_id.clone(),
        })?;
        Ok(LinkOutcome {
            key: target,
            id,
            action: LinkAction::Joined,
        })
    }

    /// Merge clusters without rule evaluation. Returns the survivor.
    pub fn force_merge(
        &mut self,
        store: &mut dyn ClusterStore,
        ontology: &Ontology,
        keys: &[ClusterKey],
        sink: &mut dyn EventSink,
    ) -> Result<LinkOutcome, LinkError> {
        let survivor = self.merge_clusters(store, ontology, keys, sink)?;
        let (id, previous_id) = self.finalize_id(store, ontology, survivor)?;
        if let Some(previous_id) = previous_id {
            sink.emit(&ClusterEvent::ClusterRenamed {
                id: id.clone(),
                previous_id,
            })?;
        }
        Ok(LinkOutcome {
            key: survivor,
            id,
            action: LinkAction::Merged(keys.len().saturating_sub(1)),
        })
    }

    /// Move one member out of a cluster into a new singleton.
    pub fn split_out(
        &mut self,
        store: &mut dyn ClusterStore,
        ontology: &Ontology,
        from: ClusterKey,
        ref_id: &RefId,
        sink: &mut dyn EventSink,
    ) -> Result<LinkOutcome, LinkError> {
        let mut record = live_record(&*store, from)?;
        if record.len() < 2 {
            return Err(LinkError::AssertionFailed {
                reference: ref_id.to_string(),
                reason: format!("identity {} has no other member", record.id),
            });
        }
        let member = record
            .remove_member(ref_id)
            .ok_or_else(|| LinkError::AssertionFailed {
                reference: ref_id.to_string(),
                reason: format!("not a member of identity {}", record.id),
            })?;
        record.modification_id = self.modification_id;
        self.index.reindex_cluster(ontology, from, &record.values);
        store.put(record)?;
        let (from_id, _) = self.finalize_id(store, ontology, from)?;

        let split = ResolvedReference {
            ref_id: member.ref_id,
            values: member.values,
            assertion: None,
        };
        let (key, id) = self.create_cluster(store, ontology, &split)?;
        sink.emit(&ClusterEvent::ClusterSplit {
            from: from_id,
            created: id.clone(),
            reference: split.ref_id,
        })?;
        Ok(LinkOutcome {
            key,
            id,
            action: LinkAction::Created,
        })
    }

    fn create_cluster(
        &mut self,
        store: &mut dyn ClusterStore,
        ontology: &Ontology,
        reference: &ResolvedReference,
    ) -> Result<(ClusterKey, ClusterId), LinkError> {
        let key = store.allocate_key()?;
        let id = self.assign_id(&*store, ontology, &reference.values, false, key)?;
        let record = ClusterRecord::singleton(key, id.clone(), reference, self.modification_id);
        store.put(record)?;
        self.dsu.add(key);
        self.index.add_index(ontology, key, &reference.values);
        self.touch(key);
        self.stats.clusters_created += 1;
        Ok((key, id))
    }

    /// Live clusters matching a probe, in key order.
    fn matching_clusters(
        &mut self,
        store: &dyn ClusterStore,
        ontology: &Ontology,
        probe: &AttrValues,
        exclude: Option<ClusterKey>,
    ) -> Vec<ClusterKey> {
        self.stats.iterations += 1;
        let mut live = BTreeSet::new();
        for candidate in self.index.get_candidates(ontology, probe) {
            if let Some(root) = self.dsu.find(candidate) {
                live.insert(root);
            }
        }
        if let Some(excluded) = exclude {
            live.remove(&excluded);
        }
        self.stats.candidates += live.len() as u64;

        let mut matched = Vec::new();
        for key in live {
            if let Some(window) = self.window.as_ref() {
                if !window.contains(&key) {
                    self.stats.window_skips += 1;
                    continue;
                }
            }
            let Some(record) = store.get(key) else {
                continue;
            };
            if !self.lcrd.admits(probe, &record.values) {
                self.stats.lcrd_skips += 1;
                continue;
            }
            self.stats.comparisons += 1;
            let evaluation = self.engine.evaluate(ontology, probe, &record.values);
            for rule in &evaluation.complete {
                *self
                    .stats
                    .complete_firings
                    .entry((*rule).to_string())
                    .or_default() += 1;
            }
            if let Some(rule) = evaluation.fired {
                *self.stats.rule_firings.entry(rule.to_string()).or_default() += 1;
                matched.push(key);
            }
        }
        matched
    }

    /// Re-probe a cluster with its union values until no other cluster matches.
    fn close(
        &mut self,
        store: &mut dyn ClusterStore,
        ontology: &Ontology,
        survivor: ClusterKey,
        sink: &mut dyn EventSink,
    ) -> Result<ClusterKey, LinkError> {
        let mut survivor = survivor;
        loop {
            let values = live_record(&*store, survivor)?.values;
            let mut group = self.matching_clusters(&*store, ontology, &values, Some(survivor));
            if group.is_empty() {
                return Ok(survivor);
            }
            group.push(survivor);
            survivor = self.merge_clusters(store, ontology, &group, sink)?;
        }
    }

    /// Survivor: clusters from earlier runs first, then the oldest key.
    fn choose_survivor(&self, keys: &[ClusterKey]) -> Option<ClusterKey> {
        keys.iter()
            .copied()
            .min_by_key(|key| (!self.is_anchored(*key), *key))
    }

    /// Merge clusters into the survivor. The repository is written first;
    /// linker state and events follow only once it holds the merge.
    fn merge_clusters(
        &mut self,
        store: &mut dyn ClusterStore,
        ontology: &Ontology,
        keys: &[ClusterKey],
        sink: &mut dyn EventSink,
    ) -> Result<ClusterKey, LinkError> {
        let survivor = self
            .choose_survivor(keys)
            .ok_or_else(|| anyhow!("merge requested for an empty cluster set"))?;
        let mut record = live_record(&*store, survivor)?;
        let survivor_id = record.id.clone();
        let mut absorbed = Vec::new();
        for &key in keys {
            if key == survivor || absorbed.iter().any(|(k, _)| *k == key) {
                continue;
            }
            let other = live_record(&*store, key)?;
            absorbed.push((key, other.id.clone()));
            record.absorb(other, self.modification_id);
        }

        let values = record.values.clone();
        store.put(record)?;
        for (key, _) in &absorbed {
            store.tombstone(*key, survivor)?;
        }

        for (key, _) in &absorbed {
            self.dsu.union_into(survivor, *key);
            self.index.repoint(*key, survivor);
            if let Some(window) = self.window.as_mut() {
                window.pop(key);
            }
        }
        self.index.add_index(ontology, survivor, &values);
        self.touch(survivor);
        self.stats.clusters_merged += absorbed.len() as u64;

        for (_, absorbed_id) in absorbed {
            debug!(absorbed = %absorbed_id, survivor = %survivor_id, "merged clusters");
            sink.emit(&ClusterEvent::ClusterMerged {
                absorbed: absorbed_id,
                survivor: survivor_id.clone(),
            })?;
        }
        Ok(survivor)
    }

    /// Recompute the id of a cluster created in this run from its content.
    ///
    /// Returns the current id and the id it replaced, if any. Clusters from
    /// earlier runs keep their published id.
    fn finalize_id(
        &mut self,
        store: &mut dyn ClusterStore,
        ontology: &Ontology,
        key: ClusterKey,
    ) -> Result<(ClusterId, Option<ClusterId>), LinkError> {
        let mut record = live_record(&*store, key)?;
        if self.is_anchored(key) {
            return Ok((record.id, None));
        }
        let derived = record.len() > 1;
        let id = self.assign_id(&*store, ontology, &record.values, derived, key)?;
        if id == record.id {
            return Ok((id, None));
        }
        let previous = std::mem::replace(&mut record.id, id.clone());
        record.record_lineage(previous.clone());
        store.put(record)?;
        Ok((id, Some(previous)))
    }

    /// Content id for a cluster, salted past ids held by other clusters.
    fn assign_id(
        &self,
        store: &dyn ClusterStore,
        ontology: &Ontology,
        values: &AttrValues,
        derived: bool,
        owner: ClusterKey,
    ) -> Result<ClusterId, LinkError> {
        for salt in 0..MAX_ID_SALT {
            let id = self.ids.compute_salted(ontology, Some(values), derived, salt);
            match store.key_for_id(&id) {
                Some(holder) if holder != owner => continue,
                _ => return Ok(id),
            }
        }
        Err(anyhow!("could not derive a unique id for cluster {owner}").into())
    }

    fn touch(&mut self, key: ClusterKey) {
        if let Some(window) = self.window.as_mut() {
            window.put(key, ());
        }
    }
}

fn live_record(store: &dyn ClusterStore, key: ClusterKey) -> Result<ClusterRecord, LinkError> {
    store
        .get(key)
        .cloned()
        .ok_or_else(|| anyhow!("cluster {key} is not live").into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::ComparatorRegistry;
    use crate::model::Reference;
    use crate::ontology::OntologySpec;
    use crate::store::Store;

    fn ontology() -> Ontology {
        let spec = OntologySpec::new()
            .attribute("first", "default")
            .attribute("last", "default")
            .attribute("ssn", "default")
            .rule("names", &[("last", "Exact"), ("first", "Exact-Ignore-Case")])
            .rule("ssn", &[("ssn", "Exact")])
            .index_rule("last", &[("last", "Scan(LR, LETTER, 6, ToUpper, SameOrder)")])
            .index_rule("ssn", &[("ssn", "Scan(LR, DIGIT, 9, KeepCase, SameOrder)")]);
        Ontology::validate(&spec, &ComparatorRegistry::default()).unwrap()
    }

    fn resolve(ontology: &Ontology, seq: u64, pairs: &[(&str, &str)]) -> ResolvedReference {
        let mut reference = Reference::new("test");
        for (name, value) in pairs {
            reference = reference.with_value(*name, *value);
        }
        ontology.resolve_reference(&reference, seq).unwrap()
    }

    #[test]
    fn test_create_join_and_events() {
        let ontology = ontology();
        let mut store = Store::new();
        let mut linker = MergePurgeLinker::new(&store, &ontology, LinkerSettings::default());
        let mut events = Vec::new();

        let a = resolve(&ontology, 1, &[("first", "John"), ("last", "Smith")]);
        let b = resolve(&ontology, 2, &[("first", "JOHN"), ("last", "Smith")]);
        let first = linker.link_reference(&mut store, &ontology, &a, &mut events).unwrap();
        let second = linker.link_reference(&mut store, &ontology, &b, &mut events).unwrap();

        assert_eq!(first.action, LinkAction::Created);
        assert_eq!(second.action, LinkAction::Joined);
        assert_eq!(second.key, first.key);
        assert_ne!(second.id, first.id);
        assert_eq!(store.get(first.key).unwrap().lineage, vec![first.id.clone()]);
        assert!(matches!(events[0], ClusterEvent::ClusterCreated { .. }));
        assert!(matches!(
            &events[1],
            ClusterEvent::ClusterUpdated { previous_id: Some(previous), .. } if *previous == first.id
        ));
        assert_eq!(linker.stats().rule_firings.get("names"), Some(&1));
    }

    #[test]
    fn test_bridge_reference_merges_clusters() {
        let ontology = ontology();
        let mut store = Store::new();
        let mut linker = MergePurgeLinker::new(&store, &ontology, LinkerSettings::default());
        let mut events = Vec::new();

        let a = resolve(&ontology, 1, &[("first", "Ann"), ("last", "Lee"), ("ssn", "111")]);
        let b = resolve(&ontology, 2, &[("first", "Bo"), ("last", "Kim"), ("ssn", "222")]);
        let bridge = resolve(&ontology, 3, &[("first", "ann"), ("last", "Lee"), ("ssn", "222")]);
        linker.link_reference(&mut store, &ontology, &a, &mut events).unwrap();
        linker.link_reference(&mut store, &ontology, &b, &mut events).unwrap();
        let outcome = linker.link_reference(&mut store, &ontology, &bridge, &mut events).unwrap();

        assert_eq!(outcome.action, LinkAction::Merged(1));
        assert_eq!(store.len(), 1);
        assert_eq!(linker.cluster_count(), 1);
        assert_eq!(store.get(outcome.key).unwrap().len(), 3);
        assert_eq!(store.resolve(ClusterKey(1)), Some(ClusterKey(0)));
    }

    #[test]
    fn test_closure_reaches_fixed_point() {
        let ontology = ontology();
        let mut store = Store::new();
        let mut linker = MergePurgeLinker::new(&store, &ontology, LinkerSettings::default());
        let mut sink = crate::events::NullSink;

        // c is only reachable through the union of a and b
        let c = resolve(&ontology, 1, &[("first", "Bea"), ("last", "Poe")]);
        let a = resolve(&ontology, 2, &[("first", "Al"), ("last", "Poe"), ("ssn", "444")]);
        let b = resolve(&ontology, 3, &[("first", "Bea"), ("last", "Kim"), ("ssn", "444")]);
        linker.link_reference(&mut store, &ontology, &c, &mut sink).unwrap();
        linker.link_reference(&mut store, &ontology, &a, &mut sink).unwrap();
        assert_eq!(store.len(), 2);
        let outcome = linker.link_reference(&mut store, &ontology, &b, &mut sink).unwrap();

        assert_eq!(outcome.key, ClusterKey(0));
        assert_eq!(outcome.action, LinkAction::Merged(1));
        assert_eq!(store.len(), 1);
        assert_eq!(linker.stats().iterations, 5);
        assert_eq!(linker.consolidate(&mut store, &ontology, &mut sink).unwrap(), 0);
    }

    #[test]
    fn test_resolve_does_not_mutate() {
        let ontology = ontology();
        let mut store = Store::new();
        let mut linker = MergePurgeLinker::new(&store, &ontology, LinkerSettings::default());
        let mut events = Vec::new();
        let a = resolve(&ontology, 1, &[("first", "John"), ("last", "Smith")]);
        let created = linker.link_reference(&mut store, &ontology, &a, &mut events).unwrap();

        let probe = resolve(&ontology, 9, &[("first", "john"), ("last", "Smith")]);
        let ids = linker.resolve_matches(&store, &ontology, &probe, &mut events).unwrap();
        assert_eq!(ids, vec![created.id]);
        assert_eq!(store.get(created.key).unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_reference_is_unchanged() {
        let ontology = ontology();
        let mut store = Store::new();
        let mut linker = MergePurgeLinker::new(&store, &ontology, LinkerSettings::default());
        let mut events = Vec::new();
        let a = resolve(&ontology, 1, &[("first", "John"), ("last", "Smith")]);
        linker.link_reference(&mut store, &ontology, &a, &mut events).unwrap();
        let again = linker.link_reference(&mut store, &ontology, &a, &mut events).unwrap();
        assert_eq!(again.action, LinkAction::Unchanged);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_window_limits_candidates() {
        let ontology = ontology();
        let mut store = Store::new();
        let settings = LinkerSettings {
            window_size: Some(1),
            ..LinkerSettings::default()
        };
        let mut linker = MergePurgeLinker::new(&store, &ontology, settings);
        let mut sink = crate::events::NullSink;

        let a = resolve(&ontology, 1, &[("first", "John"), ("last", "Smith")]);
        let b = resolve(&ontology, 2, &[("first", "Bo"), ("last", "Kim")]);
        let c = resolve(&ontology, 3, &[("first", "john"), ("last", "Smith")]);
        linker.link_reference(&mut store, &ontology, &a, &mut sink).unwrap();
        linker.link_reference(&mut store, &ontology, &b, &mut sink).unwrap();
        linker.link_reference(&mut store, &ontology, &c, &mut sink).unwrap();

        assert_eq!(store.len(), 3);
        assert_eq!(linker.stats().window_skips, 1);
    }

    #[test]
    fn test_split_and_force_merge() {
        let ontology = ontology();
        let mut store = Store::new();
        let mut linker = MergePurgeLinker::new(&store, &ontology, LinkerSettings::default());
        let mut events = Vec::new();
        let a = resolve(&ontology, 1, &[("first", "John"), ("last", "Smith")]);
        let b = resolve(&ontology, 2, &[("first", "JOHN"), ("last", "Smith")]);
        linker.link_reference(&mut store, &ontology, &a, &mut events).unwrap();
        let joined = linker.link_reference(&mut store, &ontology, &b, &mut events).unwrap();

        let split = linker
            .split_out(&mut store, &ontology, joined.key, &b.ref_id, &mut events)
            .unwrap();
        assert_eq!(store.len(), 2);
        assert!(matches!(events.last(), Some(ClusterEvent::ClusterSplit { .. })));

        let split_id = store.get(split.key).unwrap().id.clone();
        let kept_id = store.get(joined.key).unwrap().id.clone();
        events.clear();
        let merged = linker
            .force_merge(&mut store, &ontology, &[split.key, joined.key], &mut events)
            .unwrap();
        assert_eq!(merged.key, joined.key);
        assert_eq!(store.len(), 1);
        assert_eq!(
            events,
            vec![
                ClusterEvent::ClusterMerged {
                    absorbed: split_id,
                    survivor: kept_id.clone(),
                },
                ClusterEvent::ClusterRenamed {
                    id: merged.id.clone(),
                    previous_id: kept_id,
                },
            ]
        );

        let lone = store.get(merged.key).unwrap().clone();
        assert!(linker
            .split_out(&mut store, &ontology, merged.key, &RefId::new("test", "404"), &mut events)
            .is_err());
        assert_eq!(lone.len(), 2);
    }

    struct RejectMerges;

    impl EventSink for RejectMerges {
        fn emit(&mut self, event: &ClusterEvent) -> anyhow::Result<()> {
            if matches!(event, ClusterEvent::ClusterMerged { .. }) {
                anyhow::bail!("event consumer unavailable");
            }
            Ok(())
        }
    }

    #[test]
    fn test_failed_merge_event_leaves_repository_consistent() {
        let ontology = ontology();
        let mut store = Store::new();
        let mut linker = MergePurgeLinker::new(&store, &ontology, LinkerSettings::default());
        let mut sink = RejectMerges;

        let a = resolve(&ontology, 1, &[("first", "Ann"), ("last", "Lee"), ("ssn", "111")]);
        let b = resolve(&ontology, 2, &[("first", "Bo"), ("last", "Kim"), ("ssn", "222")]);
        let bridge = resolve(&ontology, 3, &[("first", "ann"), ("last", "Lee"), ("ssn", "222")]);
        linker.link_reference(&mut store, &ontology, &a, &mut sink).unwrap();
        linker.link_reference(&mut store, &ontology, &b, &mut sink).unwrap();
        assert!(linker.link_reference(&mut store, &ontology, &bridge, &mut sink).is_err());

        // the merge itself is durable even though its event was lost
        assert_eq!(store.len(), 1);
        assert_eq!(linker.cluster_count(), 1);
        assert_eq!(store.resolve(ClusterKey(1)), Some(ClusterKey(0)));

        let bo_again = resolve(&ontology, 4, &[("first", "Bo"), ("last", "Kim"), ("ssn", "222")]);
        let outcome = linker
            .link_reference(&mut store, &ontology, &bo_again, &mut sink)
            .unwrap();
        assert_eq!(outcome.key, ClusterKey(0));
        assert_eq!(outcome.action, LinkAction::Joined);
        assert_eq!(store.len(), 1);
    }
}
