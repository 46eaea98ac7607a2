//! # Linkrust
//!
//! Rule-driven entity resolution. References from one or more sources are
//! blocked, pre-filtered and matched against configurable identity rules,
//! then clustered by incremental merge-purge into a persistent identity
//! repository with deterministic, content-derived identifiers.

pub mod comparator;
pub mod config;
pub mod dsu;
pub mod error;
pub mod events;
pub mod identity;
pub mod index;
pub mod lcrd;
pub mod linker;
pub mod model;
pub mod monitor;
pub mod ontology;
pub mod persistence;
pub mod rules;
pub mod source;
pub mod store;
pub mod test_support;

// Re-export main types for convenience
pub use comparator::{Comparator, ComparatorRegistry, MatchCode};
pub use config::{LinkrustConfig, RunMode, RunSettings};
pub use error::{LinkError, SourceError, ValidationError};
pub use events::{ClusterEvent, EventSink, JsonLinesSink, MergeMap};
pub use identity::{HashAlgorithm, IdGenerator};
pub use linker::{LinkAction, LinkOutcome, LinkStats, LinkerSettings, MergePurgeLinker};
pub use model::{Assertion, AttrId, ClusterId, ClusterKey, ClusterRecord, RefId, Reference};
pub use monitor::{NoMonitor, ReferenceBudget, ResourceMonitor, StopFlag};
pub use ontology::{Ontology, OntologySpec};
pub use persistence::PersistentStore;
pub use source::{JsonLinesSource, ReferenceSource, VecSource};
pub use store::{ClusterStore, Store};

use hashbrown::HashMap;
use serde::Serialize;
use tracing::{info, warn};

/// What processing one reference produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceOutcome {
    Linked(LinkOutcome),
    /// Identities matched in resolve mode
    Resolved(Vec<ClusterId>),
}

/// Counters of a completed run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub mode: RunMode,
    pub modification_id: u64,
    pub read: u64,
    pub processed: u64,
    pub rejected: u64,
    /// The resource monitor ended the run before the source was exhausted
    pub stopped_early: bool,
    pub clusters: usize,
    pub stats: LinkStats,
}

/// Identity repository: an ontology, a cluster store and the linker state
/// built over them.
pub struct Linkrust {
    store: Box<dyn ClusterStore>,
    ontology: Ontology,
    settings: RunSettings,
    linker: MergePurgeLinker,
    sequence: u64,
    /// Same-entity labels to the cluster holding them
    labels: HashMap<String, ClusterKey>,
}

impl Linkrust {
    /// In-memory repository.
    pub fn new(ontology: Ontology, settings: RunSettings) -> Self {
        Self::with_store(ontology, Store::new(), settings)
    }

    /// Repository over a custom store, e.g. a [`PersistentStore`].
    pub fn with_store<S>(ontology: Ontology, store: S, settings: RunSettings) -> Self
    where
        S: ClusterStore + 'static,
    {
        let linker = MergePurgeLinker::new(&store, &ontology, settings.linker_settings());
        Self {
            store: Box::new(store),
            ontology,
            settings,
            linker,
            sequence: 0,
            labels: HashMap::new(),
        }
    }

    pub fn ontology(&self) -> &Ontology {
        &self.ontology
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn store(&self) -> &dyn ClusterStore {
        self.store.as_ref()
    }

    pub fn into_store(self) -> Box<dyn ClusterStore> {
        self.store
    }

    /// Modification id stamped on clusters touched by the current run.
    pub fn modification_id(&self) -> u64 {
        self.linker.modification_id()
    }

    pub fn stats(&self) -> &LinkStats {
        self.linker.stats()
    }

    /// Start a new run over the same repository.
    pub fn begin_run(&mut self) {
        self.linker.begin_run(self.store.as_ref());
        self.labels.clear();
    }

    /// Resolve, then link, resolve or apply the assertion of one reference,
    /// according to the run mode.
    pub fn process_reference(
        &mut self,
        reference: &Reference,
        sink: &mut dyn EventSink,
    ) -> Result<ReferenceOutcome, LinkError> {
        self.sequence += 1;
        let resolved = self.ontology.resolve_reference(reference, self.sequence)?;
        let mode = self.settings.mode;

        if let Some(required) = mode.required_assertion() {
            return self
                .apply_assertion(resolved, required, sink)
                .map(ReferenceOutcome::Linked);
        }
        if resolved.values.is_empty() {
            return Err(LinkError::MalformedReference {
                reference: resolved.ref_id.to_string(),
                reason: "no attribute values".to_string(),
            });
        }
        if !mode.mutates_repository() {
            let ids = self
                .linker
                .resolve_matches(self.store.as_ref(), &self.ontology, &resolved, sink)?;
            return Ok(ReferenceOutcome::Resolved(ids));
        }

        let outcome =
            self.linker
                .link_reference(self.store.as_mut(), &self.ontology, &resolved, sink)?;
        Ok(ReferenceOutcome::Linked(outcome))
    }

    fn apply_assertion(
        &mut self,
        resolved: model::ResolvedReference,
        required: &str,
        sink: &mut dyn EventSink,
    ) -> Result<LinkOutcome, LinkError> {
        let reference = resolved.ref_id.to_string();
        let fail = |reason: String| LinkError::AssertionFailed {
            reference: reference.clone(),
            reason,
        };

        let Some(assertion) = resolved.assertion.clone() else {
            return Err(fail(format!("missing {required} assertion")));
        };
        if assertion.kind() != required {
            return Err(fail(format!(
                "expected {required} assertion, found {}",
                assertion.kind()
            )));
        }

        match assertion {
            Assertion::SameEntity(label) => {
                let outcome = self.linker.link_reference(
                    self.store.as_mut(),
                    &self.ontology,
                    &resolved,
                    sink,
                )?;
                let anchor = self
                    .labels
                    .get(&label)
                    .copied()
                    .and_then(|key| self.linker.find(key));
                let outcome = match anchor {
                    Some(anchor) if anchor != outcome.key => self.linker.force_merge(
                        self.store.as_mut(),
                        &self.ontology,
                        &[anchor, outcome.key],
                        sink,
                    )?,
                    _ => outcome,
                };
                self.labels.insert(label, outcome.key);
                Ok(outcome)
            }
            Assertion::Identity(id) => {
                let target = self
                    .store
                    .key_for_id(&id)
                    .ok_or_else(|| fail(format!("unknown identity {id}")))?;
                match self.store.key_for_reference(&resolved.ref_id) {
                    Some(key) if key == target => {
                        let id = self
                            .store
                            .get(key)
                            .map(|record| record.id.clone())
                            .unwrap_or(id);
                        Ok(LinkOutcome {
                            key,
                            id,
                            action: LinkAction::Unchanged,
                        })
                    }
                    Some(key) => {
                        let holder = self
                            .store
                            .get(key)
                            .map(|record| record.id.to_string())
                            .unwrap_or_else(|| key.to_string());
                        Err(fail(format!("already belongs to identity {holder}")))
                    }
                    None => self.linker.attach(
                        self.store.as_mut(),
                        &self.ontology,
                        target,
                        &resolved,
                        sink,
                    ),
                }
            }
            Assertion::MergeIdentities(ids) => {
                if ids.len() < 2 {
                    return Err(fail("at least two identities are required".to_string()));
                }
                let mut keys = Vec::with_capacity(ids.len());
                for id in &ids {
                    let key = self
                        .store
                        .key_for_id(id)
                        .ok_or_else(|| fail(format!("unknown identity {id}")))?;
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
                if keys.len() == 1 {
                    let key = keys[0];
                    let id = self
                        .store
                        .get(key)
                        .map(|record| record.id.clone())
                        .ok_or_else(|| fail(format!("identity {} is not live", ids[0])))?;
                    return Ok(LinkOutcome {
                        key,
                        id,
                        action: LinkAction::Unchanged,
                    });
                }
                self.linker
                    .force_merge(self.store.as_mut(), &self.ontology, &keys, sink)
            }
            Assertion::Split(id) => {
                let from = self
                    .store
                    .key_for_id(&id)
                    .ok_or_else(|| fail(format!("unknown identity {id}")))?;
                self.linker.split_out(
                    self.store.as_mut(),
                    &self.ontology,
                    from,
                    &resolved.ref_id,
                    sink,
                )
            }
        }
    }

    /// Drain a source through the repository.
    ///
    /// Malformed references are logged, counted and skipped, except in the
    /// assertion modes where any failure aborts the run.
    pub fn run(
        &mut self,
        source: &mut dyn ReferenceSource,
        sink: &mut dyn EventSink,
        monitor: &dyn ResourceMonitor,
    ) -> Result<RunSummary, LinkError> {
        let mode = self.settings.mode;
        let mut summary = RunSummary {
            mode,
            modification_id: self.modification_id(),
            ..RunSummary::default()
        };

        loop {
            if monitor.should_stop(summary.read) {
                summary.stopped_early = true;
                warn!(read = summary.read, "resource monitor stopped the run");
                break;
            }
            match source.next_reference() {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    let err = LinkError::from(err);
                    summary.read += 1;
                    if err.is_recoverable() && !mode.is_assertion() {
                        warn!(source = source.name(), error = %err, "rejected reference");
                        summary.rejected += 1;
                        continue;
                    }
                    return Err(err);
                }
            }
            let Some(reference) = source.current_record() else {
                break;
            };
            summary.read += 1;

            match self.process_reference(reference, sink) {
                Ok(_) => summary.processed += 1,
                Err(err) if err.is_recoverable() && !mode.is_assertion() => {
                    warn!(source = source.name(), error = %err, "rejected reference");
                    summary.rejected += 1;
                }
                Err(err) => return Err(err),
            }
        }

        sink.finish()?;
        self.store.flush()?;

        summary.clusters = self.cluster_count();
        summary.stats = self.linker.stats().clone();
        info!(
            mode = ?summary.mode,
            modification_id = summary.modification_id,
            read = summary.read,
            processed = summary.processed,
            rejected = summary.rejected,
            clusters = summary.clusters,
            merged = summary.stats.clusters_merged,
            iterations = summary.stats.iterations,
            "run complete"
        );
        Ok(summary)
    }

    /// Full closure pass over every live cluster. Returns the merges made.
    pub fn consolidate(&mut self, sink: &mut dyn EventSink) -> Result<u64, LinkError> {
        let merged = self
            .linker
            .consolidate(self.store.as_mut(), &self.ontology, sink)?;
        self.store.flush()?;
        Ok(merged)
    }

    pub fn cluster_count(&self) -> usize {
        self.store.len()
    }

    /// Live clusters in creation order.
    pub fn clusters(&self) -> Vec<&ClusterRecord> {
        self.store
            .keys()
            .into_iter()
            .filter_map(|key| self.store.get(key))
            .collect()
    }

    pub fn cluster_by_id(&self, id: &ClusterId) -> Option<&ClusterRecord> {
        self.store.key_for_id(id).and_then(|key| self.store.get(key))
    }

    pub fn cluster_for_reference(&self, ref_id: &RefId) -> Option<&ClusterRecord> {
        self.store
            .key_for_reference(ref_id)
            .and_then(|key| self.store.get(key))
    }

    /// Every member reference with the id of its cluster, ordered by reference.
    pub fn link_output(&self) -> Vec<(RefId, ClusterId)> {
        let mut output: Vec<(RefId, ClusterId)> = self
            .clusters()
            .into_iter()
            .flat_map(|cluster| {
                cluster
                    .members
                    .iter()
                    .map(|member| (member.ref_id.clone(), cluster.id.clone()))
            })
            .collect();
        output.sort();
        output
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        self.store.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::person_ontology;

    fn person(source: &str, id: &str, first: &str, last: &str) -> Reference {
        Reference::new(source)
            .with_id(id)
            .with_value("first_name", first)
            .with_value("last_name", last)
    }

    #[test]
    fn test_run_counts_and_skips_malformed() {
        let mut repo = Linkrust::new(person_ontology(), RunSettings::default());
        let mut source = VecSource::new(vec![
            person("crm", "1", "John", "Smith"),
            Reference::new("crm").with_id("2").with_value("nickname", "Johnny"),
            person("erp", "3", "JOHN", "Smith"),
            Reference::new("crm").with_id("4"),
        ]);
        let mut events = Vec::new();

        let summary = repo.run(&mut source, &mut events, &NoMonitor).unwrap();

        assert_eq!(summary.read, 4);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.rejected, 2);
        assert_eq!(summary.clusters, 1);
        assert_eq!(summary.modification_id, 1);
        let cluster = repo.cluster_for_reference(&RefId::new("erp", "3")).unwrap();
        assert_eq!(cluster.sources.len(), 2);
    }

    #[test]
    fn test_monitor_stops_between_references() {
        let mut repo = Linkrust::new(person_ontology(), RunSettings::default());
        let mut source = VecSource::new(vec![
            person("crm", "1", "John", "Smith"),
            person("crm", "2", "Jane", "Doe"),
            person("crm", "3", "Bob", "Roe"),
        ]);
        let summary = repo
            .run(&mut source, &mut events::NullSink, &ReferenceBudget(2))
            .unwrap();
        assert!(summary.stopped_early);
        assert_eq!(summary.processed, 2);
        assert_eq!(source.remaining(), 1);
    }

    #[test]
    fn test_resolve_mode_leaves_repository_untouched() {
        let mut resolver = Linkrust::with_store(
            person_ontology(),
            Store::new(),
            RunSettings {
                mode: RunMode::IdentityResolve,
                ..RunSettings::default()
            },
        );
        let mut events = Vec::new();
        let outcome = resolver
            .process_reference(&person("web", "9", "john", "Smith"), &mut events)
            .unwrap();
        assert_eq!(outcome, ReferenceOutcome::Resolved(Vec::new()));
        assert_eq!(resolver.cluster_count(), 0);
        assert!(matches!(
            &events[0],
            ClusterEvent::ReferenceResolved { ids, .. } if ids.is_empty()
        ));
    }

    #[test]
    fn test_link_output_lists_every_member() {
        let mut repo = Linkrust::new(person_ontology(), RunSettings::default());
        let mut sink = events::NullSink;
        for reference in [
            person("crm", "1", "John", "Smith"),
            person("crm", "2", "JOHN", "Smith"),
            person("crm", "3", "Jane", "Doe"),
        ] {
            repo.process_reference(&reference, &mut sink).unwrap();
        }
        let output = repo.link_output();
        assert_eq!(output.len(), 3);
        assert_eq!(output[0].1, output[1].1);
        assert_ne!(output[0].1, output[2].1);
    }
}
