use std::path::Path;

use linkrust_rs::events::NullSink;
use linkrust_rs::test_support::person_ontology;
use linkrust_rs::{
    Assertion, ClusterEvent, ClusterId, LinkError, Linkrust, NoMonitor, PersistentStore, RefId,
    Reference, RunMode, RunSettings, VecSource,
};
use tempfile::tempdir;

fn open(path: &Path, mode: RunMode) -> Linkrust {
    let store = PersistentStore::open(path).expect("open repository");
    Linkrust::with_store(
        person_ontology(),
        store,
        RunSettings {
            mode,
            ..RunSettings::default()
        },
    )
}

fn person(source: &str, id: &str, first: &str, last: &str) -> Reference {
    Reference::new(source)
        .with_id(id)
        .with_value("first_name", first)
        .with_value("last_name", last)
}

/// Capture references and return the published id of each, in input order.
fn capture(path: &Path, references: Vec<Reference>) -> Vec<ClusterId> {
    let refs: Vec<RefId> = references
        .iter()
        .map(|r| RefId::new(r.source.clone(), r.id.clone().unwrap_or_default()))
        .collect();
    let mut repo = open(path, RunMode::IdentityCapture);
    let mut source = VecSource::new(references);
    repo.run(&mut source, &mut NullSink, &NoMonitor)
        .expect("capture run");
    refs.iter()
        .map(|r| repo.cluster_for_reference(r).expect("captured").id.clone())
        .collect()
}

#[test]
fn same_entity_labels_join_references() {
    let mut repo = Linkrust::new(
        person_ontology(),
        RunSettings {
            mode: RunMode::AssertRefToRef,
            ..RunSettings::default()
        },
    );
    let mut source = VecSource::new(vec![
        person("crm", "1", "Robert", "Paulson")
            .with_assertion(Assertion::SameEntity("g1".to_string())),
        person("erp", "2", "Bob", "Paulsen")
            .with_assertion(Assertion::SameEntity("g1".to_string())),
        person("erp", "3", "Marla", "Singer")
            .with_assertion(Assertion::SameEntity("g2".to_string())),
    ]);
    let mut events = Vec::new();
    let summary = repo.run(&mut source, &mut events, &NoMonitor).unwrap();

    assert_eq!(summary.processed, 3);
    assert_eq!(repo.cluster_count(), 2);
    let robert = repo.cluster_for_reference(&RefId::new("crm", "1")).unwrap();
    assert!(robert.contains_reference(&RefId::new("erp", "2")));
    assert!(events
        .iter()
        .any(|e| matches!(e, ClusterEvent::ClusterMerged { .. })));
}

#[test]
fn identity_assertion_attaches_to_existing_identity() {
    let dir = tempdir().unwrap();
    let ids = capture(dir.path(), vec![person("crm", "1", "Tyler", "Durden")]);

    let mut repo = open(dir.path(), RunMode::AssertRefToStr);
    let mut source = VecSource::new(vec![person("web", "9", "Jack", "Narrator")
        .with_assertion(Assertion::Identity(ids[0].clone()))]);
    repo.run(&mut source, &mut NullSink, &NoMonitor).unwrap();

    let cluster = repo.cluster_by_id(&ids[0]).unwrap();
    assert_eq!(cluster.len(), 2);
    assert_eq!(cluster.id, ids[0]);
    assert_eq!(repo.cluster_count(), 1);
}

#[test]
fn identity_assertion_on_unknown_identity_fails_the_run() {
    let dir = tempdir().unwrap();
    capture(dir.path(), vec![person("crm", "1", "Tyler", "Durden")]);

    let mut repo = open(dir.path(), RunMode::AssertRefToStr);
    let mut source = VecSource::new(vec![person("web", "9", "Jack", "Narrator")
        .with_assertion(Assertion::Identity(ClusterId::new("NOSUCHID")))]);
    let err = repo
        .run(&mut source, &mut NullSink, &NoMonitor)
        .unwrap_err();

    assert!(matches!(err, LinkError::AssertionFailed { .. }));
    assert_eq!(err.exit_code(), 3);
    assert_eq!(repo.cluster_count(), 1);
}

#[test]
fn merge_identities_assertion_collapses_clusters() {
    let dir = tempdir().unwrap();
    let ids = capture(
        dir.path(),
        vec![
            person("crm", "1", "Tyler", "Durden"),
            person("crm", "2", "Jack", "Narrator"),
        ],
    );
    assert_ne!(ids[0], ids[1]);

    let mut repo = open(dir.path(), RunMode::AssertStrToStr);
    let mut events = Vec::new();
    let mut source = VecSource::new(vec![Reference::new("ops")
        .with_id("m1")
        .with_assertion(Assertion::MergeIdentities(ids.clone()))]);
    repo.run(&mut source, &mut events, &NoMonitor).unwrap();

    assert_eq!(repo.cluster_count(), 1);
    let merged = repo.cluster_by_id(&ids[1]).unwrap();
    assert_eq!(merged.id, ids[0]);
    assert!(merged.lineage.contains(&ids[1]));
    assert!(events.iter().any(|e| matches!(
        e,
        ClusterEvent::ClusterMerged { absorbed, .. } if *absorbed == ids[1]
    )));
}

#[test]
fn merge_identities_needs_two_identities() {
    let dir = tempdir().unwrap();
    let ids = capture(dir.path(), vec![person("crm", "1", "Tyler", "Durden")]);

    let mut repo = open(dir.path(), RunMode::AssertStrToStr);
    let mut source = VecSource::new(vec![Reference::new("ops")
        .with_id("m1")
        .with_assertion(Assertion::MergeIdentities(vec![ids[0].clone()]))]);
    let err = repo
        .run(&mut source, &mut NullSink, &NoMonitor)
        .unwrap_err();
    assert_eq!(err.exit_code(), 3);
}

#[test]
fn split_assertion_moves_reference_to_new_identity() {
    let dir = tempdir().unwrap();
    let ids = capture(
        dir.path(),
        vec![
            person("crm", "1", "Marla", "Singer"),
            person("crm", "2", "MARLA", "Singer"),
        ],
    );
    assert_eq!(ids[0], ids[1]);

    let mut repo = open(dir.path(), RunMode::AssertSplitStr);
    let mut events = Vec::new();
    let mut source = VecSource::new(vec![Reference::new("crm")
        .with_id("2")
        .with_assertion(Assertion::Split(ids[0].clone()))]);
    repo.run(&mut source, &mut events, &NoMonitor).unwrap();

    assert_eq!(repo.cluster_count(), 2);
    let kept = repo.cluster_by_id(&ids[0]).unwrap();
    assert_eq!(kept.len(), 1);
    assert!(kept.contains_reference(&RefId::new("crm", "1")));
    let split = repo.cluster_for_reference(&RefId::new("crm", "2")).unwrap();
    assert_ne!(split.id, ids[0]);
    assert_eq!(split.modification_id, 2);
    assert!(matches!(events.last(), Some(ClusterEvent::ClusterSplit { .. })));

    let mut again = VecSource::new(vec![Reference::new("crm")
        .with_id("1")
        .with_assertion(Assertion::Split(ids[0].clone()))]);
    let err = repo.run(&mut again, &mut NullSink, &NoMonitor).unwrap_err();
    assert_eq!(err.exit_code(), 3);
}

#[test]
fn assertion_modes_reject_references_without_the_assertion() {
    let mut repo = Linkrust::new(
        person_ontology(),
        RunSettings {
            mode: RunMode::AssertRefToRef,
            ..RunSettings::default()
        },
    );
    let mut missing = VecSource::new(vec![person("crm", "1", "Tyler", "Durden")]);
    let err = repo
        .run(&mut missing, &mut NullSink, &NoMonitor)
        .unwrap_err();
    assert_eq!(err.exit_code(), 3);

    let mut wrong_kind = VecSource::new(vec![person("crm", "2", "Tyler", "Durden")
        .with_assertion(Assertion::Split(ClusterId::new("ABC")))]);
    let err = repo
        .run(&mut wrong_kind, &mut NullSink, &NoMonitor)
        .unwrap_err();
    assert!(err.to_string().contains("expected same_entity assertion"));
    assert_eq!(repo.cluster_count(), 0);
}
