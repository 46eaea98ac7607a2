//! # Data Model
//!
//! Core data structures for entity resolution: incoming references, the
//! cluster records they are resolved into, and the compact identifiers that
//! tie the two together.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Compact identifier for declared attributes (declaration order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttrId(pub u32);

impl fmt::Display for AttrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "A{}", self.0)
    }
}

/// Stable internal handle of a cluster. Never reused within a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterKey(pub u32);

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "K{}", self.0)
    }
}

/// Published, content-derived identifier of a cluster (base-36 digest).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub String);

impl ClusterId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a reference: the source it came from and its id within that source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RefId {
    pub source: String,
    pub id: String,
}

impl RefId {
    pub fn new(source: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.source, self.id)
    }
}

/// Expected outcome carried by a reference in the assertion run modes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Assertion {
    /// References sharing this label are the same entity.
    SameEntity(String),
    /// The reference belongs to this existing identity.
    Identity(ClusterId),
    /// These existing identities are one entity.
    MergeIdentities(Vec<ClusterId>),
    /// The reference must be split out of this identity.
    Split(ClusterId),
}

impl Assertion {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SameEntity(_) => "same_entity",
            Self::Identity(_) => "identity",
            Self::MergeIdentities(_) => "merge_identities",
            Self::Split(_) => "split",
        }
    }
}

/// A raw input record as delivered by a reference source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Name of the source system that produced the reference
    #[serde(default)]
    pub source: String,
    /// Caller-supplied reference id; a sequence number is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Attribute name to value
    #[serde(default)]
    pub values: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assertion: Option<Assertion>,
}

impl Reference {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            id: None,
            values: BTreeMap::new(),
            assertion: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_value(mut self, attribute: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(attribute.into(), value.into());
        self
    }

    pub fn with_assertion(mut self, assertion: Assertion) -> Self {
        self.assertion = Some(assertion);
        self
    }
}

/// Per-attribute sets of observed values.
///
/// A single reference holds at most one value per attribute; a cluster holds
/// the union of its members' values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrValues {
    values: BTreeMap<AttrId, BTreeSet<String>>,
}

impl AttrValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning true if it was not already present.
    pub fn insert(&mut self, attr: AttrId, value: impl Into<String>) -> bool {
        self.values.entry(attr).or_default().insert(value.into())
    }

    pub fn get(&self, attr: AttrId) -> Option<&BTreeSet<String>> {
        self.values.get(&attr).filter(|set| !set.is_empty())
    }

    /// First value of an attribute in lexical order.
    pub fn first(&self, attr: AttrId) -> Option<&str> {
        self.get(attr)
            .and_then(|set| set.iter().next())
            .map(String::as_str)
    }

    pub fn contains(&self, attr: AttrId, value: &str) -> bool {
        self.values
            .get(&attr)
            .map(|set| set.contains(value))
            .unwrap_or(false)
    }

    /// Union another value set into this one. Returns the number of new values.
    pub fn extend(&mut self, other: &AttrValues) -> usize {
        let mut added = 0;
        for (attr, values) in &other.values {
            let entry = self.values.entry(*attr).or_default();
            for value in values {
                if entry.insert(value.clone()) {
                    added += 1;
                }
            }
        }
        added
    }

    pub fn iter(&self) -> impl Iterator<Item = (AttrId, &BTreeSet<String>)> + '_ {
        self.values
            .iter()
            .filter(|(_, set)| !set.is_empty())
            .map(|(attr, set)| (*attr, set))
    }

    pub fn is_empty(&self) -> bool {
        self.values.values().all(BTreeSet::is_empty)
    }

    /// Total number of stored values across attributes.
    pub fn value_count(&self) -> usize {
        self.values.values().map(BTreeSet::len).sum()
    }
}

impl FromIterator<(AttrId, String)> for AttrValues {
    fn from_iter<T: IntoIterator<Item = (AttrId, String)>>(iter: T) -> Self {
        let mut values = AttrValues::new();
        for (attr, value) in iter {
            values.insert(attr, value);
        }
        values
    }
}

/// A reference after attribute names have been resolved against the ontology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedReference {
    pub ref_id: RefId,
    pub values: AttrValues,
    pub assertion: Option<Assertion>,
}

/// A reference that has been absorbed into a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub ref_id: RefId,
    pub values: AttrValues,
    /// Run in which the reference joined the repository
    pub modification_id: u64,
}

/// Authoritative state of one resolved entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub key: ClusterKey,
    pub id: ClusterId,
    pub members: Vec<Member>,
    /// Union of the members' values
    pub values: AttrValues,
    /// Contributing source names
    pub sources: BTreeSet<String>,
    /// Ids previously published for this entity (absorbed or replaced)
    pub lineage: Vec<ClusterId>,
    /// Run that last modified this cluster
    pub modification_id: u64,
}

impl ClusterRecord {
    /// Create a singleton cluster for a reference.
    pub fn singleton(
        key: ClusterKey,
        id: ClusterId,
        reference: &ResolvedReference,
        modification_id: u64,
    ) -> Self {
        let mut sources = BTreeSet::new();
        sources.insert(reference.ref_id.source.clone());
        Self {
            key,
            id,
            members: vec![Member {
                ref_id: reference.ref_id.clone(),
                values: reference.values.clone(),
                modification_id,
            }],
            values: reference.values.clone(),
            sources,
            lineage: Vec::new(),
            modification_id,
        }
    }

    /// Add a reference as a member, unioning its values.
    pub fn add_member(&mut self, reference: &ResolvedReference, modification_id: u64) {
        self.values.extend(&reference.values);
        self.sources.insert(reference.ref_id.source.clone());
        self.members.push(Member {
            ref_id: reference.ref_id.clone(),
            values: reference.values.clone(),
            modification_id,
        });
        self.modification_id = modification_id;
    }

    /// Absorb another cluster: members, values, provenance and lineage.
    pub fn absorb(&mut self, other: ClusterRecord, modification_id: u64) {
        self.values.extend(&other.values);
        self.sources.extend(other.sources);
        self.members.extend(other.members);
        for id in other.lineage.into_iter().chain(std::iter::once(other.id)) {
            self.record_lineage(id);
        }
        self.modification_id = modification_id;
    }

    /// Remove a member and rebuild the union of values and sources.
    pub fn remove_member(&mut self, ref_id: &RefId) -> Option<Member> {
        let position = self.members.iter().position(|m| &m.ref_id == ref_id)?;
        let member = self.members.remove(position);
        self.values = AttrValues::new();
        self.sources.clear();
        for remaining in &self.members {
            self.values.extend(&remaining.values);
            self.sources.insert(remaining.ref_id.source.clone());
        }
        Some(member)
    }

    pub fn record_lineage(&mut self, id: ClusterId) {
        if id != self.id && !self.lineage.contains(&id) {
            self.lineage.push(id);
        }
    }

    pub fn contains_reference(&self, ref_id: &RefId) -> bool {
        self.members.iter().any(|m| &m.ref_id == ref_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(source: &str, id: &str, values: &[(u32, &str)]) -> ResolvedReference {
        ResolvedReference {
            ref_id: RefId::new(source, id),
            values: values
                .iter()
                .map(|(attr, value)| (AttrId(*attr), value.to_string()))
                .collect(),
            assertion: None,
        }
    }

    #[test]
    fn test_attr_values_union() {
        let mut left: AttrValues = [(AttrId(0), "Smith".to_string())].into_iter().collect();
        let right: AttrValues = [
            (AttrId(0), "Smith".to_string()),
            (AttrId(0), "Smyth".to_string()),
            (AttrId(1), "John".to_string()),
        ]
        .into_iter()
        .collect();

        assert_eq!(left.extend(&right), 2);
        assert_eq!(left.get(AttrId(0)).map(|s| s.len()), Some(2));
        assert_eq!(left.first(AttrId(1)), Some("John"));
        assert_eq!(left.value_count(), 3);
    }

    #[test]
    fn test_cluster_absorb_keeps_lineage() {
        let a = resolved("crm", "1", &[(0, "Smith")]);
        let b = resolved("erp", "9", &[(0, "Smyth")]);
        let mut left = ClusterRecord::singleton(ClusterKey(0), ClusterId::new("AAA"), &a, 1);
        let mut right = ClusterRecord::singleton(ClusterKey(1), ClusterId::new("BBB"), &b, 1);
        right.lineage.push(ClusterId::new("OLD"));

        left.absorb(right, 2);

        assert_eq!(left.len(), 2);
        assert_eq!(left.sources.len(), 2);
        assert_eq!(
            left.lineage,
            vec![ClusterId::new("OLD"), ClusterId::new("BBB")]
        );
        assert_eq!(left.modification_id, 2);
    }

    #[test]
    fn test_remove_member_rebuilds_values() {
        let a = resolved("crm", "1", &[(0, "Smith")]);
        let b = resolved("erp", "2", &[(0, "Smyth")]);
        let mut cluster = ClusterRecord::singleton(ClusterKey(0), ClusterId::new("AAA"), &a, 1);
        cluster.add_member(&b, 1);

        let removed = cluster.remove_member(&RefId::new("erp", "2")).unwrap();
        assert_eq!(removed.ref_id.id, "2");
        assert!(!cluster.values.contains(AttrId(0), "Smyth"));
        assert!(cluster.values.contains(AttrId(0), "Smith"));
        assert_eq!(cluster.sources.len(), 1);
    }

    #[test]
    fn test_reference_json_shape() {
        let json = r#"{"source":"crm","id":"7","values":{"last":"Doe"},"assertion":{"identity":"ABC"}}"#;
        let reference: Reference = serde_json::from_str(json).unwrap();
        assert_eq!(reference.id.as_deref(), Some("7"));
        assert_eq!(
            reference.assertion,
            Some(Assertion::Identity(ClusterId::new("ABC")))
        );
    }
}
