//! # Indexing Module
//!
//! Blocking index for candidate retrieval. Each index rule turns a record's
//! values into one key per value combination; records sharing a key become
//! candidates for full rule evaluation. When no index rules are configured the
//! [`NullIndex`] returns every live cluster instead.
//!
//! A multi-valued cluster whose combinations exceed the per-rule cap is not
//! posted under partial keys. It is kept in an overflow set that every probe
//! sees, so capping never hides a cluster from a probe that matches it.

use crate::comparator::MatchCode;
use crate::model::{AttrValues, ClusterKey};
use crate::ontology::{IndexRule, Ontology, SegmentTransform};
use hashbrown::HashMap;
use std::collections::BTreeSet;
use tracing::debug;

/// Longest Scan output allowed by configuration.
pub const MAX_SCAN_LENGTH: usize = 30;
/// Fill character for Scan outputs shorter than their length.
pub const SCAN_PAD: char = '*';
/// Most keys one index rule may post for a cluster.
const MAX_KEYS_PER_RULE: usize = 256;
/// Separates the rule identifier from the derived key.
const KEY_NAMESPACE_SEPARATOR: char = '\u{1f}';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    LeftToRight,
    RightToLeft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharClass {
    All,
    NonBlank,
    /// Letters and digits
    Alpha,
    Letter,
    Digit,
}

impl CharClass {
    fn admits(self, c: char) -> bool {
        match self {
            Self::All => true,
            Self::NonBlank => !c.is_whitespace(),
            Self::Alpha => c.is_alphanumeric(),
            Self::Letter => c.is_alphabetic(),
            Self::Digit => c.is_ascii_digit(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseFold {
    ToUpper,
    KeepCase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    SameOrder,
    LowToHighKeepDup,
    LowToHighDropDup,
}

/// Parsed `Scan(direction, class, length, case, order)` transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSpec {
    pub direction: ScanDirection,
    pub class: CharClass,
    /// 0 disables truncation and padding
    pub length: usize,
    pub case: CaseFold,
    pub order: ScanOrder,
}

impl ScanSpec {
    /// Build a scan from its parsed match code. Errors carry the reason only.
    pub fn from_match_code(code: &MatchCode) -> Result<Self, String> {
        let args = code.args();
        if args.len() != 5 {
            return Err(format!("expected 5 arguments, found {}", args.len()));
        }
        let upper: Vec<String> = args.iter().map(|a| a.to_uppercase()).collect();

        let direction = match upper[0].as_str() {
            "LR" => ScanDirection::LeftToRight,
            "RL" => ScanDirection::RightToLeft,
            other => return Err(format!("unknown direction '{other}'")),
        };
        let class = match upper[1].as_str() {
            "ALL" => CharClass::All,
            "NONBLANK" => CharClass::NonBlank,
            "ALPHA" => CharClass::Alpha,
            "LETTER" => CharClass::Letter,
            "DIGIT" => CharClass::Digit,
            other => return Err(format!("unknown character class '{other}'")),
        };
        let length: usize = upper[2]
            .parse()
            .map_err(|_| format!("length '{}' is not a number", args[2]))?;
        if length > MAX_SCAN_LENGTH {
            return Err(format!("length {length} exceeds {MAX_SCAN_LENGTH}"));
        }
        let case = match upper[3].as_str() {
            "TOUPPER" => CaseFold::ToUpper,
            "KEEPCASE" => CaseFold::KeepCase,
            other => return Err(format!("unknown case option '{other}'")),
        };
        let order = match upper[4].as_str() {
            "SAMEORDER" => ScanOrder::SameOrder,
            "L2HKEEPDUP" => ScanOrder::LowToHighKeepDup,
            "L2HDROPDUP" => ScanOrder::LowToHighDropDup,
            other => return Err(format!("unknown order option '{other}'")),
        };

        Ok(Self {
            direction,
            class,
            length,
            case,
            order,
        })
    }

    /// Apply the scan to a value. A fixed-length scan always yields a key,
    /// all padding when nothing survives filtering. `None` only for an
    /// unbounded scan with nothing left.
    pub fn apply(&self, value: &str) -> Option<String> {
        let mut chars: Vec<char> = value.chars().collect();
        let reversed = self.direction == ScanDirection::RightToLeft;
        if reversed {
            chars.reverse();
        }
        chars.retain(|c| self.class.admits(*c));
        if self.length > 0 {
            chars.truncate(self.length);
        }
        if self.case == CaseFold::ToUpper {
            chars = chars.into_iter().flat_map(char::to_uppercase).collect();
            if self.length > 0 {
                chars.truncate(self.length);
            }
        }
        match self.order {
            ScanOrder::SameOrder => {
                if reversed {
                    chars.reverse();
                }
            }
            ScanOrder::LowToHighKeepDup => chars.sort_unstable(),
            ScanOrder::LowToHighDropDup => {
                chars.sort_unstable();
                chars.dedup();
            }
        }
        if chars.is_empty() && self.length == 0 {
            return None;
        }

        let pad = self.length.saturating_sub(chars.len());
        let mut key: String = chars.into_iter().collect();
        key.extend(std::iter::repeat(SCAN_PAD).take(pad));
        Some(key)
    }
}

/// Keys derived from a value set across all index rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexKeys {
    pub keys: BTreeSet<String>,
    /// Some rule had more combinations than it may post
    pub overflow: bool,
}

/// Derive every index key for a value set across all index rules.
pub fn derive_keys(ontology: &Ontology, values: &AttrValues) -> IndexKeys {
    let mut derived = IndexKeys::default();
    for rule in ontology.index_rules() {
        match rule_keys(ontology, rule, values) {
            Some(keys) => derived.keys.extend(keys),
            None => {
                debug!(rule = %rule.identifier, "index key product exceeds cap");
                derived.overflow = true;
            }
        }
    }
    derived
}

/// Keys of one index rule: the product of each segment's distinct outputs.
/// `None` when the product is larger than [`MAX_KEYS_PER_RULE`].
fn rule_keys(ontology: &Ontology, rule: &IndexRule, values: &AttrValues) -> Option<Vec<String>> {
    let mut partial = vec![String::new()];
    for segment in &rule.segments {
        let Some(segment_values) = values.get(segment.item) else {
            return Some(Vec::new());
        };
        let outputs: BTreeSet<String> = segment_values
            .iter()
            .filter_map(|value| match &segment.transform {
                SegmentTransform::Scan(scan) => scan.apply(value),
                SegmentTransform::Token(code) => ontology
                    .attribute(segment.item)
                    .comparator()
                    .token(value, code),
            })
            .filter(|output| !output.is_empty())
            .collect();
        if outputs.is_empty() {
            return Some(Vec::new());
        }
        if partial.len() * outputs.len() > MAX_KEYS_PER_RULE {
            return None;
        }

        partial = partial
            .iter()
            .flat_map(|prefix| outputs.iter().map(move |output| format!("{prefix}{output}")))
            .collect();
    }

    Some(
        partial
            .into_iter()
            .map(|key| format!("{}{KEY_NAMESPACE_SEPARATOR}{key}", rule.identifier))
            .collect(),
    )
}

/// Key to cluster postings for configured index rules.
#[derive(Debug, Clone, Default)]
pub struct KeyedIndex {
    postings: HashMap<String, BTreeSet<ClusterKey>>,
    keys_by_cluster: HashMap<ClusterKey, BTreeSet<String>>,
    /// Clusters with a rule over the key cap, candidates for every probe
    overflow: BTreeSet<ClusterKey>,
}

impl KeyedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_index(&mut self, ontology: &Ontology, cluster: ClusterKey, values: &AttrValues) -> usize {
        let derived = derive_keys(ontology, values);
        if derived.overflow {
            self.overflow.insert(cluster);
        }
        let owned = self.keys_by_cluster.entry(cluster).or_default();
        let mut added = 0;
        for key in derived.keys {
            if owned.insert(key.clone()) {
                self.postings.entry(key).or_default().insert(cluster);
                added += 1;
            }
        }
        added
    }

    fn get_candidates(&self, ontology: &Ontology, values: &AttrValues) -> BTreeSet<ClusterKey> {
        let derived = derive_keys(ontology, values);
        if derived.overflow {
            // the probe's own keys are incomplete
            return self.keys_by_cluster.keys().copied().collect();
        }
        let mut candidates = self.overflow.clone();
        for key in derived.keys {
            if let Some(clusters) = self.postings.get(&key) {
                candidates.extend(clusters.iter().copied());
            }
        }
        candidates
    }

    fn repoint(&mut self, absorbed: ClusterKey, survivor: ClusterKey) {
        if self.overflow.remove(&absorbed) {
            self.overflow.insert(survivor);
        }
        let Some(keys) = self.keys_by_cluster.remove(&absorbed) else {
            return;
        };
        for key in &keys {
            if let Some(clusters) = self.postings.get_mut(key) {
                clusters.remove(&absorbed);
                clusters.insert(survivor);
            }
        }
        self.keys_by_cluster.entry(survivor).or_default().extend(keys);
    }

    fn remove_cluster(&mut self, cluster: ClusterKey) {
        self.overflow.remove(&cluster);
        let Some(keys) = self.keys_by_cluster.remove(&cluster) else {
            return;
        };
        for key in keys {
            if let Some(clusters) = self.postings.get_mut(&key) {
                clusters.remove(&cluster);
                if clusters.is_empty() {
                    self.postings.remove(&key);
                }
            }
        }
    }
}

/// Index used when no index rules are configured: every live cluster is a
/// candidate.
#[derive(Debug, Clone, Default)]
pub struct NullIndex {
    live: BTreeSet<ClusterKey>,
}

/// Blocking index backend selected from the ontology.
#[derive(Debug, Clone)]
pub enum BlockingIndex {
    Keyed(KeyedIndex),
    Null(NullIndex),
}

impl BlockingIndex {
    pub fn for_ontology(ontology: &Ontology) -> Self {
        if ontology.index_rules().is_empty() {
            Self::Null(NullIndex::default())
        } else {
            Self::Keyed(KeyedIndex::new())
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null(_))
    }

    /// Index a cluster under the keys of `values`. Returns the new key count.
    pub fn add_index(&mut self, ontology: &Ontology, cluster: ClusterKey, values: &AttrValues) -> usize {
        match self {
            Self::Keyed(index) => index.add_index(ontology, cluster, values),
            Self::Null(index) => usize::from(index.live.insert(cluster)),
        }
    }

    /// Clusters sharing at least one key with `values`.
    pub fn get_candidates(&self, ontology: &Ontology, values: &AttrValues) -> BTreeSet<ClusterKey> {
        match self {
            Self::Keyed(index) => index.get_candidates(ontology, values),
            Self::Null(index) => index.live.clone(),
        }
    }

    /// Move an absorbed cluster's postings onto its survivor.
    pub fn repoint(&mut self, absorbed: ClusterKey, survivor: ClusterKey) {
        match self {
            Self::Keyed(index) => index.repoint(absorbed, survivor),
            Self::Null(index) => {
                index.live.remove(&absorbed);
                index.live.insert(survivor);
            }
        }
    }

    pub fn remove_cluster(&mut self, cluster: ClusterKey) {
        match self {
            Self::Keyed(index) => index.remove_cluster(cluster),
            Self::Null(index) => {
                index.live.remove(&cluster);
            }
        }
    }

    /// Rebuild a cluster's postings from scratch, after it lost members.
    pub fn reindex_cluster(&mut self, ontology: &Ontology, cluster: ClusterKey, values: &AttrValues) {
        self.remove_cluster(cluster);
        self.add_index(ontology, cluster, values);
    }
}
