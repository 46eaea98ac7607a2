//! # Comparators
//!
//! Comparators are the pluggable predicates bound to attributes. The crate
//! ships only the default comparator (exact and case-insensitive equality);
//! anything richer is registered by name in a [`ComparatorRegistry`] before
//! the ontology is validated.

use crate::error::ValidationError;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Normalized operation name for byte-equality terms.
pub const EXACT: &str = "EXACT";
/// Normalized operation name for case-insensitive equality terms.
pub const EXACT_IGNORE_CASE: &str = "EXACT_IGNORE_CASE";
/// Name under which the default comparator is registered.
pub const DEFAULT_COMPARATOR: &str = "default";

/// A parsed match code such as `Exact`, `Exact-Ignore-Case` or `Prefix(3)`.
///
/// The text before any parenthesis identifies the operation; it is uppercased
/// with `-` and spaces folded to `_`. Arguments are the comma separated,
/// trimmed contents of the parenthesis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MatchCode {
    raw: String,
    operation: String,
    args: Vec<String>,
}

impl MatchCode {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        let malformed = || ValidationError::MalformedMatchCode(raw.to_string());

        let (head, args) = match trimmed.find('(') {
            Some(open) => {
                let inner = trimmed[open + 1..]
                    .strip_suffix(')')
                    .ok_or_else(malformed)?;
                let args = if inner.trim().is_empty() {
                    Vec::new()
                } else {
                    inner.split(',').map(|a| a.trim().to_string()).collect()
                };
                (&trimmed[..open], args)
            }
            None => (trimmed, Vec::new()),
        };

        let operation: String = head
            .trim()
            .chars()
            .map(|c| match c {
                '-' | ' ' => '_',
                other => other.to_ascii_uppercase(),
            })
            .collect();
        if operation.is_empty() || args.iter().any(String::is_empty) {
            return Err(malformed());
        }

        Ok(Self {
            raw: trimmed.to_string(),
            operation,
            args,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Parse the argument at `index` as an integer.
    pub fn int_arg(&self, index: usize) -> Option<usize> {
        self.args.get(index).and_then(|a| a.parse().ok())
    }

    pub fn is_exact(&self) -> bool {
        self.operation == EXACT && self.args.is_empty()
    }

    pub fn is_exact_ignore_case(&self) -> bool {
        self.operation == EXACT_IGNORE_CASE && self.args.is_empty()
    }

    /// True for the two equality codes evaluated without a comparator.
    pub fn is_equality(&self) -> bool {
        self.is_exact() || self.is_exact_ignore_case()
    }
}

impl fmt::Display for MatchCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Unicode case-insensitive equality without allocating.
pub fn eq_ignore_case(left: &str, right: &str) -> bool {
    left.chars()
        .flat_map(char::to_lowercase)
        .eq(right.chars().flat_map(char::to_lowercase))
}

/// A comparison predicate bound to an attribute.
pub trait Comparator: fmt::Debug + Send + Sync {
    /// Registry name of the comparator.
    fn name(&self) -> &str;

    /// Normalized operation names this comparator evaluates.
    fn supported_match_codes(&self) -> &[&'static str];

    /// Whether a match code can be evaluated by this comparator.
    fn supports(&self, code: &MatchCode) -> bool {
        code.is_equality() || self.supported_match_codes().contains(&code.operation())
    }

    /// Compare a probe value with a candidate value.
    ///
    /// `compare_to` carries the probe's values for the term's compare-to
    /// attributes, for comparators that look across attributes.
    fn evaluate(&self, left: &str, right: &str, code: &MatchCode, compare_to: &[&str]) -> bool;

    /// Derive a blocking token from a value, for index segments that name a
    /// match code instead of a scan.
    fn token(&self, value: &str, code: &MatchCode) -> Option<String> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        if code.is_exact() {
            Some(value.to_string())
        } else {
            Some(value.to_uppercase())
        }
    }
}

/// Pass-through comparator: equality codes only.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultComparator;

impl Comparator for DefaultComparator {
    fn name(&self) -> &str {
        DEFAULT_COMPARATOR
    }

    fn supported_match_codes(&self) -> &[&'static str] {
        &[EXACT, EXACT_IGNORE_CASE]
    }

    fn evaluate(&self, left: &str, right: &str, code: &MatchCode, _compare_to: &[&str]) -> bool {
        if code.is_exact_ignore_case() {
            eq_ignore_case(left, right)
        } else {
            left == right
        }
    }
}

/// Name-keyed comparator factory, resolved once at validation time.
#[derive(Debug, Clone)]
pub struct ComparatorRegistry {
    comparators: HashMap<String, Arc<dyn Comparator>>,
    fallback: Arc<dyn Comparator>,
}

impl ComparatorRegistry {
    /// Registry holding only the default comparator.
    pub fn with_defaults() -> Self {
        let fallback: Arc<dyn Comparator> = Arc::new(DefaultComparator);
        let mut comparators = HashMap::new();
        comparators.insert(DEFAULT_COMPARATOR.to_string(), fallback.clone());
        Self {
            comparators,
            fallback,
        }
    }

    /// Register a comparator under a case-insensitive name.
    pub fn register(&mut self, name: &str, comparator: Arc<dyn Comparator>) {
        self.comparators
            .insert(name.trim().to_lowercase(), comparator);
    }

    /// Resolve a comparator by name, substituting the default on a miss.
    pub fn resolve(&self, name: &str) -> Arc<dyn Comparator> {
        let key = name.trim().to_lowercase();
        if key.is_empty() {
            return self.fallback.clone();
        }
        match self.comparators.get(&key) {
            Some(comparator) => comparator.clone(),
            None => {
                warn!(
                    comparator = name,
                    "unknown comparator, substituting the default comparator"
                );
                self.fallback.clone()
            }
        }
    }
}

impl Default for ComparatorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
