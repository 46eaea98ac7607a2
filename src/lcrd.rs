//! # LCRD Filter
//!
//! Least-cost rule-derived pre-filters. Rules are grouped by the set of
//! attributes they touch; for each group, the attributes every rule compares
//! with plain equality form a cheap filter that any firing rule of the group
//! implies. A candidate whose values agree with the probe on no surviving
//! filter cannot fire any rule and is skipped before full evaluation.

use crate::comparator::eq_ignore_case;
use crate::model::{AttrId, AttrValues};
use crate::ontology::Rule;
use std::collections::{BTreeMap, BTreeSet};

/// Equality mode a filter attribute is checked with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FilterMode {
    Exact,
    IgnoreCase,
}

impl FilterMode {
    fn agrees(self, left: &str, right: &str) -> bool {
        match self {
            Self::Exact => left == right,
            Self::IgnoreCase => eq_ignore_case(left, right),
        }
    }

    /// Whether agreement under `other` implies agreement under `self`.
    fn at_least_as_loose_as(self, other: FilterMode) -> bool {
        self >= other
    }
}

/// One group filter: every attribute must agree for the group to be reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSet {
    /// Rules the filter stands in for
    pub rules: Vec<String>,
    pub attributes: BTreeMap<AttrId, FilterMode>,
}

impl FilterSet {
    /// Passing `other` implies passing `self`.
    fn implied_by(&self, other: &FilterSet) -> bool {
        self.attributes.iter().all(|(attr, mode)| {
            other
                .attributes
                .get(attr)
                .map(|theirs| mode.at_least_as_loose_as(*theirs))
                .unwrap_or(false)
        })
    }

    fn admits(&self, probe: &AttrValues, candidate: &AttrValues) -> bool {
        self.attributes.iter().all(|(attr, mode)| {
            match (probe.get(*attr), candidate.get(*attr)) {
                (Some(left), Some(right)) => left
                    .iter()
                    .any(|l| right.iter().any(|r| mode.agrees(l, r))),
                _ => false,
            }
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct LcrdFilter {
    filters: Vec<FilterSet>,
    /// Some group has no equality attribute, so nothing can be pruned
    unconstrained: bool,
    has_rules: bool,
    bypass: bool,
}

impl LcrdFilter {
    /// Derive the minimal filter list for an ordered rule set.
    pub fn build(rules: &[Rule]) -> Self {
        let mut groups: Vec<(BTreeSet<AttrId>, Vec<&Rule>)> = Vec::new();
        for rule in rules {
            let attributes = rule.attribute_set();
            match groups.iter_mut().find(|(set, _)| *set == attributes) {
                Some((_, members)) => members.push(rule),
                None => groups.push((attributes, vec![rule])),
            }
        }

        let mut candidates = Vec::with_capacity(groups.len());
        let mut unconstrained = false;
        for (attributes, members) in &groups {
            let mut filter = BTreeMap::new();
            for attr in attributes {
                if let Some(mode) = group_mode(members, *attr) {
                    filter.insert(*attr, mode);
                }
            }
            if filter.is_empty() {
                unconstrained = true;
            }
            candidates.push(FilterSet {
                rules: members.iter().map(|r| r.identifier.clone()).collect(),
                attributes: filter,
            });
        }

        let filters = if unconstrained {
            Vec::new()
        } else {
            minimize(candidates)
        };

        Self {
            filters,
            unconstrained,
            has_rules: !rules.is_empty(),
            bypass: false,
        }
    }

    pub fn with_bypass(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypass
    }

    pub fn filters(&self) -> &[FilterSet] {
        &self.filters
    }

    /// Whether a candidate may fire some rule against the probe.
    pub fn admits(&self, probe: &AttrValues, candidate: &AttrValues) -> bool {
        if self.bypass || self.unconstrained {
            return true;
        }
        if !self.has_rules {
            return false;
        }
        self.filters.iter().any(|f| f.admits(probe, candidate))
    }
}

/// Equality mode shared by every rule of a group for one attribute, if any.
fn group_mode(rules: &[&Rule], attr: AttrId) -> Option<FilterMode> {
    let mut loosest = FilterMode::Exact;
    for rule in rules {
        let mut codes = BTreeSet::new();
        for term in &rule.terms {
            if term.compare_to.contains(&attr) {
                return None;
            }
            if term.item != attr {
                continue;
            }
            if !term.compare_to.is_empty() {
                return None;
            }
            codes.insert(&term.code);
        }
        if codes.len() != 1 {
            return None;
        }
        let code = codes.into_iter().next()?;
        let mode = if code.is_exact() {
            FilterMode::Exact
        } else if code.is_exact_ignore_case() {
            FilterMode::IgnoreCase
        } else {
            return None;
        };
        loosest = loosest.max(mode);
    }
    Some(loosest)
}

/// Drop every filter implied by another; identical filters keep the first.
fn minimize(candidates: Vec<FilterSet>) -> Vec<FilterSet> {
    let redundant: Vec<bool> = (0..candidates.len())
        .map(|i| {
            candidates.iter().enumerate().any(|(j, other)| {
                if i == j || !other.implied_by(&candidates[i]) {
                    return false;
                }
                j < i || !candidates[i].implied_by(other)
            })
        })
        .collect();

    let mut kept: Vec<FilterSet> = Vec::new();
    for (i, filter) in candidates.into_iter().enumerate() {
        if !redundant[i] {
            kept.push(filter);
        }
    }
    kept
}
