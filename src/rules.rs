//! # Rule Evaluation
//!
//! Evaluates identity rules between a probe and a candidate value set. Rules
//! are tried in declaration order and the first one whose terms all pass
//! wins. With complete firing enabled every passing rule is collected too.

use crate::comparator::{eq_ignore_case, Comparator, MatchCode};
use crate::model::AttrValues;
use crate::ontology::{Ontology, Rule, RuleTerm};
use std::collections::BTreeSet;

/// Outcome of evaluating one probe/candidate pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evaluation<'o> {
    /// Identifier of the first rule that fired
    pub fired: Option<&'o str>,
    /// Every rule that fired, when complete firing is enabled
    pub complete: Vec<&'o str>,
}

impl Evaluation<'_> {
    pub fn is_match(&self) -> bool {
        self.fired.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RuleEngine {
    complete_firing: bool,
}

impl RuleEngine {
    pub fn new(complete_firing: bool) -> Self {
        Self { complete_firing }
    }

    pub fn complete_firing(&self) -> bool {
        self.complete_firing
    }

    pub fn evaluate<'o>(
        &self,
        ontology: &'o Ontology,
        probe: &AttrValues,
        candidate: &AttrValues,
    ) -> Evaluation<'o> {
        let mut evaluation = Evaluation::default();
        for rule in ontology.rules() {
            if !rule_passes(ontology, rule, probe, candidate) {
                continue;
            }
            if evaluation.fired.is_none() {
                evaluation.fired = Some(rule.identifier.as_str());
                if !self.complete_firing {
                    break;
                }
            }
            evaluation.complete.push(rule.identifier.as_str());
        }
        evaluation
    }
}

/// All terms of a rule pass.
pub fn rule_passes(ontology: &Ontology, rule: &Rule, probe: &AttrValues, candidate: &AttrValues) -> bool {
    rule.terms
        .iter()
        .all(|term| term_passes(ontology, term, probe, candidate))
}

fn term_passes(ontology: &Ontology, term: &RuleTerm, probe: &AttrValues, candidate: &AttrValues) -> bool {
    let comparator = ontology.attribute(term.item).comparator();

    if term.compare_to.is_empty() {
        return match (probe.get(term.item), candidate.get(term.item)) {
            (Some(left), Some(right)) => any_pair(comparator, &term.code, left, right, &[]),
            _ => false,
        };
    }

    // cross-attribute terms are checked in both directions
    term.compare_to.iter().any(|target| {
        let forward = match (probe.get(term.item), candidate.get(*target)) {
            (Some(left), Some(right)) => {
                let context = context_values(candidate, term);
                any_pair(comparator, &term.code, left, right, &context)
            }
            _ => false,
        };
        forward
            || match (candidate.get(term.item), probe.get(*target)) {
                (Some(left), Some(right)) => {
                    let context = context_values(probe, term);
                    any_pair(comparator, &term.code, left, right, &context)
                }
                _ => false,
            }
    })
}

/// Values of the compare-to attributes on the side supplying the right operand.
fn context_values<'v>(values: &'v AttrValues, term: &RuleTerm) -> Vec<&'v str> {
    term.compare_to
        .iter()
        .filter_map(|attr| values.get(*attr))
        .flat_map(|set| set.iter().map(String::as_str))
        .collect()
}

fn any_pair(
    comparator: &dyn Comparator,
    code: &MatchCode,
    left: &BTreeSet<String>,
    right: &BTreeSet<String>,
    context: &[&str],
) -> bool {
    left.iter().any(|l| {
        right.iter().any(|r| {
            if code.is_exact() {
                l == r
            } else if code.is_exact_ignore_case() {
                eq_ignore_case(l, r)
            } else {
                comparator.evaluate(l, r, code, context)
            }
        })
    })
}
