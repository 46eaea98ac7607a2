//! # Ontology Module
//!
//! Declares the attributes, identity rules and index rules that drive entity
//! resolution. An [`OntologySpec`] is the raw, serde-friendly form loaded from
//! configuration; [`Ontology::validate`] turns it into the immutable,
//! reference-checked form every other component borrows.

use crate::comparator::{Comparator, ComparatorRegistry, MatchCode, DEFAULT_COMPARATOR};
use crate::error::{LinkError, ValidationError};
use crate::index::ScanSpec;
use crate::model::{AttrId, AttrValues, Reference, RefId, ResolvedReference};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Attributes not referenced by any identity rule, by declared name.
pub type PassThroughSet = BTreeSet<String>;

fn default_algorithm() -> String {
    DEFAULT_COMPARATOR.to_string()
}

/// Declared attribute and the comparator bound to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSpec {
    pub name: String,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTermSpec {
    pub item: String,
    #[serde(default, alias = "compareTo", skip_serializing_if = "Vec::is_empty")]
    pub compare_to: Vec<String>,
    #[serde(alias = "matchResult")]
    pub match_result: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    #[serde(alias = "ruleIdentifier")]
    pub identifier: String,
    pub terms: Vec<RuleTermSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSegmentSpec {
    pub item: String,
    /// `Scan(direction, class, length, case, order)` or a comparator match code
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRuleSpec {
    #[serde(alias = "ruleIdentifier")]
    pub identifier: String,
    pub segments: Vec<IndexSegmentSpec>,
}

/// Unvalidated ontology as loaded from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OntologySpec {
    pub attributes: Vec<AttributeSpec>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
    #[serde(default, alias = "indexRules")]
    pub index_rules: Vec<IndexRuleSpec>,
}

impl OntologySpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attribute(mut self, name: &str, algorithm: &str) -> Self {
        self.attributes.push(AttributeSpec {
            name: name.to_string(),
            algorithm: algorithm.to_string(),
        });
        self
    }

    /// Add a rule from `(item, match_result)` pairs.
    pub fn rule(mut self, identifier: &str, terms: &[(&str, &str)]) -> Self {
        self.rules.push(RuleSpec {
            identifier: identifier.to_string(),
            terms: terms
                .iter()
                .map(|(item, code)| RuleTermSpec {
                    item: item.to_string(),
                    compare_to: Vec::new(),
                    match_result: code.to_string(),
                })
                .collect(),
        });
        self
    }

    pub fn rule_with_terms(mut self, identifier: &str, terms: Vec<RuleTermSpec>) -> Self {
        self.rules.push(RuleSpec {
            identifier: identifier.to_string(),
            terms,
        });
        self
    }

    /// Add an index rule from `(item, hash)` pairs.
    pub fn index_rule(mut self, identifier: &str, segments: &[(&str, &str)]) -> Self {
        self.index_rules.push(IndexRuleSpec {
            identifier: identifier.to_string(),
            segments: segments
                .iter()
                .map(|(item, hash)| IndexSegmentSpec {
                    item: item.to_string(),
                    hash: hash.to_string(),
                })
                .collect(),
        });
        self
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Check referential integrity of rules against attributes.
///
/// Returns the attributes no rule references. Attribute names and rule
/// identifiers must be unique, ignoring case.
pub fn pass_through_set(
    attributes: &[AttributeSpec],
    rules: &[RuleSpec],
) -> Result<PassThroughSet, ValidationError> {
    let mut declared: HashMap<String, &str> = HashMap::new();
    for attribute in attributes {
        let key = attribute.name.trim().to_lowercase();
        if declared.insert(key, attribute.name.as_str()).is_some() {
            return Err(ValidationError::DuplicateAttribute(attribute.name.clone()));
        }
    }

    let mut identifiers = HashSet::new();
    let mut referenced = HashSet::new();
    for rule in rules {
        if !identifiers.insert(rule.identifier.trim().to_lowercase()) {
            return Err(ValidationError::DuplicateRule(rule.identifier.clone()));
        }
        for term in &rule.terms {
            for name in std::iter::once(&term.item).chain(term.compare_to.iter()) {
                let key = name.trim().to_lowercase();
                if !declared.contains_key(&key) {
                    return Err(ValidationError::UndeclaredAttribute {
                        rule: rule.identifier.clone(),
                        attribute: name.clone(),
                    });
                }
                referenced.insert(key);
            }
        }
    }

    Ok(attributes
        .iter()
        .filter(|a| !referenced.contains(&a.name.trim().to_lowercase()))
        .map(|a| a.name.clone())
        .collect())
}

/// A validated attribute with its resolved comparator.
#[derive(Debug, Clone)]
pub struct Attribute {
    pub id: AttrId,
    pub name: String,
    pub algorithm: String,
    pub pass_through: bool,
    comparator: Arc<dyn Comparator>,
}

impl Attribute {
    pub fn comparator(&self) -> &dyn Comparator {
        self.comparator.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleTerm {
    pub item: AttrId,
    pub compare_to: Vec<AttrId>,
    pub code: MatchCode,
}

/// An identity rule: all terms must pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub identifier: String,
    pub terms: Vec<RuleTerm>,
}

impl Rule {
    /// Every attribute the rule touches, items and compare-to targets alike.
    pub fn attribute_set(&self) -> BTreeSet<AttrId> {
        self.terms
            .iter()
            .flat_map(|t| std::iter::once(t.item).chain(t.compare_to.iter().copied()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentTransform {
    Scan(ScanSpec),
    /// Token produced by the attribute's comparator for this match code
    Token(MatchCode),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSegment {
    pub item: AttrId,
    pub transform: SegmentTransform,
}

/// A blocking rule: its segments concatenate into one index key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRule {
    pub identifier: String,
    pub segments: Vec<IndexSegment>,
}

/// The validated, immutable ontology.
#[derive(Debug, Clone)]
pub struct Ontology {
    attributes: Vec<Attribute>,
    by_name: HashMap<String, AttrId>,
    rules: Vec<Rule>,
    index_rules: Vec<IndexRule>,
    pass_through: BTreeSet<AttrId>,
}

impl Ontology {
    /// Validate a spec, resolving comparators through the registry.
    pub fn validate(
        spec: &OntologySpec,
        registry: &ComparatorRegistry,
    ) -> Result<Self, ValidationError> {
        let pass_through_names = pass_through_set(&spec.attributes, &spec.rules)?;

        let mut attributes = Vec::with_capacity(spec.attributes.len());
        let mut by_name = HashMap::new();
        for (position, attribute) in spec.attributes.iter().enumerate() {
            let id = AttrId(position as u32);
            by_name.insert(attribute.name.trim().to_lowercase(), id);
            attributes.push(Attribute {
                id,
                name: attribute.name.trim().to_string(),
                algorithm: attribute.algorithm.clone(),
                pass_through: pass_through_names.contains(&attribute.name),
                comparator: registry.resolve(&attribute.algorithm),
            });
        }

        let lookup = |owner: &str, name: &str| -> Result<AttrId, ValidationError> {
            by_name
                .get(&name.trim().to_lowercase())
                .copied()
                .ok_or_else(|| ValidationError::UndeclaredAttribute {
                    rule: owner.to_string(),
                    attribute: name.to_string(),
                })
        };

        let mut rules = Vec::with_capacity(spec.rules.len());
        for rule in &spec.rules {
            if rule.terms.is_empty() {
                return Err(ValidationError::EmptyRule(rule.identifier.clone()));
            }
            let mut terms = Vec::with_capacity(rule.terms.len());
            for term in &rule.terms {
                let item = lookup(&rule.identifier, &term.item)?;
                let compare_to = term
                    .compare_to
                    .iter()
                    .map(|name| lookup(&rule.identifier, name))
                    .collect::<Result<Vec<_>, _>>()?;
                let code = MatchCode::parse(&term.match_result)?;
                let attribute = &attributes[item.0 as usize];
                if !attribute.comparator().supports(&code) {
                    return Err(ValidationError::UnsupportedMatchCode {
                        rule: rule.identifier.clone(),
                        attribute: attribute.name.clone(),
                        comparator: attribute.comparator().name().to_string(),
                        code: term.match_result.clone(),
                    });
                }
                terms.push(RuleTerm {
                    item,
                    compare_to,
                    code,
                });
            }
            rules.push(Rule {
                identifier: rule.identifier.clone(),
                terms,
            });
        }

        let mut index_identifiers = HashSet::new();
        let mut index_rules = Vec::with_capacity(spec.index_rules.len());
        for index_rule in &spec.index_rules {
            if !index_identifiers.insert(index_rule.identifier.trim().to_lowercase()) {
                return Err(ValidationError::DuplicateIndexRule(
                    index_rule.identifier.clone(),
                ));
            }
            if index_rule.segments.is_empty() {
                return Err(ValidationError::EmptyIndexRule(index_rule.identifier.clone()));
            }
            let mut segments = Vec::with_capacity(index_rule.segments.len());
            for segment in &index_rule.segments {
                let item = lookup(&index_rule.identifier, &segment.item)?;
                let code = MatchCode::parse(&segment.hash)?;
                let transform = if code.operation() == "SCAN" {
                    SegmentTransform::Scan(ScanSpec::from_match_code(&code).map_err(
                        |reason| ValidationError::InvalidScan {
                            rule: index_rule.identifier.clone(),
                            spec: segment.hash.clone(),
                            reason,
                        },
                    )?)
                } else {
                    let attribute = &attributes[item.0 as usize];
                    if !attribute.comparator().supports(&code) {
                        return Err(ValidationError::UnsupportedMatchCode {
                            rule: index_rule.identifier.clone(),
                            attribute: attribute.name.clone(),
                            comparator: attribute.comparator().name().to_string(),
                            code: segment.hash.clone(),
                        });
                    }
                    SegmentTransform::Token(code)
                };
                segments.push(IndexSegment { item, transform });
            }
            index_rules.push(IndexRule {
                identifier: index_rule.identifier.clone(),
                segments,
            });
        }

        let pass_through = attributes
            .iter()
            .filter(|a| a.pass_through)
            .map(|a| a.id)
            .collect();

        Ok(Self {
            attributes,
            by_name,
            rules,
            index_rules,
            pass_through,
        })
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute(&self, id: AttrId) -> &Attribute {
        &self.attributes[id.0 as usize]
    }

    /// Case-insensitive attribute lookup.
    pub fn attribute_id(&self, name: &str) -> Option<AttrId> {
        self.by_name.get(&name.trim().to_lowercase()).copied()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn index_rules(&self) -> &[IndexRule] {
        &self.index_rules
    }

    pub fn pass_through(&self) -> &BTreeSet<AttrId> {
        &self.pass_through
    }

    pub fn is_pass_through(&self, id: AttrId) -> bool {
        self.pass_through.contains(&id)
    }

    /// Resolve attribute names of a raw reference.
    ///
    /// Values are trimmed and blank values dropped. A name that is not a
    /// declared attribute makes the reference malformed.
    pub fn resolve_reference(
        &self,
        reference: &Reference,
        sequence: u64,
    ) -> Result<ResolvedReference, LinkError> {
        let id = reference
            .id
            .as_ref()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| sequence.to_string());
        let ref_id = RefId::new(reference.source.trim(), id);

        let mut values = AttrValues::new();
        for (name, value) in &reference.values {
            let attr = self
                .attribute_id(name)
                .ok_or_else(|| LinkError::MalformedReference {
                    reference: ref_id.to_string(),
                    reason: format!("undeclared attribute '{name}'"),
                })?;
            let value = value.trim();
            if !value.is_empty() {
                values.insert(attr, value);
            }
        }

        Ok(ResolvedReference {
            ref_id,
            values,
            assertion: reference.assertion.clone(),
        })
    }
}
