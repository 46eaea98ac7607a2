use std::collections::BTreeSet;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::comparator::{eq_ignore_case, Comparator, ComparatorRegistry, MatchCode};
use crate::model::{RefId, Reference};
use crate::ontology::{Ontology, OntologySpec};
use crate::Linkrust;

/// Matches values sharing their first `n` characters, ignoring case.
/// Match code `Prefix(n)`, three characters when no argument is given.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefixComparator;

impl Comparator for PrefixComparator {
    fn name(&self) -> &str {
        "prefix"
    }

    fn supported_match_codes(&self) -> &[&'static str] {
        &["PREFIX"]
    }

    fn evaluate(&self, left: &str, right: &str, code: &MatchCode, _compare_to: &[&str]) -> bool {
        if code.is_exact() {
            return left == right;
        }
        if code.is_exact_ignore_case() {
            return eq_ignore_case(left, right);
        }
        let n = code.int_arg(0).unwrap_or(3);
        let left: String = left.chars().take(n).collect();
        let right: String = right.chars().take(n).collect();
        !left.is_empty() && eq_ignore_case(&left, &right)
    }
}

pub fn test_registry() -> ComparatorRegistry {
    let mut registry = ComparatorRegistry::with_defaults();
    registry.register("prefix", Arc::new(PrefixComparator));
    registry
}

pub fn person_spec() -> OntologySpec {
    OntologySpec::new()
        .attribute("first_name", "prefix")
        .attribute("last_name", "default")
        .attribute("ssn", "default")
        .attribute("dob", "default")
        .attribute("phone", "default")
        .rule(
            "name",
            &[("last_name", "Exact"), ("first_name", "Exact-Ignore-Case")],
        )
        .rule("ssn_dob", &[("ssn", "Exact"), ("dob", "Exact")])
        .rule(
            "name_prefix",
            &[("last_name", "Exact"), ("first_name", "Prefix(3)")],
        )
        .index_rule(
            "last",
            &[("last_name", "Scan(LR, LETTER, 5, ToUpper, SameOrder)")],
        )
        .index_rule("ssn", &[("ssn", "Scan(LR, DIGIT, 9, KeepCase, SameOrder)")])
}

/// Person ontology: names, ssn/dob and a pass-through phone.
pub fn person_ontology() -> Ontology {
    Ontology::validate(&person_spec(), &test_registry()).expect("valid person ontology")
}

const FIRST_NAMES: [&str; 8] = ["John", "Jane", "Maria", "Ahmed", "Wei", "Olga", "Pedro", "Aiko"];
const LAST_NAMES: [&str; 8] = [
    "Smith", "Garcia", "Nguyen", "Okafor", "Kowalski", "Tanaka", "Haddad", "Larsen",
];
const SOURCES: [&str; 4] = ["crm", "erp", "web", "billing"];

/// Generated references with the entity each one was drawn from.
#[derive(Debug, Clone)]
pub struct GeneratedReferences {
    pub references: Vec<Reference>,
    pub entities: Vec<usize>,
}

/// Seeded person references. With `duplicate_probability` a reference
/// re-describes an earlier entity: same last name and ssn/dob, first name
/// with its case changed.
pub fn generate_references(count: usize, duplicate_probability: f64, seed: u64) -> GeneratedReferences {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut references = Vec::with_capacity(count);
    let mut entities = Vec::with_capacity(count);
    let mut distinct = 0usize;

    for i in 0..count {
        let source = SOURCES[rng.random_range(0..SOURCES.len())];
        let entity = if distinct > 0 && rng.random_bool(duplicate_probability) {
            rng.random_range(0..distinct)
        } else {
            distinct += 1;
            distinct - 1
        };

        let first = FIRST_NAMES[entity % FIRST_NAMES.len()];
        let first = if rng.random_bool(0.5) {
            first.to_uppercase()
        } else {
            first.to_string()
        };
        let mut reference = Reference::new(source)
            .with_id(format!("{i:06}"))
            .with_value("first_name", first)
            .with_value("last_name", format!("{}{entity}", LAST_NAMES[entity % LAST_NAMES.len()]))
            .with_value("ssn", format!("{:09}", 100_000_000 + entity))
            .with_value("dob", format!("19{:02}-01-01", 40 + entity % 60));
        if rng.random_bool(0.3) {
            reference = reference.with_value("phone", format!("555-{:04}", rng.random_range(1000..9999)));
        }

        references.push(reference);
        entities.push(entity);
    }

    GeneratedReferences {
        references,
        entities,
    }
}

/// Seeded references where each entity is only connected through chains.
///
/// Per entity: a name-only reference, a reference carrying only ssn/dob under
/// a different name, and a bridge carrying both. Every other entity also gets
/// a nickname reference that matches by first-name prefix alone. No rule
/// links the name-only and ssn-only references directly, so they meet only
/// through the bridge, in whatever order the references arrive.
pub fn generate_chained_references(entity_count: usize, seed: u64) -> GeneratedReferences {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut references = Vec::new();
    let mut entities = Vec::new();

    for entity in 0..entity_count {
        let first = FIRST_NAMES[entity % FIRST_NAMES.len()];
        let last = format!("{}{entity}", LAST_NAMES[entity % LAST_NAMES.len()]);
        let alias_first = FIRST_NAMES[(entity + 1) % FIRST_NAMES.len()];
        let alias_last = format!("{}{entity}", LAST_NAMES[(entity + 3) % LAST_NAMES.len()]);
        let ssn = format!("{:09}", 200_000_000 + entity);
        let dob = format!("19{:02}-06-15", 40 + entity % 60);
        let first = if rng.random_bool(0.5) {
            first.to_uppercase()
        } else {
            first.to_string()
        };

        let mut described = vec![
            Reference::new("crm")
                .with_value("first_name", first.clone())
                .with_value("last_name", last.clone()),
            Reference::new("billing")
                .with_value("first_name", alias_first)
                .with_value("last_name", alias_last)
                .with_value("ssn", ssn.clone())
                .with_value("dob", dob.clone()),
            Reference::new("erp")
                .with_value("first_name", first.to_lowercase())
                .with_value("last_name", last.clone())
                .with_value("ssn", ssn)
                .with_value("dob", dob),
        ];
        if entity % 2 == 0 {
            described.push(
                Reference::new("web")
                    .with_value("first_name", format!("{first}ito"))
                    .with_value("last_name", last),
            );
        }

        for reference in described {
            let id = format!("{:06}", references.len());
            references.push(reference.with_id(id));
            entities.push(entity);
        }
    }

    GeneratedReferences {
        references,
        entities,
    }
}

/// Clusters of a repository as sets of member references.
pub fn partition(repo: &Linkrust) -> BTreeSet<BTreeSet<RefId>> {
    repo.clusters()
        .into_iter()
        .map(|cluster| {
            cluster
                .members
                .iter()
                .map(|member| member.ref_id.clone())
                .collect()
        })
        .collect()
}
