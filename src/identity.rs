//! # Identifier Generation
//!
//! Deterministic, content-derived cluster identifiers. Non-pass-through
//! values are normalized and fed to a digest in attribute declaration order;
//! each digest byte maps onto a 36 character alphabet.

use crate::model::{AttrValues, ClusterId};
use crate::ontology::Ontology;
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Output alphabet; digest bytes map by `byte % 36`.
pub const ID_ALPHABET: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
/// Mixed in ahead of the values for ids of merged clusters.
const DERIVED_TOKEN: &[u8] = b"\x02DERIVED\x03";
const VALUE_SEPARATOR: u8 = 0x1e;
const ATTRIBUTE_SEPARATOR: u8 = 0x1f;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[serde(rename = "MD5", alias = "md5")]
    Md5,
    #[serde(rename = "SHA-1", alias = "sha1", alias = "SHA1", alias = "sha-1")]
    Sha1,
    #[default]
    #[serde(rename = "SHA-256", alias = "sha256", alias = "SHA256", alias = "sha-256")]
    Sha256,
    #[serde(rename = "SHA-384", alias = "sha384", alias = "SHA384", alias = "sha-384")]
    Sha384,
    #[serde(rename = "SHA-512", alias = "sha512", alias = "SHA512", alias = "sha-512")]
    Sha512,
}

impl HashAlgorithm {
    pub fn digest_len(self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    fn digest(self, payload: &[u8]) -> Vec<u8> {
        match self {
            Self::Md5 => Md5::digest(payload).to_vec(),
            Self::Sha1 => Sha1::digest(payload).to_vec(),
            Self::Sha256 => Sha256::digest(payload).to_vec(),
            Self::Sha384 => Sha384::digest(payload).to_vec(),
            Self::Sha512 => Sha512::digest(payload).to_vec(),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Md5 => "MD5",
            Self::Sha1 => "SHA-1",
            Self::Sha256 => "SHA-256",
            Self::Sha384 => "SHA-384",
            Self::Sha512 => "SHA-512",
        };
        f.write_str(name)
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        match normalized.as_str() {
            "MD5" => Ok(Self::Md5),
            "SHA1" => Ok(Self::Sha1),
            "SHA256" => Ok(Self::Sha256),
            "SHA384" => Ok(Self::Sha384),
            "SHA512" => Ok(Self::Sha512),
            _ => Err(format!("unknown id hash algorithm '{s}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdGenerator {
    algorithm: HashAlgorithm,
}

impl IdGenerator {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn id_length(&self) -> usize {
        self.algorithm.digest_len()
    }

    /// Returned for a missing record; the alphabet's last character repeated.
    pub fn sentinel(&self) -> ClusterId {
        let last = ID_ALPHABET[ID_ALPHABET.len() - 1] as char;
        ClusterId(std::iter::repeat(last).take(self.id_length()).collect())
    }

    /// Id of a record's content. `derived` marks ids of merged clusters.
    pub fn compute_id(&self, ontology: &Ontology, values: Option<&AttrValues>, derived: bool) -> ClusterId {
        self.compute_salted(ontology, values, derived, 0)
    }

    /// Like [`compute_id`](Self::compute_id), with a salt for resolving clashes.
    /// Salt 0 is identical to the unsalted id.
    pub fn compute_salted(
        &self,
        ontology: &Ontology,
        values: Option<&AttrValues>,
        derived: bool,
        salt: u32,
    ) -> ClusterId {
        let Some(values) = values else {
            return self.sentinel();
        };

        let mut payload = Vec::with_capacity(128);
        if derived {
            payload.extend_from_slice(DERIVED_TOKEN);
            payload.push(ATTRIBUTE_SEPARATOR);
        }
        for attribute in ontology.attributes() {
            if attribute.pass_through {
                continue;
            }
            if let Some(set) = values.get(attribute.id) {
                let normalized: BTreeSet<String> =
                    set.iter().map(|v| v.trim().to_uppercase()).collect();
                for value in normalized {
                    payload.extend_from_slice(value.as_bytes());
                    payload.push(VALUE_SEPARATOR);
                }
            }
            payload.push(ATTRIBUTE_SEPARATOR);
        }
        if salt > 0 {
            payload.extend_from_slice(format!("#{salt}").as_bytes());
        }

        let id = self
            .algorithm
            .digest(&payload)
            .into_iter()
            .map(|byte| ID_ALPHABET[(byte % 36) as usize] as char)
            .collect();
        ClusterId(id)
    }
}
