//! Unified configuration for linkrust runs.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (linkrust.toml)
//! ```toml
//! ontology = "people.ontology.json"
//! input = "people.jsonl"
//! output = "events.jsonl"
//!
//! [run]
//! mode = "identity-capture"
//! window_size = 50000
//! id_hash = "SHA-256"
//!
//! [repository]
//! data_dir = "/var/lib/linkrust"
//! ```

mod defaults;

pub use defaults::*;

use crate::identity::HashAlgorithm;
use crate::linker::LinkerSettings;
use crate::ontology::OntologySpec;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Main configuration of a linkrust run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkrustConfig {
    pub run: RunSettings,
    pub repository: RepositoryConfig,
    /// Path to the ontology (JSON)
    pub ontology: Option<PathBuf>,
    /// JSON-lines reference input; stdin when unset
    pub input: Option<PathBuf>,
    /// JSON-lines event output; stdout when unset
    pub output: Option<PathBuf>,
}

impl LinkrustConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    pub fn load(
        config_path: Option<&Path>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(LinkrustConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split(ENV_NESTING_SEPARATOR));

        figment = figment.merge(Serialized::defaults(overrides));

        figment.extract().map_err(ConfigError::from)
    }

    pub fn from_env(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }
}

/// How references are processed against the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Cluster the input from scratch
    #[default]
    #[serde(alias = "MergePurge")]
    MergePurge,
    /// Link references across sources
    #[serde(alias = "RecordLinkage")]
    RecordLinkage,
    /// Cluster the input into a persistent repository
    #[serde(alias = "IdentityCapture")]
    IdentityCapture,
    /// Look up identities without changing the repository
    #[serde(alias = "IdentityResolve")]
    IdentityResolve,
    /// Extend an existing repository
    #[serde(alias = "IdentityUpdate")]
    IdentityUpdate,
    #[serde(alias = "AssertRefToRef")]
    AssertRefToRef,
    #[serde(alias = "AssertRefToStr")]
    AssertRefToStr,
    #[serde(alias = "AssertStrToStr")]
    AssertStrToStr,
    #[serde(alias = "AssertSplitStr")]
    AssertSplitStr,
}

impl RunMode {
    pub fn mutates_repository(self) -> bool {
        self != RunMode::IdentityResolve
    }

    pub fn is_assertion(self) -> bool {
        self.required_assertion().is_some()
    }

    /// Assertion kind every reference must carry in this mode.
    pub fn required_assertion(self) -> Option<&'static str> {
        match self {
            RunMode::AssertRefToRef => Some("same_entity"),
            RunMode::AssertRefToStr => Some("identity"),
            RunMode::AssertStrToStr => Some("merge_identities"),
            RunMode::AssertSplitStr => Some("split"),
            _ => None,
        }
    }
}

impl FromStr for RunMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        let mode = match normalized.as_str() {
            "mergepurge" => RunMode::MergePurge,
            "recordlinkage" => RunMode::RecordLinkage,
            "identitycapture" => RunMode::IdentityCapture,
            "identityresolve" => RunMode::IdentityResolve,
            "identityupdate" => RunMode::IdentityUpdate,
            "assertreftoref" => RunMode::AssertRefToRef,
            "assertreftostr" => RunMode::AssertRefToStr,
            "assertstrtostr" => RunMode::AssertStrToStr,
            "assertsplitstr" => RunMode::AssertSplitStr,
            _ => {
                return Err(ConfigError {
                    message: format!("unknown run mode '{s}'"),
                })
            }
        };
        Ok(mode)
    }
}

/// Run behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub mode: RunMode,
    /// Skip LCRD pre-filtering
    pub bypass_filter: bool,
    /// Only the N most recently touched clusters are merge candidates
    pub window_size: Option<usize>,
    pub id_hash: HashAlgorithm,
    /// Record every rule that fires, not just the first
    pub complete_firing: bool,
    /// Stop after this many references
    pub max_references: Option<u64>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            mode: RunMode::default(),
            bypass_filter: DEFAULT_BYPASS_FILTER,
            window_size: None,
            id_hash: DEFAULT_ID_HASH.parse().unwrap_or_default(),
            complete_firing: DEFAULT_COMPLETE_FIRING,
            max_references: None,
        }
    }
}

impl RunSettings {
    pub fn linker_settings(&self) -> LinkerSettings {
        LinkerSettings {
            bypass_filter: self.bypass_filter,
            window_size: self.window_size.filter(|size| *size > 0),
            id_hash: self.id_hash,
            complete_firing: self.complete_firing,
        }
    }
}

/// Persistent identity repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// RocksDB directory; the repository is in memory when unset
    pub data_dir: Option<PathBuf>,
    pub repair: bool,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            repair: DEFAULT_REPAIR,
        }
    }
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<RepositoryOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ontology: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<RunMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bypass_filter: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_references: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair: Option<bool>,
}

/// Read a JSON ontology from disk.
pub fn load_ontology(path: &Path) -> Result<OntologySpec, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError {
        message: format!("failed to read ontology {}: {e}", path.display()),
    })?;
    serde_json::from_str(&raw).map_err(|e| ConfigError {
        message: format!("invalid ontology {}: {e}", path.display()),
    })
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}
