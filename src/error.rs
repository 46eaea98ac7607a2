//! Error types shared across the crate.
//!
//! Configuration problems surface as [`ValidationError`] before any reference
//! is read. Per-run failures surface as [`LinkError`]; storage plumbing
//! returns `anyhow::Result` and is wrapped into [`LinkError::Storage`].

use thiserror::Error;

/// Fatal configuration errors detected while validating an ontology.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("attribute '{0}' is declared more than once")]
    DuplicateAttribute(String),

    #[error("rule '{rule}' references undeclared attribute '{attribute}'")]
    UndeclaredAttribute { rule: String, attribute: String },

    #[error("duplicate rule identifier '{0}'")]
    DuplicateRule(String),

    #[error("duplicate index rule identifier '{0}'")]
    DuplicateIndexRule(String),

    #[error("rule '{0}' has no terms")]
    EmptyRule(String),

    #[error("index rule '{0}' has no segments")]
    EmptyIndexRule(String),

    #[error("malformed match code '{0}'")]
    MalformedMatchCode(String),

    #[error("index rule '{rule}': invalid scan '{spec}': {reason}")]
    InvalidScan {
        rule: String,
        spec: String,
        reason: String,
    },

    #[error(
        "rule '{rule}': match code '{code}' is not supported by comparator '{comparator}' of attribute '{attribute}'"
    )]
    UnsupportedMatchCode {
        rule: String,
        attribute: String,
        comparator: String,
        code: String,
    },
}

/// Errors raised by reference sources.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("malformed record at position {position}: {reason}")]
    Malformed { position: usize, reason: String },

    #[error("failed to read reference source: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while processing a run.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("malformed reference {reference}: {reason}")]
    MalformedReference { reference: String, reason: String },

    #[error("assertion failed for reference {reference}: {reason}")]
    AssertionFailed { reference: String, reason: String },

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("repository failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl LinkError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) => 2,
            Self::AssertionFailed { .. } => 3,
            Self::Storage(_) => 4,
            Self::Source(_) | Self::MalformedReference { .. } => 5,
        }
    }

    /// Whether the run can continue with the next reference.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MalformedReference { .. } | Self::Source(SourceError::Malformed { .. })
        )
    }
}
