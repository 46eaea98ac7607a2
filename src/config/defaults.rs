//! Default constants for linkrust configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Run Defaults
// =============================================================================

/// LCRD pre-filtering is on unless explicitly bypassed
pub const DEFAULT_BYPASS_FILTER: bool = false;

/// Record only the first firing rule per comparison
pub const DEFAULT_COMPLETE_FIRING: bool = false;

/// Default id digest
/// Any of MD5, SHA-1, SHA-256, SHA-384, SHA-512. Id length equals the digest length.
pub const DEFAULT_ID_HASH: &str = "SHA-256";

// =============================================================================
// Repository Defaults (RocksDB)
// =============================================================================

/// Run RocksDB repair before opening the repository
pub const DEFAULT_REPAIR: bool = false;

// =============================================================================
// Environment
// =============================================================================

/// Prefix of environment variables read by the configuration loader
pub const ENV_PREFIX: &str = "LINKRUST_";

/// Separator between nested keys in environment variable names,
/// e.g. `LINKRUST_RUN__MODE=identity-capture`
pub const ENV_NESTING_SEPARATOR: &str = "__";
