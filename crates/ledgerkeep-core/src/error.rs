//! Error taxonomy for the ledger core.
//!
//! Four families matter to callers:
//!
//! - [`ValidationError`]: malformed or incomplete key inputs. Never retryable.
//! - [`LedgerError::TransientStore`]: a single store call failed for
//!   availability reasons. Retryable with backoff.
//! - [`LedgerError::ChainIntegrity`]: produced only by chain verification.
//!   Signals tampering or a canonicalization bug; treat as security-relevant.
//! - [`LedgerError::MigrationRecord`]: a per-record migration failure. Captured
//!   inside a batch, never aborts it.
//!
//! Frontends work in `std::io::Result` like the rest of the workspace; the
//! `From<LedgerError> for io::Error` impl keeps the distinction visible through
//! `io::ErrorKind`.

use std::io;

use thiserror::Error;

/// Result alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Input that cannot be turned into a valid partition key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ValidationError {
    /// One or more identity fields are missing or unparseable.
    #[error("{}", describe_fields(.missing, .invalid))]
    Fields {
        /// Names of required fields that were absent or empty.
        missing: Vec<&'static str>,
        /// Names of fields that were present but failed to parse, with the reason.
        invalid: Vec<(&'static str, String)>,
    },

    /// A key's component count does not match the container's policy.
    #[error(
        "partition key has {actual} component(s) but policy '{policy}' requires {expected} ({paths})"
    )]
    KeyArity {
        policy: &'static str,
        expected: usize,
        actual: usize,
        paths: String,
    },

    /// A container was redeclared with a different partitioning policy.
    #[error("container '{container}' is declared as '{declared}', not '{requested}'")]
    PolicyConflict {
        container: String,
        declared: &'static str,
        requested: &'static str,
    },

    /// The policy cannot be derived from identity fields.
    #[error("policy '{0}' is not derivable from identity fields")]
    NotDerivable(&'static str),
}

fn describe_fields(missing: &[&'static str], invalid: &[(&'static str, String)]) -> String {
    let mut parts = Vec::new();
    if !missing.is_empty() {
        parts.push(format!("missing required field(s): {}", missing.join(", ")));
    }
    if !invalid.is_empty() {
        let detail: Vec<String> = invalid
            .iter()
            .map(|(field, reason)| format!("{field} ({reason})"))
            .collect();
        parts.push(format!("invalid field(s): {}", detail.join(", ")));
    }
    parts.join("; ")
}

impl ValidationError {
    /// Names of every field this error complains about, missing first.
    pub fn field_names(&self) -> Vec<&'static str> {
        match self {
            ValidationError::Fields { missing, invalid } => missing
                .iter()
                .copied()
                .chain(invalid.iter().map(|(name, _)| *name))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Failures reported by a [`PartitionedStore`](crate::store::PartitionedStore).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("item '{id}' not found in container '{container}'")]
    NotFound { container: String, id: String },

    /// Strict create hit an existing `(key, id)`.
    #[error("item '{id}' already exists in container '{container}'")]
    Conflict { container: String, id: String },

    /// Conditional replace lost to a concurrent writer.
    #[error("concurrency token mismatch for item '{id}' in container '{container}'")]
    PreconditionFailed { container: String, id: String },

    #[error("unknown container '{0}'")]
    UnknownContainer(String),

    #[error(transparent)]
    InvalidKey(#[from] ValidationError),

    /// Network or availability failure. The only transient variant.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt item in container '{container}': {details}")]
    Corrupt { container: String, details: String },

    /// Permanent backend failure: unreadable database, bad SQL, broken constraint.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::SystemIoFailure
                ) =>
            {
                StoreError::Unavailable(e.to_string())
            }
            _ => StoreError::Backend(e.to_string()),
        }
    }
}

/// Top-level error for ledger, allocator and migration operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Availability failure; safe to retry the whole operation.
    #[error("transient store failure: {0}")]
    TransientStore(StoreError),

    /// Permanent store failure (not found, conflict, corrupt data).
    #[error("store error: {0}")]
    Store(StoreError),

    /// Broken linkage or content mismatch found by verification.
    #[error("chain integrity failure at {at}: {details}")]
    ChainIntegrity { at: String, details: String },

    /// Per-record migration failure.
    #[error("migration of record '{record_id}' failed: {details}")]
    MigrationRecord { record_id: String, details: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl From<StoreError> for LedgerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidKey(v) => LedgerError::Validation(v),
            e if e.is_transient() => LedgerError::TransientStore(e),
            e => LedgerError::Store(e),
        }
    }
}

impl LedgerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::TransientStore(_))
    }

    /// Stable coarse-grained code for machine consumers.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::Validation(_) => "validation_error",
            LedgerError::TransientStore(_) => "transient_store_error",
            LedgerError::Store(StoreError::NotFound { .. }) => "not_found",
            LedgerError::Store(_) => "store_error",
            LedgerError::ChainIntegrity { .. } => "chain_integrity_error",
            LedgerError::MigrationRecord { .. } => "migration_record_error",
            LedgerError::Config(_) => "config_error",
            LedgerError::Encoding(_) => "invalid_data",
        }
    }
}

impl From<LedgerError> for io::Error {
    fn from(e: LedgerError) -> Self {
        let kind = match &e {
            LedgerError::Validation(_) | LedgerError::Config(_) => io::ErrorKind::InvalidInput,
            LedgerError::ChainIntegrity { .. } | LedgerError::Encoding(_) => {
                io::ErrorKind::InvalidData
            }
            LedgerError::Store(StoreError::NotFound { .. }) => io::ErrorKind::NotFound,
            LedgerError::Store(StoreError::Conflict { .. }) => io::ErrorKind::AlreadyExists,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, e.to_string())
    }
}
