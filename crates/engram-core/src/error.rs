//! Error types for the Engram database engine
//!
//! The taxonomy is stable: callers match on `DbError` variants to drive
//! retry and recovery decisions, so variants are never renamed or removed.

use thiserror::Error;

/// Result type alias for database operations
pub type DbResult<T> = Result<T, DbError>;

/// Stable error taxonomy for all database operations
#[derive(Error, Debug)]
pub enum DbError {
    /// Operation attempted outside the `ready` lifecycle state
    #[error("database is not ready")]
    NotReady,

    /// Another handle holds the database open and blocks the upgrade
    #[error("schema upgrade blocked: {0}")]
    UpgradeBlocked(String),

    /// A requested schema change cannot be applied to the stored data
    #[error("incompatible schema change on '{table}.{column}': {reason}")]
    IncompatibleSchemaChange {
        table: String,
        column: String,
        reason: String,
    },

    /// A row failed schema or validator checks
    #[error("validation failed on column '{column}': {reason}")]
    ValidationFailed { column: String, reason: String },

    /// No row with the given primary key exists
    #[error("not found in '{table}': {key}")]
    NotFound { table: String, key: String },

    /// Insert attempted with a primary key that already exists
    #[error("duplicate key in '{table}': {key}")]
    DuplicateKey { table: String, key: String },

    /// The owning transaction was rolled back
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    /// The operation deadline expired
    #[error("operation timed out")]
    Timeout,

    /// The operation was cancelled cooperatively
    #[error("operation cancelled")]
    Cancelled,

    /// An envelope failed authentication or its key is not in the ring
    #[error("decryption failed: {0}")]
    DecryptFailed(String),

    /// The KDF rejected the supplied passphrase or parameters
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// A key rotation is already running
    #[error("key rotation already in progress")]
    RotationInProgress,

    /// A vector's length does not match the declared dimension
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The registered embedder returned an error
    #[error("embedder failed: {0}")]
    EmbedderFailed(String),

    /// A sync adapter's transport reported a failure
    #[error("sync transport error: {0}")]
    SyncTransportError(String),

    /// A where-operator was applied to a column type it does not support
    #[error("invalid operator: {0}")]
    InvalidOperator(String),

    /// Configuration rejected at init
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Underlying filesystem failure
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// On-disk data could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl DbError {
    /// Check if the error is transient and worth retrying
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::Cancelled
                | Self::TransactionAborted(_)
                | Self::RotationInProgress
                | Self::SyncTransportError(_)
                | Self::UpgradeBlocked(_)
        )
    }

    /// Error category for structured log fields
    pub fn category(&self) -> &'static str {
        match self {
            Self::NotReady | Self::UpgradeBlocked(_) => "lifecycle",
            Self::IncompatibleSchemaChange { .. } | Self::InvalidConfig(_) => "schema",
            Self::ValidationFailed { .. } | Self::InvalidOperator(_) => "validation",
            Self::NotFound { .. } | Self::DuplicateKey { .. } => "data",
            Self::TransactionAborted(_) | Self::Timeout | Self::Cancelled => "transaction",
            Self::DecryptFailed(_) | Self::KeyDerivationFailed(_) | Self::RotationInProgress => {
                "crypto"
            }
            Self::DimensionMismatch { .. } | Self::EmbedderFailed(_) => "vector",
            Self::SyncTransportError(_) => "sync",
            Self::Io { .. } | Self::Serialization(_) => "storage",
        }
    }

    /// Shorthand for a serialization error from any encoder
    pub fn serialization<E: std::fmt::Display>(err: E) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for DbError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
