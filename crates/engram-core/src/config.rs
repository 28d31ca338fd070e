//! Database configuration consumed at init

use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::clock::{Clock, SystemClock};
use crate::error::{DbError, DbResult};
use crate::schema::TableDef;

/// Key material supplied by the caller
#[derive(Clone)]
pub enum KeySource {
    /// Passphrase run through the memory-hard KDF with the per-DB salt
    Passphrase(String),
    /// Raw 32-byte key; the KDF is skipped
    Raw(Vec<u8>),
}

impl std::fmt::Debug for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material
        match self {
            Self::Passphrase(_) => f.write_str("KeySource::Passphrase(<redacted>)"),
            Self::Raw(_) => f.write_str("KeySource::Raw(<redacted>)"),
        }
    }
}

/// Argon2id parameters for passphrase-derived keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Iteration count
    pub time_cost: u32,
    /// Memory in KiB
    pub memory_cost: u32,
    /// Lanes
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            time_cost: 2,
            memory_cost: 19 * 1024,
            parallelism: 1,
        }
    }
}

/// Cross-device sync configuration
#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    /// Whether the change log feeds registered adapters
    pub enabled: bool,
    /// Ensure the devices table and register this device at init
    pub auto_register_devices: bool,
    /// Exponential-backoff cap for failing adapters, in milliseconds
    pub max_backoff_ms: u64,
}

/// Bulk-insert failure semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BulkMode {
    /// First failure aborts the whole batch
    #[default]
    Atomic,
    /// Failed rows are reported, the rest commit in the same transaction
    BestEffort,
}

/// Behavior when the registered embedder fails during a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbedderFailureMode {
    /// Store the row without a vector; it stays out of the vector index
    #[default]
    Lenient,
    /// Abort the write
    Strict,
}

/// Behavior when an envelope fails to decrypt on read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecryptFailureMode {
    /// Fail the whole read
    #[default]
    Fail,
    /// Return the row with an explicit error marker in the affected field
    Mark,
}

/// Top-level configuration consumed by [`crate::Database::open`]
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database name; one directory per name under `dir`
    pub name: String,
    /// Parent directory for persistence
    pub dir: PathBuf,
    /// Requested schema version; higher than stored triggers an upgrade
    pub version: u32,
    /// Table definitions
    pub schema: IndexMap<String, TableDef>,
    /// Optional encryption key for sensitive columns
    pub encryption_key: Option<KeySource>,
    /// KDF parameters for passphrase keys
    pub kdf: KdfParams,
    /// Sync configuration
    pub sync: SyncConfig,
    /// Query-cache entry cap
    pub cache_max_entries: usize,
    /// Query-cache TTL in milliseconds
    pub cache_duration_ms: u64,
    /// Bulk-insert semantics
    pub bulk_mode: BulkMode,
    /// Embedder failure semantics
    pub embedder_failure: EmbedderFailureMode,
    /// Decrypt failure semantics
    pub decrypt_failure: DecryptFailureMode,
    /// Rows re-encrypted per transaction during key rotation
    pub rotation_batch: usize,
    /// Tokens elided by the tokenizer
    pub stop_words: Vec<String>,
    /// How long `open` waits for another handle before `UpgradeBlocked`
    pub upgrade_wait_ms: u64,
    /// Time source; swap for a manual clock in tests
    pub clock: Arc<dyn Clock>,
}

impl DbConfig {
    /// Configuration with defaults for everything but name, location and schema
    pub fn new(
        name: impl Into<String>,
        dir: impl Into<PathBuf>,
        version: u32,
        schema: IndexMap<String, TableDef>,
    ) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            version,
            schema,
            encryption_key: None,
            kdf: KdfParams::default(),
            sync: SyncConfig::default(),
            cache_max_entries: 128,
            cache_duration_ms: 60_000,
            bulk_mode: BulkMode::default(),
            embedder_failure: EmbedderFailureMode::default(),
            decrypt_failure: DecryptFailureMode::default(),
            rotation_batch: 64,
            stop_words: Vec::new(),
            upgrade_wait_ms: 2_000,
            clock: Arc::new(SystemClock),
        }
    }

    /// Set the encryption key, builder-style
    #[must_use]
    pub fn encryption_key(mut self, key: KeySource) -> Self {
        self.encryption_key = Some(key);
        self
    }

    /// Set the clock, builder-style
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration and every table definition
    pub fn validate(&self) -> DbResult<()> {
        if self.name.is_empty() {
            return Err(DbError::InvalidConfig("database name is empty".into()));
        }
        if self.version == 0 {
            return Err(DbError::InvalidConfig("schema version must be >= 1".into()));
        }
        if self.cache_max_entries == 0 {
            return Err(DbError::InvalidConfig(
                "cache_max_entries must be non-zero".into(),
            ));
        }
        if self.rotation_batch == 0 {
            return Err(DbError::InvalidConfig(
                "rotation_batch must be non-zero".into(),
            ));
        }
        if let Some(KeySource::Raw(bytes)) = &self.encryption_key {
            if bytes.len() != 32 {
                return Err(DbError::InvalidConfig(format!(
                    "raw encryption key must be 32 bytes, got {}",
                    bytes.len()
                )));
            }
        }
        for (name, def) in &self.schema {
            if name.starts_with("__") {
                return Err(DbError::InvalidConfig(format!(
                    "table name '{name}' collides with reserved stores"
                )));
            }
            def.validate_definition(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColumnType;
    use indexmap::indexmap;

    #[test]
    fn test_reserved_table_names_rejected() {
        let schema = indexmap! {
            "__meta".to_string() => TableDef::new(
                "id",
                indexmap! { "id".to_string() => ColumnType::Str },
            ),
        };
        let config = DbConfig::new("db", "/tmp/engram", 1, schema);
        assert!(matches!(
            config.validate(),
            Err(DbError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_raw_key_length_checked() {
        let config = DbConfig::new("db", "/tmp/engram", 1, IndexMap::new())
            .encryption_key(KeySource::Raw(vec![0u8; 16]));
        assert!(config.validate().is_err());
    }
}
