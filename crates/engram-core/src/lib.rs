//! # Engram Core
//!
//! Embedded document database with first-class support for AI retrieval
//! workflows: typed schemas over an ordered transactional key-value layer,
//! full-text search (BM25), dense-vector similarity search, hybrid ranking,
//! per-field envelope encryption with online key rotation, a scored memory
//! layer with consolidation, a bounded query cache, and a sync change log
//! with pluggable adapters.
//!
//! ## Quick start
//!
//! ```ignore
//! use engram_core::{Database, DbConfig, TableDef, ColumnType, Row, Value};
//! use indexmap::indexmap;
//!
//! # async fn example() -> engram_core::DbResult<()> {
//! let schema = indexmap! {
//!     "notes".to_string() => TableDef::new("id", indexmap! {
//!         "id".to_string() => ColumnType::Str,
//!         "body".to_string() => ColumnType::Str,
//!     }).searchable(&["body"]),
//! };
//! let db = Database::open(DbConfig::new("app", "./data", 1, schema)).await?;
//! db.insert("notes", Row::new()
//!     .with("id", Value::Str("n1".into()))
//!     .with("body", Value::Str("meeting notes".into()))).await?;
//! let hits = db.search("notes", "meeting", Default::default()).await?;
//! # drop(hits);
//! db.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod clock;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod db;
pub mod embed;
pub mod error;
pub mod index;
pub mod kv;
pub mod memory;
pub mod query;
pub mod schema;
pub mod stats;
pub mod sync;
pub mod types;

pub use cache::CacheMetrics;
pub use clock::{CancelFlag, Clock, Deadline, ManualClock, SystemClock};
pub use config::{
    BulkMode, DbConfig, DecryptFailureMode, EmbedderFailureMode, KdfParams, KeySource, SyncConfig,
};
pub use crypto::Envelope;
pub use db::{Database, DbState};
pub use embed::{Embedder, HashingEmbedder};
pub use error::{DbError, DbResult};
pub use memory::{
    consolidation::ConsolidationReport, MemoryHit, MemoryInput, MemoryLayer, MemoryOptions,
    MemoryRecord, MemoryStats, MergePolicy, ScoringParams,
};
pub use query::{
    BulkFailure, BulkReport, Filter, FindOptions, HybridSearchOptions, OrderBy, SearchHit,
    SearchOptions, SortDirection, VectorQuery, VectorSearchOptions, WriteOptions,
};
pub use schema::{Metric, TableDef, ValidationRejection, Validator, VectorSpec};
pub use stats::{DbStats, TableStats};
pub use sync::{AdapterState, ChangeKind, ChangeRecord, SyncTransport};
pub use types::{ColumnType, Row, Value};
