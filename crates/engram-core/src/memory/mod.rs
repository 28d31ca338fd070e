//! Memory layer: scored storage and contextual retrieval
//!
//! A memory is an ordinary row in a vector-bearing table with a fixed
//! shape (see [`MemoryOptions::table_def`]). The layer computes importance
//! on every write, reranks retrieval candidates by relevance, tracks
//! access statistics, and merges near-duplicates (see [`consolidation`]).

pub mod consolidation;
pub mod scoring;

use chrono::{DateTime, Utc};
use indexmap::indexmap;
use serde::Serialize;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{DbError, DbResult};
use crate::query::{HybridSearchOptions, VectorQuery, VectorSearchOptions};
use crate::schema::{Metric, TableDef, VectorSpec};
use crate::types::{ColumnType, Row, Value};

pub use scoring::ScoringParams;

/// Content-merge policy applied when near-duplicates are consolidated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// Keep the survivor's content, drop the duplicates'
    #[default]
    KeepSurvivor,
    /// Append distinct loser content to the survivor
    Concatenate,
}

/// Memory-layer configuration
#[derive(Debug, Clone)]
pub struct MemoryOptions {
    /// Table holding memory rows
    pub table: String,
    /// Embedding dimension; must match the registered embedder
    pub dims: usize,
    /// Scoring weights and time constants
    pub scoring: ScoringParams,
    /// Cosine similarity at or above which rows consolidate
    pub consolidation_threshold: f32,
    /// Shortlist multiplier for contextual retrieval (top `k * factor`)
    pub shortlist_factor: usize,
    /// Content handling on merge
    pub merge_policy: MergePolicy,
}

impl MemoryOptions {
    /// Defaults for a `memories` table with the given embedding dimension
    pub fn new(dims: usize) -> Self {
        Self {
            table: "memories".to_string(),
            dims,
            scoring: ScoringParams::default(),
            consolidation_threshold: 0.85,
            shortlist_factor: 4,
            merge_policy: MergePolicy::default(),
        }
    }

    /// Table definition to register in the database schema
    pub fn table_def(&self) -> TableDef {
        TableDef::new(
            "id",
            indexmap! {
                "id".to_string() => ColumnType::Str,
                "content".to_string() => ColumnType::Str,
                "content_type".to_string() => ColumnType::Str,
                "embedding".to_string() => ColumnType::Vector { dims: self.dims },
                "metadata".to_string() => ColumnType::Json,
                "importance".to_string() => ColumnType::Num,
                "access_count".to_string() => ColumnType::Int,
                "last_accessed".to_string() => ColumnType::Date,
                "created_at".to_string() => ColumnType::Date,
                "updated_at".to_string() => ColumnType::Date,
                "category".to_string() => ColumnType::Str,
                "tags".to_string() => ColumnType::Json,
            },
        )
        .searchable(&["content"])
        .indexes(&["category"])
        .optional(&["embedding"])
        .vector(VectorSpec {
            vector_field: "embedding".to_string(),
            source_field: "content".to_string(),
            dims: self.dims,
            metric: Metric::Cosine,
        })
    }
}

/// Input for [`MemoryLayer::store_memory`]
#[derive(Debug, Clone)]
pub struct MemoryInput {
    /// Explicit id; generated when absent
    pub id: Option<String>,
    /// The content to remember
    pub content: String,
    /// Content type tag, e.g. `text`
    pub content_type: String,
    /// Free-form metadata; `pinned` and `priority` feed the scoring
    pub metadata: serde_json::Value,
    /// Grouping category; consolidation never crosses categories
    pub category: String,
    /// Tags, unioned on merge
    pub tags: Vec<String>,
    /// Base importance before scored contributions
    pub base_importance: f64,
}

impl Default for MemoryInput {
    fn default() -> Self {
        Self {
            id: None,
            content: String::new(),
            content_type: "text".to_string(),
            metadata: serde_json::json!({}),
            category: "general".to_string(),
            tags: Vec::new(),
            base_importance: 0.5,
        }
    }
}

impl MemoryInput {
    /// Input with content and defaults for everything else
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

/// One memory row, decoded
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryRecord {
    /// Row id
    pub id: String,
    /// Remembered content
    pub content: String,
    /// Content type tag
    pub content_type: String,
    /// Embedding, when one was computed
    pub embedding: Option<Vec<f32>>,
    /// Free-form metadata
    pub metadata: serde_json::Value,
    /// Importance in [0, 1]
    pub importance: f64,
    /// Times the row was retrieved
    pub access_count: i64,
    /// Last retrieval
    pub last_accessed: DateTime<Utc>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last write
    pub updated_at: DateTime<Utc>,
    /// Grouping category
    pub category: String,
    /// Tags
    pub tags: Vec<String>,
}

/// A memory with its retrieval score
#[derive(Debug, Clone, Serialize)]
pub struct MemoryHit {
    /// The memory
    pub record: MemoryRecord,
    /// Relevance (contextual retrieval) or raw search score
    pub score: f64,
}

/// Aggregate statistics over the memory table
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    /// Stored memories
    pub total: usize,
    /// Mean importance
    pub avg_importance: f64,
    /// Sum of access counts
    pub total_access_count: i64,
    /// Row counts per category
    pub by_category: std::collections::HashMap<String, usize>,
}

/// Handle binding a database to one memory table
#[derive(Debug, Clone)]
pub struct MemoryLayer {
    pub(crate) db: Database,
    pub(crate) opts: MemoryOptions,
}

impl Database {
    /// Memory-layer view over a table shaped by [`MemoryOptions::table_def`]
    pub async fn memory_layer(&self, opts: MemoryOptions) -> DbResult<MemoryLayer> {
        let def = self.table_def(&opts.table).await?;
        let spec = def.vector.as_ref().ok_or_else(|| {
            DbError::InvalidConfig(format!(
                "memory table '{}' declares no vector field",
                opts.table
            ))
        })?;
        if spec.dims != opts.dims {
            return Err(DbError::DimensionMismatch {
                expected: opts.dims,
                actual: spec.dims,
            });
        }
        Ok(MemoryLayer {
            db: self.clone(),
            opts,
        })
    }
}

impl MemoryLayer {
    /// Store one memory; importance is computed before the write
    #[instrument(level = "debug", skip_all, fields(table = %self.opts.table))]
    pub async fn store_memory(&self, input: MemoryInput) -> DbResult<MemoryRecord> {
        let now = self.db.now();
        let id = input.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        // the base survives in metadata so later rescoring starts from it
        let mut metadata = input.metadata;
        if let serde_json::Value::Object(map) = &mut metadata {
            map.entry("base_importance")
                .or_insert_with(|| serde_json::json!(input.base_importance));
        }
        let importance = scoring::importance(
            &self.opts.scoring,
            input.base_importance,
            0,
            0,
            &input.category,
            &metadata,
        );

        let row = Row::new()
            .with("id", Value::Str(id.clone()))
            .with("content", Value::Str(input.content))
            .with("content_type", Value::Str(input.content_type))
            .with("metadata", Value::Json(metadata))
            .with("importance", Value::Num(importance))
            .with("access_count", Value::Int(0))
            .with("last_accessed", Value::Date(now))
            .with("created_at", Value::Date(now))
            .with("updated_at", Value::Date(now))
            .with("category", Value::Str(input.category))
            .with(
                "tags",
                Value::Json(serde_json::Value::Array(
                    input.tags.into_iter().map(serde_json::Value::from).collect(),
                )),
            );

        self.db.insert(&self.opts.table, row).await?;
        let stored = self
            .db
            .get(&self.opts.table, &Value::Str(id.clone()))
            .await?
            .ok_or_else(|| DbError::NotFound {
                table: self.opts.table.clone(),
                key: id,
            })?;
        record_from_row(&stored)
    }

    /// The underlying database handle
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Read one memory without recording an access
    pub async fn peek_memory(&self, id: &str) -> DbResult<Option<MemoryRecord>> {
        let pk = Value::Str(id.to_string());
        match self.db.get(&self.opts.table, &pk).await? {
            Some(row) => Ok(Some(record_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Read one memory and record the access (count, recency, importance)
    pub async fn retrieve_memory(&self, id: &str) -> DbResult<Option<MemoryRecord>> {
        let pk = Value::Str(id.to_string());
        let Some(row) = self.db.get(&self.opts.table, &pk).await? else {
            return Ok(None);
        };
        let record = record_from_row(&row)?;
        let updated = self.bump_access(&[record]).await?;
        Ok(updated.into_iter().next())
    }

    /// Hybrid text + vector search over memory content
    pub async fn search_memories(&self, query: &str, k: usize) -> DbResult<Vec<MemoryHit>> {
        let hits = self
            .db
            .hybrid_search(
                &self.opts.table,
                query,
                None,
                HybridSearchOptions {
                    limit: k,
                    ..HybridSearchOptions::default()
                },
            )
            .await?;
        hits.into_iter()
            .map(|hit| {
                Ok(MemoryHit {
                    record: record_from_row(&hit.row)?,
                    score: f64::from(hit.score),
                })
            })
            .collect()
    }

    /// Embed the context, shortlist by vector similarity, rerank by
    /// relevance, and return the top `k`.
    ///
    /// Every returned row's access count and last-accessed stamp are
    /// updated in a single write transaction.
    #[instrument(level = "debug", skip_all, fields(table = %self.opts.table, k))]
    pub async fn retrieve_contextual_memories(
        &self,
        context: &str,
        k: usize,
    ) -> DbResult<Vec<MemoryHit>> {
        let shortlist = k.saturating_mul(self.opts.shortlist_factor.max(1));
        let candidates = self
            .db
            .vector_search(
                &self.opts.table,
                VectorQuery::Text(context.to_string()),
                VectorSearchOptions {
                    k: shortlist,
                    ..VectorSearchOptions::default()
                },
            )
            .await?;

        let now = self.db.now();
        let mut reranked: Vec<(MemoryRecord, f64)> = Vec::with_capacity(candidates.len());
        for hit in candidates {
            let record = record_from_row(&hit.row)?;
            let age_ms = (now - record.last_accessed).num_milliseconds();
            let score = scoring::relevance(
                &self.opts.scoring,
                hit.score,
                age_ms,
                &record.category,
                record.importance,
                &record.metadata,
            );
            reranked.push((record, score));
        }
        reranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        reranked.truncate(k);

        let records: Vec<MemoryRecord> = reranked.iter().map(|(r, _)| r.clone()).collect();
        let updated = self.bump_access(&records).await?;
        debug!(returned = updated.len(), "contextual retrieval complete");

        Ok(updated
            .into_iter()
            .zip(reranked.into_iter().map(|(_, score)| score))
            .map(|(record, score)| MemoryHit { record, score })
            .collect())
    }

    /// Aggregate statistics over the memory table
    pub async fn get_stats(&self) -> DbResult<MemoryStats> {
        let rows = self.db.get_all(&self.opts.table, None).await?;
        let mut stats = MemoryStats {
            total: rows.len(),
            avg_importance: 0.0,
            total_access_count: 0,
            by_category: std::collections::HashMap::new(),
        };
        for row in &rows {
            let record = record_from_row(row)?;
            stats.avg_importance += record.importance;
            stats.total_access_count += record.access_count;
            *stats.by_category.entry(record.category).or_insert(0) += 1;
        }
        if stats.total > 0 {
            stats.avg_importance /= stats.total as f64;
        }
        Ok(stats)
    }

    /// Record accesses for the given memories in one write transaction;
    /// returns the rows as updated
    pub(crate) async fn bump_access(
        &self,
        records: &[MemoryRecord],
    ) -> DbResult<Vec<MemoryRecord>> {
        let now = self.db.now();
        let mut updated = Vec::with_capacity(records.len());
        let mut partials = Vec::with_capacity(records.len());
        for record in records {
            let access_count = record.access_count + 1;
            let age_ms = 0;
            let importance = scoring::importance(
                &self.opts.scoring,
                record.importance_base(),
                access_count,
                age_ms,
                &record.category,
                &record.metadata,
            );
            let partial = Row::new()
                .with("access_count", Value::Int(access_count))
                .with("last_accessed", Value::Date(now))
                .with("updated_at", Value::Date(now))
                .with("importance", Value::Num(importance));
            partials.push((Value::Str(record.id.clone()), partial));

            let mut next = record.clone();
            next.access_count = access_count;
            next.last_accessed = now;
            next.updated_at = now;
            next.importance = importance;
            updated.push(next);
        }
        self.db
            .update_fields_batch(&self.opts.table, partials)
            .await?;
        Ok(updated)
    }
}

impl MemoryRecord {
    /// Base importance the row was stored with
    fn importance_base(&self) -> f64 {
        self.metadata
            .get("base_importance")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.5)
    }
}

/// Decode a memory row into a record
pub(crate) fn record_from_row(row: &Row) -> DbResult<MemoryRecord> {
    let get_str = |column: &str| -> DbResult<String> {
        row.get(column)
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| DbError::Serialization(format!("memory row missing '{column}'")))
    };
    let get_date = |column: &str| -> DbResult<DateTime<Utc>> {
        match row.get(column) {
            Some(Value::Date(d)) => Ok(*d),
            _ => Err(DbError::Serialization(format!(
                "memory row missing '{column}'"
            ))),
        }
    };

    let tags = match row.get("tags") {
        Some(Value::Json(serde_json::Value::Array(items))) => items
            .iter()
            .filter_map(|v| v.as_str().map(ToString::to_string))
            .collect(),
        _ => Vec::new(),
    };

    Ok(MemoryRecord {
        id: get_str("id")?,
        content: get_str("content")?,
        content_type: get_str("content_type")?,
        embedding: row
            .get_non_null("embedding")
            .and_then(Value::as_vector)
            .map(<[f32]>::to_vec),
        metadata: match row.get("metadata") {
            Some(Value::Json(j)) => j.clone(),
            _ => serde_json::json!({}),
        },
        importance: row
            .get("importance")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        access_count: match row.get("access_count") {
            Some(Value::Int(i)) => *i,
            _ => 0,
        },
        last_accessed: get_date("last_accessed")?,
        created_at: get_date("created_at")?,
        updated_at: get_date("updated_at")?,
        category: get_str("category")?,
        tags,
    })
}
