//! Database statistics

use std::collections::HashMap;

use serde::Serialize;

use crate::cache::CacheMetrics;
use crate::db::Database;
use crate::error::DbResult;
use crate::index;

/// Per-table counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TableStats {
    /// Rows in the primary store
    pub rows: usize,
    /// Distinct terms in the inverted index
    pub inverted_terms: usize,
    /// Entries in the vector index
    pub vector_entries: usize,
}

/// Snapshot returned by [`Database::get_stats`]
#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    /// Counters per user table
    pub tables: HashMap<String, TableStats>,
    /// Query-cache metrics
    pub cache: CacheMetrics,
    /// Highest change-log sequence assigned
    pub changelog_head: u64,
    /// Lowest acknowledged sequence across registered adapters
    pub min_acked: Option<u64>,
    /// Key ids in the ring, active first (ids only, never key material)
    pub key_ring: Vec<String>,
    /// This database's device id
    pub device_id: String,
}

impl Database {
    /// Aggregate counters over tables, cache, change log and key ring
    pub async fn get_stats(&self) -> DbResult<DbStats> {
        self.ensure_ready().await?;
        let tables = self.inner.tables.read().await.clone();
        let read = self.inner.kv.read().await;

        let mut per_table = HashMap::with_capacity(tables.len());
        for (name, def) in &tables {
            let mut stats = TableStats {
                rows: read.count(name)?,
                ..TableStats::default()
            };
            if !def.searchable.is_empty() {
                stats.inverted_terms =
                    index::text::term_count(&read, &index::inverted_store(name))?;
            }
            if def.vector.is_some() {
                stats.vector_entries = read.count(&index::vector_store(name))?;
            }
            per_table.insert(name.clone(), stats);
        }
        drop(read);

        let min_acked = self
            .inner
            .adapters
            .iter()
            .map(|a| a.acked_seq())
            .min();

        Ok(DbStats {
            tables: per_table,
            cache: self.inner.cache.metrics(),
            changelog_head: self.current_change_seq(),
            min_acked,
            key_ring: self.key_ring_ids().await,
            device_id: self.device_id().to_string(),
        })
    }
}
