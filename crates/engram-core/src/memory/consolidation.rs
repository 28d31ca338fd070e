//! Near-duplicate consolidation
//!
//! Within each category, rows whose embeddings are cosine-similar at or
//! above the configured threshold merge into a single survivor: highest
//! importance wins, access counts sum, tags union, content per the merge
//! policy. Losers are deleted through the engine so delete events reach the
//! change log. After a pass, every surviving pair within a category sits
//! below the threshold.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::error::DbResult;
use crate::index::vector::dot;
use crate::memory::{record_from_row, MemoryLayer, MemoryRecord, MergePolicy};
use crate::types::{Row, Value};

/// Outcome of one consolidation pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsolidationReport {
    /// Rows that survived
    pub retained: usize,
    /// Rows merged away
    pub compressed: usize,
    /// Bytes of loser content removed
    pub space_saved: usize,
    /// Fraction of examined rows merged away
    pub improvement_ratio: f64,
}

impl MemoryLayer {
    /// Run one consolidation pass over the whole memory table
    #[instrument(level = "info", skip(self), fields(table = %self.opts.table))]
    pub async fn consolidate_memories_with_metadata(&self) -> DbResult<ConsolidationReport> {
        let rows = self.db.get_all(&self.opts.table, None).await?;
        let mut by_category: HashMap<String, Vec<MemoryRecord>> = HashMap::new();
        for row in &rows {
            let record = record_from_row(row)?;
            by_category.entry(record.category.clone()).or_default().push(record);
        }

        let mut report = ConsolidationReport::default();
        let examined = rows.len();

        for (category, mut records) in by_category {
            // highest importance first, so the strongest row survives
            records.sort_by(|a, b| {
                b.importance
                    .partial_cmp(&a.importance)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            });

            let mut merged_away: HashSet<usize> = HashSet::new();
            for survivor_idx in 0..records.len() {
                if merged_away.contains(&survivor_idx) {
                    continue;
                }
                let mut losers: Vec<usize> = Vec::new();
                for candidate_idx in (survivor_idx + 1)..records.len() {
                    if merged_away.contains(&candidate_idx) {
                        continue;
                    }
                    let similarity = match (
                        &records[survivor_idx].embedding,
                        &records[candidate_idx].embedding,
                    ) {
                        (Some(a), Some(b)) if a.len() == b.len() => dot(a, b),
                        _ => continue,
                    };
                    if similarity >= self.opts.consolidation_threshold {
                        losers.push(candidate_idx);
                    }
                }
                if losers.is_empty() {
                    continue;
                }

                let loser_records: Vec<MemoryRecord> =
                    losers.iter().map(|&i| records[i].clone()).collect();
                self.merge_into(&records[survivor_idx], &loser_records)
                    .await?;
                for idx in &losers {
                    merged_away.insert(*idx);
                }
                report.compressed += loser_records.len();
                report.space_saved += loser_records
                    .iter()
                    .map(|r| r.content.len())
                    .sum::<usize>();
                debug!(
                    category = %category,
                    survivor = %records[survivor_idx].id,
                    merged = loser_records.len(),
                    "memories consolidated"
                );
            }
        }

        report.retained = examined - report.compressed;
        report.improvement_ratio = if examined > 0 {
            report.compressed as f64 / examined as f64
        } else {
            0.0
        };
        info!(
            retained = report.retained,
            compressed = report.compressed,
            "consolidation pass complete"
        );
        Ok(report)
    }

    /// Fold losers into the survivor, then delete them
    async fn merge_into(
        &self,
        survivor: &MemoryRecord,
        losers: &[MemoryRecord],
    ) -> DbResult<()> {
        let importance = losers
            .iter()
            .map(|r| r.importance)
            .fold(survivor.importance, f64::max);
        let access_count =
            survivor.access_count + losers.iter().map(|r| r.access_count).sum::<i64>();

        let mut tags: Vec<String> = survivor.tags.clone();
        for loser in losers {
            for tag in &loser.tags {
                if !tags.contains(tag) {
                    tags.push(tag.clone());
                }
            }
        }

        let mut partial = Row::new()
            .with("importance", Value::Num(importance))
            .with("access_count", Value::Int(access_count))
            .with("updated_at", Value::Date(self.db.now()))
            .with(
                "tags",
                Value::Json(serde_json::Value::Array(
                    tags.into_iter().map(serde_json::Value::from).collect(),
                )),
            );

        if self.opts.merge_policy == MergePolicy::Concatenate {
            let mut content = survivor.content.clone();
            for loser in losers {
                if loser.content != survivor.content && !content.contains(&loser.content) {
                    content.push('\n');
                    content.push_str(&loser.content);
                }
            }
            if content != survivor.content {
                partial.set("content", Value::Str(content));
            }
        }

        self.db
            .update(
                &self.opts.table,
                &Value::Str(survivor.id.clone()),
                partial,
            )
            .await?;
        for loser in losers {
            self.db
                .delete(&self.opts.table, &Value::Str(loser.id.clone()))
                .await?;
        }
        Ok(())
    }
}
