//! Retrieval paths: text, vector, and hybrid search
//!
//! All three read through the query cache unless the caller opts out. Text
//! search ranks with BM25 over the inverted index; vector search scans the
//! flat cosine index; hybrid search combines both score sets after
//! normalizing each to [0, 1] within the candidate pool.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use tracing::{debug, instrument};

use crate::cache::QueryCache;
use crate::codec::{decode_row, pack_vector};
use crate::db::Database;
use crate::error::{DbError, DbResult};
use crate::index::{self, text, vector};
use crate::kv::keys::decode_key;
use crate::kv::KvRead;
use crate::query::{
    HybridSearchOptions, SearchHit, SearchOptions, VectorQuery, VectorSearchOptions,
};
use crate::schema::TableDef;

impl Database {
    /// Full-text search ranked by BM25
    #[instrument(level = "debug", skip(self, options), fields(table = %table))]
    pub async fn search(
        &self,
        table: &str,
        query: &str,
        options: SearchOptions,
    ) -> DbResult<Vec<SearchHit>> {
        self.ensure_ready().await?;
        self.gate(options.deadline.as_ref(), options.cancel.as_ref())?;
        let def = self.table_def(table).await?;
        if def.searchable.is_empty() {
            return Err(DbError::InvalidOperator(format!(
                "table '{table}' declares no searchable columns"
            )));
        }

        let options_json =
            serde_json::json!({ "kind": "text", "limit": options.limit }).to_string();
        let fingerprint = QueryCache::fingerprint(table, query, &options_json);
        if !options.no_cache {
            if let Some(hit) = self.inner.cache.lookup(&fingerprint, self.now()) {
                debug!(table = %table, "search served from cache");
                return Ok(hit.as_ref().clone());
            }
        }

        let terms = text::tokenize(query, &self.inner.opts.stop_words);
        let cipher_guard = self.inner.cipher.read().await;
        let read = self.inner.kv.read().await;

        let scores = text::bm25_scores(&read, &index::inverted_store(table), &terms)?;
        let ranked = rank_scores(scores, options.limit);
        let hits = load_hits(
            &read,
            table,
            &def,
            cipher_guard.as_ref(),
            self.inner.opts.decrypt_failure,
            ranked,
        )?;

        if !options.no_cache {
            self.inner
                .cache
                .insert(fingerprint, table, Arc::new(hits.clone()), self.now());
        }
        Ok(hits)
    }

    /// Nearest-neighbor search by cosine similarity.
    ///
    /// A text query is embedded through the table's registered embedder
    /// first; an explicit vector must match the declared dimension.
    #[instrument(level = "debug", skip(self, query, options), fields(table = %table))]
    pub async fn vector_search(
        &self,
        table: &str,
        query: VectorQuery,
        options: VectorSearchOptions,
    ) -> DbResult<Vec<SearchHit>> {
        self.ensure_ready().await?;
        self.gate(options.deadline.as_ref(), options.cancel.as_ref())?;
        let def = self.table_def(table).await?;
        let spec = def.vector.as_ref().ok_or_else(|| {
            DbError::InvalidOperator(format!("table '{table}' declares no vector field"))
        })?;

        let query_vector = self.resolve_query_vector(table, &query, spec.dims).await?;

        let query_text = match &query {
            VectorQuery::Text(text) => format!("text:{text}"),
            VectorQuery::Vector(v) => format!("vec:{}", URL_SAFE_NO_PAD.encode(pack_vector(v))),
        };
        let options_json = serde_json::json!({
            "k": options.k,
            "kind": "vector",
            "threshold": options.threshold,
        })
        .to_string();
        let fingerprint = QueryCache::fingerprint(table, &query_text, &options_json);
        if !options.no_cache {
            if let Some(hit) = self.inner.cache.lookup(&fingerprint, self.now()) {
                return Ok(hit.as_ref().clone());
            }
        }

        let cipher_guard = self.inner.cipher.read().await;
        let read = self.inner.kv.read().await;
        let ranked = vector::top_k(
            &read,
            &index::vector_store(table),
            &query_vector,
            options.k,
            options.threshold,
        )?;
        let hits = load_hits(
            &read,
            table,
            &def,
            cipher_guard.as_ref(),
            self.inner.opts.decrypt_failure,
            ranked,
        )?;

        if !options.no_cache {
            self.inner
                .cache
                .insert(fingerprint, table, Arc::new(hits.clone()), self.now());
        }
        Ok(hits)
    }

    /// Combined text + vector retrieval.
    ///
    /// `score = alpha * norm(text) + (1 - alpha) * norm(vector)` over the
    /// union of both candidate sets. Without an embedder or explicit query
    /// vector the vector side contributes zero.
    #[instrument(level = "debug", skip(self, options, query_vector), fields(table = %table))]
    pub async fn hybrid_search(
        &self,
        table: &str,
        query: &str,
        query_vector: Option<Vec<f32>>,
        options: HybridSearchOptions,
    ) -> DbResult<Vec<SearchHit>> {
        self.ensure_ready().await?;
        self.gate(options.deadline.as_ref(), options.cancel.as_ref())?;
        let def = self.table_def(table).await?;

        let options_json = serde_json::json!({
            "alpha": options.alpha,
            "kind": "hybrid",
            "limit": options.limit,
            "threshold": options.threshold,
            "vector": query_vector.as_ref().map(|v| URL_SAFE_NO_PAD.encode(pack_vector(v))),
        })
        .to_string();
        let fingerprint = QueryCache::fingerprint(table, query, &options_json);
        if !options.no_cache {
            if let Some(hit) = self.inner.cache.lookup(&fingerprint, self.now()) {
                return Ok(hit.as_ref().clone());
            }
        }

        // embed before taking the snapshot; the guard never spans the
        // embedder suspension point
        let resolved_vector: Option<Vec<f32>> = match &def.vector {
            Some(spec) => match query_vector {
                Some(v) => {
                    if v.len() != spec.dims {
                        return Err(DbError::DimensionMismatch {
                            expected: spec.dims,
                            actual: v.len(),
                        });
                    }
                    Some(v)
                }
                None => self.inner.embedders.embed(table, query, spec.dims).await?,
            },
            None => None,
        };

        // one snapshot for both score sets and the row loads
        let cipher_guard = self.inner.cipher.read().await;
        let read = self.inner.kv.read().await;

        let text_scores = if def.searchable.is_empty() {
            HashMap::new()
        } else {
            let terms = text::tokenize(query, &self.inner.opts.stop_words);
            text::bm25_scores(&read, &index::inverted_store(table), &terms)?
        };

        let vector_scores: HashMap<Vec<u8>, f32> = match resolved_vector {
            Some(v) => vector::top_k(
                &read,
                &index::vector_store(table),
                &v,
                options.limit.max(64),
                None,
            )?
            .into_iter()
            .collect(),
            None => HashMap::new(),
        };

        let text_max = text_scores.values().fold(0.0f32, |m, &s| m.max(s));
        let vec_max = vector_scores.values().fold(0.0f32, |m, &s| m.max(s));

        let mut combined: HashMap<Vec<u8>, f32> = HashMap::new();
        for (pk, score) in &text_scores {
            let norm = if text_max > 0.0 { score / text_max } else { 0.0 };
            *combined.entry(pk.clone()).or_insert(0.0) += options.alpha * norm;
        }
        for (pk, score) in &vector_scores {
            let norm = if vec_max > 0.0 { (score / vec_max).max(0.0) } else { 0.0 };
            *combined.entry(pk.clone()).or_insert(0.0) += (1.0 - options.alpha) * norm;
        }
        if let Some(threshold) = options.threshold {
            combined.retain(|_, score| *score >= threshold);
        }
        let ranked = rank_scores(combined, options.limit);

        let hits = load_hits(
            &read,
            table,
            &def,
            cipher_guard.as_ref(),
            self.inner.opts.decrypt_failure,
            ranked,
        )?;

        if !options.no_cache {
            self.inner
                .cache
                .insert(fingerprint, table, Arc::new(hits.clone()), self.now());
        }
        Ok(hits)
    }

    async fn resolve_query_vector(
        &self,
        table: &str,
        query: &VectorQuery,
        dims: usize,
    ) -> DbResult<Vec<f32>> {
        match query {
            VectorQuery::Vector(v) => {
                if v.len() != dims {
                    return Err(DbError::DimensionMismatch {
                        expected: dims,
                        actual: v.len(),
                    });
                }
                Ok(v.clone())
            }
            VectorQuery::Text(text) => self
                .inner
                .embedders
                .embed(table, text, dims)
                .await?
                .ok_or_else(|| {
                    DbError::EmbedderFailed(format!(
                        "no embedder registered for table '{table}'"
                    ))
                }),
        }
    }
}

/// Sort a score map into (pk, score) pairs: descending score, ascending
/// primary key on ties
fn rank_scores(scores: HashMap<Vec<u8>, f32>, limit: usize) -> Vec<(Vec<u8>, f32)> {
    let mut ranked: Vec<(Vec<u8>, f32)> = scores.into_iter().collect();
    ranked.sort_by(|a, b| {
        match b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal) {
            std::cmp::Ordering::Equal => a.0.cmp(&b.0),
            other => other,
        }
    });
    ranked.truncate(limit);
    ranked
}

/// Decode the rows behind ranked keys into hits
fn load_hits<R: KvRead>(
    read: &R,
    table: &str,
    def: &TableDef,
    cipher: Option<&crate::crypto::FieldCipher>,
    mode: crate::config::DecryptFailureMode,
    ranked: Vec<(Vec<u8>, f32)>,
) -> DbResult<Vec<SearchHit>> {
    let mut hits = Vec::with_capacity(ranked.len());
    for (pk_key, score) in ranked {
        let Some(raw) = read.get(table, &pk_key)? else {
            // every index entry has a backing row inside one snapshot
            continue;
        };
        let row = decode_row(def, &raw, cipher, mode)?;
        let (pk, _) = decode_key(&pk_key)?;
        hits.push(SearchHit { pk, score, row });
    }
    Ok(hits)
}
