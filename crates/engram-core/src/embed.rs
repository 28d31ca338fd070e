//! Embedder seam
//!
//! The engine never computes embeddings itself; callers register an
//! [`Embedder`] per vector-bearing table. On insert or update, when the
//! source field is present and no explicit vector was supplied, the engine
//! invokes the embedder before writing. Rows without embedder and vector
//! are stored but stay out of the vector index.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{DbError, DbResult};

/// Maps text to a dense vector of a fixed dimension
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Output dimension; must match the table's declared dims
    fn dims(&self) -> usize;

    /// Compute the embedding for `text`
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String>;
}

/// Per-table embedder registry
#[derive(Default)]
pub struct EmbedderRegistry {
    embedders: DashMap<String, std::sync::Arc<dyn Embedder>>,
}

impl std::fmt::Debug for EmbedderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables: Vec<String> = self.embedders.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("EmbedderRegistry")
            .field("tables", &tables)
            .finish()
    }
}

impl EmbedderRegistry {
    /// Register (or replace) the embedder for a table
    pub fn register(&self, table: &str, embedder: std::sync::Arc<dyn Embedder>) {
        self.embedders.insert(table.to_string(), embedder);
    }

    /// Embedder registered for a table, if any
    pub fn get(&self, table: &str) -> Option<std::sync::Arc<dyn Embedder>> {
        self.embedders.get(table).map(|e| std::sync::Arc::clone(&e))
    }

    /// Invoke the table's embedder, mapping failures into the taxonomy and
    /// checking the declared dimension
    pub async fn embed(&self, table: &str, text: &str, dims: usize) -> DbResult<Option<Vec<f32>>> {
        let Some(embedder) = self.get(table) else {
            return Ok(None);
        };
        let vector = embedder
            .embed(text)
            .await
            .map_err(DbError::EmbedderFailed)?;
        if vector.len() != dims {
            return Err(DbError::DimensionMismatch {
                expected: dims,
                actual: vector.len(),
            });
        }
        Ok(Some(vector))
    }
}

/// Deterministic hashing embedder.
///
/// Token-hashing into a fixed number of buckets followed by L2
/// normalization. Not a substitute for a learned model, but stable,
/// offline, and good enough for tests and text-similarity smoke checks.
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    /// Embedder producing `dims`-dimensional unit vectors
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        if self.dims == 0 {
            return Err("embedder dims must be non-zero".to_string());
        }
        let mut vector = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let bucket = (fnv1a(token.to_lowercase().as_bytes()) as usize) % self.dims;
            vector[bucket] += 1.0;
        }
        crate::index::vector::normalize(&mut vector);
        Ok(vector)
    }
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}
