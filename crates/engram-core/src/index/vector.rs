//! Flat cosine vector index
//!
//! One `__vec_<table>` store per vectorized table, keyed by encoded primary
//! key, holding packed little-endian f32. Entries are L2-normalized on
//! write, so cosine similarity reduces to a dot product at query time.

use std::cmp::Ordering;
use std::ops::Bound;

use crate::codec::{pack_vector, unpack_vector};
use crate::error::{DbError, DbResult};
use crate::kv::{Direction, KvRead, WriteTxn};

/// L2-normalize in place; the zero vector is left untouched
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for component in vector.iter_mut() {
            *component /= norm;
        }
    }
}

/// Dot product; equals cosine similarity for normalized inputs
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Write one entry, normalizing and checking the declared dimension
pub fn put_entry(
    txn: &mut WriteTxn,
    store: &str,
    pk: &[u8],
    vector: &[f32],
    dims: usize,
) -> DbResult<()> {
    if vector.len() != dims {
        return Err(DbError::DimensionMismatch {
            expected: dims,
            actual: vector.len(),
        });
    }
    let mut normalized = vector.to_vec();
    normalize(&mut normalized);
    txn.put(store, pk.to_vec(), pack_vector(&normalized))
}

/// Remove one entry
pub fn remove_entry(txn: &mut WriteTxn, store: &str, pk: &[u8]) -> DbResult<()> {
    txn.delete(store, pk.to_vec())
}

/// Top-k entries by cosine similarity, ties broken by ascending primary key.
///
/// The query is normalized here; callers pass it as produced.
pub fn top_k<R: KvRead>(
    reader: &R,
    store: &str,
    query: &[f32],
    k: usize,
    threshold: Option<f32>,
) -> DbResult<Vec<(Vec<u8>, f32)>> {
    let mut normalized = query.to_vec();
    normalize(&mut normalized);

    let entries = reader.scan(
        store,
        (Bound::Unbounded, Bound::Unbounded),
        Direction::Forward,
    )?;

    let mut scored = Vec::with_capacity(entries.len());
    for (pk, packed) in entries {
        let candidate = unpack_vector(&packed)?;
        if candidate.len() != normalized.len() {
            return Err(DbError::DimensionMismatch {
                expected: normalized.len(),
                actual: candidate.len(),
            });
        }
        let score = dot(&normalized, &candidate);
        if threshold.is_none_or(|t| score >= t) {
            scored.push((pk, score));
        }
    }

    scored.sort_by(|a, b| match b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal) {
        Ordering::Equal => a.0.cmp(&b.0),
        other => other,
    });
    scored.truncate(k);
    Ok(scored)
}

/// Raw cosine similarity between the stored entries of two keys, if both
/// are present
pub fn stored_similarity<R: KvRead>(
    reader: &R,
    store: &str,
    a: &[u8],
    b: &[u8],
) -> DbResult<Option<f32>> {
    let (Some(raw_a), Some(raw_b)) = (reader.get(store, a)?, reader.get(store, b)?) else {
        return Ok(None);
    };
    let va = unpack_vector(&raw_a)?;
    let vb = unpack_vector(&raw_b)?;
    if va.len() != vb.len() {
        return Ok(None);
    }
    Ok(Some(dot(&va, &vb)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KvEngine;

    #[test]
    fn test_normalize_unit_length() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((dot(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_top_k_order_and_ties() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvEngine::open(&dir.path().to_path_buf(), "db", 200)
            .await
            .unwrap();
        let mut txn = kv.write_structural().await;
        txn.create_store("__vec_docs");
        put_entry(&mut txn, "__vec_docs", b"a", &[1.0, 0.0], 2).unwrap();
        put_entry(&mut txn, "__vec_docs", b"b", &[1.0, 0.0], 2).unwrap();
        put_entry(&mut txn, "__vec_docs", b"c", &[0.0, 1.0], 2).unwrap();
        txn.commit().await.unwrap();

        let read = kv.read().await;
        let hits = top_k(&read, "__vec_docs", &[2.0, 0.0], 3, None).unwrap();
        let keys: Vec<&[u8]> = hits.iter().map(|(k, _)| k.as_slice()).collect();
        // equal scores break ties by ascending key
        assert_eq!(keys, [b"a".as_slice(), b"b".as_slice(), b"c".as_slice()]);
        assert!(hits[0].1 >= hits[1].1 && hits[1].1 >= hits[2].1);

        let limited = top_k(&read, "__vec_docs", &[2.0, 0.0], 1, None).unwrap();
        assert_eq!(limited.len(), 1);

        let thresholded = top_k(&read, "__vec_docs", &[2.0, 0.0], 3, Some(0.5)).unwrap();
        assert_eq!(thresholded.len(), 2);
    }

    #[tokio::test]
    async fn test_dimension_checked_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvEngine::open(&dir.path().to_path_buf(), "db", 200)
            .await
            .unwrap();
        let mut txn = kv.write_structural().await;
        txn.create_store("__vec_docs");
        let err = put_entry(&mut txn, "__vec_docs", b"a", &[1.0, 0.0, 0.0], 2).unwrap_err();
        assert!(matches!(err, DbError::DimensionMismatch { expected: 2, actual: 3 }));
        txn.abort();
    }
}
