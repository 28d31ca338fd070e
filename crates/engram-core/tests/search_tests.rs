//! Text, vector, and hybrid search; query-cache accounting

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use engram_core::{
    Database, DbConfig, DbError, Embedder, HybridSearchOptions, Row, SearchOptions, Value,
    VectorQuery, VectorSearchOptions,
};

fn doc(id: &str, text: &str) -> Row {
    Row::new()
        .with("id", Value::Str(id.to_string()))
        .with("text", Value::Str(text.to_string()))
}

#[tokio::test]
async fn test_bm25_ranks_matching_document_higher() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_notes(&dir).await.unwrap();

    db.insert("notes", common::note("n1", "machine learning", "ai"))
        .await
        .unwrap();
    db.insert("notes", common::note("n2", "quantum physics", "physics"))
        .await
        .unwrap();

    let hits = db
        .search("notes", "machine", SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].pk, Value::Str("n1".into()));
    assert!(hits[0].score > 0.0);

    // a term absent from every row yields nothing
    let none = db
        .search("notes", "nonexistent", SearchOptions::default())
        .await
        .unwrap();
    assert!(none.is_empty());
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_search_is_case_folded() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_notes(&dir).await.unwrap();
    db.insert("notes", common::note("n1", "Machine Learning", "ai"))
        .await
        .unwrap();

    let hits = db
        .search("notes", "MACHINE", SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_vector_search_orders_by_similarity() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_docs(&dir, 16).await.unwrap();

    db.insert("docs", doc("d1", "rust async runtime internals"))
        .await
        .unwrap();
    db.insert("docs", doc("d2", "gardening tips for spring"))
        .await
        .unwrap();
    db.insert("docs", doc("d3", "rust borrow checker internals"))
        .await
        .unwrap();

    let hits = db
        .vector_search(
            "docs",
            VectorQuery::Text("rust internals".to_string()),
            VectorSearchOptions::default(),
        )
        .await
        .unwrap();
    assert!(!hits.is_empty());
    // scores are non-increasing
    for pair in hits.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    assert_ne!(hits[0].pk, Value::Str("d2".into()));
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_embedder_populates_unit_norm_vector() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_docs(&dir, 42).await.unwrap();

    db.insert("docs", doc("d1", "some document text")).await.unwrap();

    let entry = db
        .vector_index_entry("docs", &Value::Str("d1".into()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.len(), 42);
    let norm: f32 = entry.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-5);
    db.close().await.unwrap();
}

struct WrongSizeEmbedder;

#[async_trait]
impl Embedder for WrongSizeEmbedder {
    fn dims(&self) -> usize {
        42
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, String> {
        Ok(vec![1.0; 40])
    }
}

#[tokio::test]
async fn test_mismatched_embedder_output_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(DbConfig::new(
        "testdb",
        dir.path(),
        1,
        common::docs_schema(42),
    ))
    .await
    .unwrap();
    db.register_embedder("docs", Arc::new(WrongSizeEmbedder))
        .await
        .unwrap();

    let err = db.insert("docs", doc("d1", "text")).await.unwrap_err();
    assert!(matches!(
        err,
        DbError::DimensionMismatch {
            expected: 42,
            actual: 40
        }
    ));

    // neither the row nor the vector entry exists
    assert!(db
        .get("docs", &Value::Str("d1".into()))
        .await
        .unwrap()
        .is_none());
    assert!(db
        .vector_index_entry("docs", &Value::Str("d1".into()))
        .await
        .unwrap()
        .is_none());
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_row_without_embedder_still_text_searchable() {
    let dir = tempfile::tempdir().unwrap();
    // no embedder registered
    let db = Database::open(DbConfig::new(
        "testdb",
        dir.path(),
        1,
        common::docs_schema(8),
    ))
    .await
    .unwrap();

    db.insert("docs", doc("d1", "orphan document")).await.unwrap();

    // retrievable by pk and by text search
    assert!(db
        .get("docs", &Value::Str("d1".into()))
        .await
        .unwrap()
        .is_some());
    let hits = db
        .search("docs", "orphan", SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);

    // but absent from the vector index
    assert!(db
        .vector_index_entry("docs", &Value::Str("d1".into()))
        .await
        .unwrap()
        .is_none());
    let stats = db.get_stats().await.unwrap();
    assert_eq!(stats.tables["docs"].vector_entries, 0);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_hybrid_search_combines_text_and_vector() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_docs(&dir, 32).await.unwrap();

    db.insert("docs", doc("d1", "rust database engine"))
        .await
        .unwrap();
    db.insert("docs", doc("d2", "cooking pasta at home"))
        .await
        .unwrap();

    let hits = db
        .hybrid_search(
            "docs",
            "rust engine",
            None,
            HybridSearchOptions::default(),
        )
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0].pk, Value::Str("d1".into()));

    // alpha = 1.0 degenerates to pure text ranking
    let text_only = db
        .hybrid_search(
            "docs",
            "rust engine",
            None,
            HybridSearchOptions {
                alpha: 1.0,
                ..HybridSearchOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(text_only[0].pk, Value::Str("d1".into()));
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_cache_lru_and_hit_accounting() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = DbConfig::new("testdb", dir.path(), 1, common::notes_schema());
    config.cache_max_entries = 2;
    let db = Database::open(config).await.unwrap();

    db.insert("notes", common::note("n1", "alpha beta gamma", "x"))
        .await
        .unwrap();

    for term in ["alpha", "beta", "gamma"] {
        db.search("notes", term, SearchOptions::default()).await.unwrap();
    }
    // capacity 2: "alpha" was evicted, "beta" and "gamma" remain
    db.search("notes", "beta", SearchOptions::default()).await.unwrap();
    db.search("notes", "gamma", SearchOptions::default()).await.unwrap();

    let stats = db.get_stats().await.unwrap();
    assert_eq!(stats.cache.total_queries, 5);
    assert_eq!(stats.cache.cache_hits, 2);

    // alpha misses again, confirming it was the eviction victim
    db.search("notes", "alpha", SearchOptions::default()).await.unwrap();
    let stats = db.get_stats().await.unwrap();
    assert_eq!(stats.cache.total_queries, 6);
    assert_eq!(stats.cache.cache_hits, 2);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_mutation_invalidates_cached_results() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_notes(&dir).await.unwrap();

    db.insert("notes", common::note("n1", "alpha", "x")).await.unwrap();
    let first = db
        .search("notes", "alpha", SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(first.len(), 1);

    db.insert("notes", common::note("n2", "alpha again", "x"))
        .await
        .unwrap();
    let second = db
        .search("notes", "alpha", SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(second.len(), 2);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_no_cache_option_bypasses() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_notes(&dir).await.unwrap();
    db.insert("notes", common::note("n1", "alpha", "x")).await.unwrap();

    for _ in 0..3 {
        db.search(
            "notes",
            "alpha",
            SearchOptions {
                no_cache: true,
                ..SearchOptions::default()
            },
        )
        .await
        .unwrap();
    }
    let stats = db.get_stats().await.unwrap();
    assert_eq!(stats.cache.cache_hits, 0);
    assert_eq!(stats.cache.total_queries, 0);
    db.close().await.unwrap();
}
