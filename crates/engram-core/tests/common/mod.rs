//! Shared fixtures for integration tests
#![allow(dead_code)]

use std::sync::Arc;

use engram_core::{
    ColumnType, Database, DbConfig, DbResult, HashingEmbedder, KeySource, Metric, Row, TableDef,
    Value, VectorSpec,
};
use indexmap::{indexmap, IndexMap};

/// Install a test subscriber once per binary; repeat calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Schema with a plain searchable table
pub fn notes_schema() -> IndexMap<String, TableDef> {
    indexmap! {
        "notes".to_string() => TableDef::new(
            "id",
            indexmap! {
                "id".to_string() => ColumnType::Str,
                "body".to_string() => ColumnType::Str,
                "category".to_string() => ColumnType::Str,
                "stars".to_string() => ColumnType::Int,
            },
        )
        .searchable(&["body"])
        .indexes(&["category"])
        .optional(&["stars"]),
    }
}

/// Schema with an encrypted column
pub fn secrets_schema() -> IndexMap<String, TableDef> {
    indexmap! {
        "secrets".to_string() => TableDef::new(
            "id",
            indexmap! {
                "id".to_string() => ColumnType::Str,
                "api_key".to_string() => ColumnType::Str,
            },
        )
        .sensitive(&["api_key"]),
    }
}

/// Schema with a vector table of the given dimension
pub fn docs_schema(dims: usize) -> IndexMap<String, TableDef> {
    indexmap! {
        "docs".to_string() => TableDef::new(
            "id",
            indexmap! {
                "id".to_string() => ColumnType::Str,
                "text".to_string() => ColumnType::Str,
                "embedding".to_string() => ColumnType::Vector { dims },
            },
        )
        .searchable(&["text"])
        .optional(&["embedding"])
        .vector(VectorSpec {
            vector_field: "embedding".to_string(),
            source_field: "text".to_string(),
            dims,
            metric: Metric::Cosine,
        }),
    }
}

/// Open a fresh database over `notes_schema` in the given directory
pub async fn open_notes(dir: &tempfile::TempDir) -> DbResult<Database> {
    Database::open(DbConfig::new("testdb", dir.path(), 1, notes_schema())).await
}

/// Open a fresh encrypted database over `secrets_schema`
pub async fn open_secrets(dir: &tempfile::TempDir, passphrase: &str) -> DbResult<Database> {
    let config = DbConfig::new("testdb", dir.path(), 1, secrets_schema())
        .encryption_key(KeySource::Passphrase(passphrase.to_string()));
    Database::open(config).await
}

/// Open a fresh vector database and register a hashing embedder
pub async fn open_docs(dir: &tempfile::TempDir, dims: usize) -> DbResult<Database> {
    let db = Database::open(DbConfig::new("testdb", dir.path(), 1, docs_schema(dims))).await?;
    db.register_embedder("docs", Arc::new(HashingEmbedder::new(dims)))
        .await?;
    Ok(db)
}

/// A note row
pub fn note(id: &str, body: &str, category: &str) -> Row {
    Row::new()
        .with("id", Value::Str(id.to_string()))
        .with("body", Value::Str(body.to_string()))
        .with("category", Value::Str(category.to_string()))
}
