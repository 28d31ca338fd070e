//! Lifecycle, persistence, schema upgrade, deadlines

mod common;

use std::sync::Arc;

use chrono::Utc;
use engram_core::{
    CancelFlag, ColumnType, Database, DbConfig, DbError, DbState, Deadline, ManualClock, Row,
    SearchOptions, TableDef, Value, WriteOptions,
};
use indexmap::indexmap;

use common::note;

#[tokio::test]
async fn test_rows_and_indexes_survive_reopen() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    {
        let db = common::open_notes(&dir).await.unwrap();
        db.insert("notes", note("n1", "durable content", "work"))
            .await
            .unwrap();
        db.close().await.unwrap();
    }

    let db = common::open_notes(&dir).await.unwrap();
    let row = db
        .get("notes", &Value::Str("n1".into()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get("body"), Some(&Value::Str("durable content".into())));

    // the inverted index was persisted, not rebuilt
    let hits = db
        .search("notes", "durable", SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_initialize_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_notes(&dir).await.unwrap();
    db.initialize().await.unwrap();
    db.initialize().await.unwrap();
    assert_eq!(db.state().await, DbState::Ready);
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_second_open_blocked_while_first_holds() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_notes(&dir).await.unwrap();

    let mut config = DbConfig::new("testdb", dir.path(), 1, common::notes_schema());
    config.upgrade_wait_ms = 100;
    let second = Database::open(config).await;
    assert!(matches!(second, Err(DbError::UpgradeBlocked(_))));

    db.close().await.unwrap();
    // after close the database can be opened again
    let db = common::open_notes(&dir).await.unwrap();
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_upgrade_adds_table_and_backfills_column() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = common::open_notes(&dir).await.unwrap();
        db.insert("notes", note("n1", "existing row", "work"))
            .await
            .unwrap();
        db.close().await.unwrap();
    }

    // version 2: notes grows a column, a second table appears
    let mut schema = common::notes_schema();
    if let Some(def) = schema.get_mut("notes") {
        def.columns
            .insert("archived".to_string(), ColumnType::Bool);
        def.optional.push("archived".to_string());
    }
    schema.insert(
        "labels".to_string(),
        TableDef::new("id", indexmap! { "id".to_string() => ColumnType::Str }),
    );
    let db = Database::open(DbConfig::new("testdb", dir.path(), 2, schema))
        .await
        .unwrap();

    // the existing row was backfilled with the type default
    let row = db
        .get("notes", &Value::Str("n1".into()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get("archived"), Some(&Value::Bool(false)));

    // the new table accepts writes
    db.insert("labels", Row::new().with("id", Value::Str("l1".into())))
        .await
        .unwrap();
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_upgrade_drops_removed_table() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut schema = common::notes_schema();
        schema.insert(
            "scratch".to_string(),
            TableDef::new("id", indexmap! { "id".to_string() => ColumnType::Str }),
        );
        let db = Database::open(DbConfig::new("testdb", dir.path(), 1, schema))
            .await
            .unwrap();
        db.insert("scratch", Row::new().with("id", Value::Str("s1".into())))
            .await
            .unwrap();
        db.close().await.unwrap();
    }

    let db = Database::open(DbConfig::new("testdb", dir.path(), 2, common::notes_schema()))
        .await
        .unwrap();
    // the dropped table is no longer addressable
    assert!(db.get("scratch", &Value::Str("s1".into())).await.is_err());
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_upgrade_rejects_type_change() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = common::open_notes(&dir).await.unwrap();
        db.close().await.unwrap();
    }

    let mut schema = common::notes_schema();
    if let Some(def) = schema.get_mut("notes") {
        // stars was an integer
        def.columns.insert("stars".to_string(), ColumnType::Str);
    }
    let result = Database::open(DbConfig::new("testdb", dir.path(), 2, schema)).await;
    match result {
        Err(DbError::IncompatibleSchemaChange { table, column, .. }) => {
            assert_eq!(table, "notes");
            assert_eq!(column, "stars");
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn test_version_downgrade_rejected() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Database::open(DbConfig::new("testdb", dir.path(), 3, common::notes_schema()))
            .await
            .unwrap();
        db.close().await.unwrap();
    }
    let result = Database::open(DbConfig::new("testdb", dir.path(), 2, common::notes_schema())).await;
    assert!(matches!(result, Err(DbError::InvalidConfig(_))));
}

#[tokio::test]
async fn test_expired_deadline_aborts_write() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let config = DbConfig::new("testdb", dir.path(), 1, common::notes_schema())
        .clock(Arc::clone(&clock) as Arc<dyn engram_core::Clock>);
    let db = Database::open(config).await.unwrap();

    let deadline = Deadline::after(clock.as_ref(), chrono::Duration::seconds(5));
    clock.advance(chrono::Duration::seconds(10));

    let err = db
        .insert_with(
            "notes",
            note("n1", "late", "x"),
            WriteOptions {
                deadline: Some(deadline),
                cancel: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Timeout));
    assert!(db
        .get("notes", &Value::Str("n1".into()))
        .await
        .unwrap()
        .is_none());
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_flag_aborts_write() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_notes(&dir).await.unwrap();

    let cancel = CancelFlag::new();
    cancel.cancel();
    let err = db
        .insert_with(
            "notes",
            note("n1", "cancelled", "x"),
            WriteOptions {
                deadline: None,
                cancel: Some(cancel),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Cancelled));
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_operations_fail_after_close() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_notes(&dir).await.unwrap();
    db.close().await.unwrap();

    assert!(matches!(
        db.insert("notes", note("n1", "x", "y")).await,
        Err(DbError::NotReady)
    ));
    assert!(matches!(
        db.search("notes", "x", SearchOptions::default()).await,
        Err(DbError::NotReady)
    ));
}
