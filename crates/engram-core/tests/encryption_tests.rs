//! Field encryption and key rotation

mod common;

use engram_core::{Database, DbConfig, DbError, KeySource, Row, Value};

fn secret_row(id: &str, api_key: &str) -> Row {
    Row::new()
        .with("id", Value::Str(id.to_string()))
        .with("api_key", Value::Str(api_key.to_string()))
}

#[tokio::test]
async fn test_sensitive_field_roundtrip_and_raw_envelope() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_secrets(&dir, "initial").await.unwrap();

    db.insert("secrets", secret_row("s1", "top-secret-token"))
        .await
        .unwrap();

    // plaintext comes back through the API
    let row = db
        .get("secrets", &Value::Str("s1".into()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get("api_key"), Some(&Value::Str("top-secret-token".into())));

    // the raw store never holds the plaintext
    let raw = db
        .stored_row_bytes("secrets", &Value::Str("s1".into()))
        .await
        .unwrap()
        .unwrap();
    let raw_text = String::from_utf8_lossy(&raw);
    assert!(!raw_text.contains("top-secret-token"));

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_rotation_preserves_plaintext_and_rewrites_ciphertext() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_secrets(&dir, "initial").await.unwrap();

    db.insert("secrets", secret_row("s1", "top-secret-token"))
        .await
        .unwrap();
    let raw_before = db
        .stored_row_bytes("secrets", &Value::Str("s1".into()))
        .await
        .unwrap()
        .unwrap();
    let ring_before = db.key_ring_ids().await;
    assert_eq!(ring_before.len(), 1);

    db.rotate_encryption_key(KeySource::Passphrase("next".into()))
        .await
        .unwrap();

    // plaintext reads are unchanged
    let row = db
        .get("secrets", &Value::Str("s1".into()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get("api_key"), Some(&Value::Str("top-secret-token".into())));

    // the stored envelope was rewritten under the new key
    let raw_after = db
        .stored_row_bytes("secrets", &Value::Str("s1".into()))
        .await
        .unwrap()
        .unwrap();
    assert_ne!(raw_before, raw_after);

    // old key ids are retired from the ring
    let ring_after = db.key_ring_ids().await;
    assert_eq!(ring_after.len(), 1);
    assert_ne!(ring_before[0], ring_after[0]);

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_rotation_to_same_key_is_harmless() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_secrets(&dir, "initial").await.unwrap();
    db.insert("secrets", secret_row("s1", "k")).await.unwrap();

    db.rotate_encryption_key(KeySource::Passphrase("initial".into()))
        .await
        .unwrap();

    let row = db
        .get("secrets", &Value::Str("s1".into()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get("api_key"), Some(&Value::Str("k".into())));
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_reopen_with_rotated_key_reads_rows() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = common::open_secrets(&dir, "initial").await.unwrap();
        db.insert("secrets", secret_row("s1", "persisted-secret"))
            .await
            .unwrap();
        db.rotate_encryption_key(KeySource::Passphrase("next".into()))
            .await
            .unwrap();
        db.close().await.unwrap();
    }

    let db = common::open_secrets(&dir, "next").await.unwrap();
    let row = db
        .get("secrets", &Value::Str("s1".into()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get("api_key"), Some(&Value::Str("persisted-secret".into())));
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_wrong_passphrase_fails_to_decrypt() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = common::open_secrets(&dir, "correct").await.unwrap();
        db.insert("secrets", secret_row("s1", "k")).await.unwrap();
        db.close().await.unwrap();
    }

    let db = common::open_secrets(&dir, "wrong").await.unwrap();
    let result = db.get("secrets", &Value::Str("s1".into())).await;
    assert!(matches!(result, Err(DbError::DecryptFailed(_))));
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_writes_during_rotation_use_active_key() {
    let dir = tempfile::tempdir().unwrap();
    let db = common::open_secrets(&dir, "initial").await.unwrap();

    for i in 0..10 {
        db.insert("secrets", secret_row(&format!("s{i}"), &format!("secret-{i}")))
            .await
            .unwrap();
    }
    db.rotate_encryption_key(KeySource::Passphrase("next".into()))
        .await
        .unwrap();

    // every row decrypts after the sweep
    for i in 0..10 {
        let row = db
            .get("secrets", &Value::Str(format!("s{i}")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            row.get("api_key"),
            Some(&Value::Str(format!("secret-{i}")))
        );
    }
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_rotation_batching_covers_all_rows() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = DbConfig::new("testdb", dir.path(), 1, common::secrets_schema())
        .encryption_key(KeySource::Passphrase("initial".into()));
    // batches far smaller than the row count
    config.rotation_batch = 3;
    let db = Database::open(config).await.unwrap();

    for i in 0..20 {
        db.insert(
            "secrets",
            secret_row(&format!("s{i:02}"), &format!("secret-{i}")),
        )
        .await
        .unwrap();
    }
    db.rotate_encryption_key(KeySource::Passphrase("next".into()))
        .await
        .unwrap();

    for i in 0..20 {
        let row = db
            .get("secrets", &Value::Str(format!("s{i:02}")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            row.get("api_key"),
            Some(&Value::Str(format!("secret-{i}")))
        );
    }
    db.close().await.unwrap();
}
