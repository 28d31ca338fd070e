//! Schema-directed row serialization
//!
//! Each column is encoded by its semantic type: dates as millisecond
//! epochs, vectors as packed little-endian f32, json as canonical text
//! (serde_json without `preserve_order` keeps object keys sorted), bytes
//! and strings as-is. Sensitive columns are replaced by an encryption
//! [`Envelope`]; plaintext for those columns never reaches a store.
//!
//! Rows carry a commit stamp (time + origin device) used by the sync
//! conflict policy.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::DecryptFailureMode;
use crate::crypto::{Envelope, FieldCipher};
use crate::error::{DbError, DbResult};
use crate::kv::keys::date_from_millis;
use crate::schema::TableDef;
use crate::types::{ColumnType, Row, Value};

/// Marker placed in a field when decryption fails and the caller opted to
/// receive rows instead of errors
pub const DECRYPT_ERROR_MARKER: &str = "__decrypt_error";

/// On-disk form of one cell
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoredValue {
    /// Absent / null
    Null,
    /// UTF-8 text
    Str(String),
    /// 64-bit float
    Num(f64),
    /// 64-bit signed integer
    Int(i64),
    /// Boolean flag
    Bool(bool),
    /// Millisecond epoch
    Date(i64),
    /// Canonical JSON text
    Json(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Packed little-endian f32
    Vector(Vec<u8>),
    /// Encrypted field envelope
    Enc(Envelope),
}

/// On-disk form of one row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRow {
    /// Commit time, millisecond epoch
    pub committed_at: i64,
    /// Device the commit originated on
    pub device_id: String,
    /// Cells in schema order
    pub fields: Vec<(String, StoredValue)>,
}

impl StoredRow {
    /// Deserialize a stored row without decoding its cells
    pub fn from_bytes(bytes: &[u8]) -> DbResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Serialize for storage
    pub fn to_bytes(&self) -> DbResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

/// Pack a vector as little-endian f32 bytes
pub fn pack_vector(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for component in vector {
        out.extend_from_slice(&component.to_le_bytes());
    }
    out
}

/// Unpack little-endian f32 bytes; the length must be a whole number of
/// components
pub fn unpack_vector(bytes: &[u8]) -> DbResult<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(DbError::Serialization(format!(
            "packed vector length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn encode_value(value: &Value, ty: &ColumnType, column: &str) -> DbResult<StoredValue> {
    if !value.conforms_to(ty) {
        return Err(DbError::Serialization(format!(
            "column '{column}': value does not conform to {}",
            ty.name()
        )));
    }
    Ok(match value {
        Value::Null => StoredValue::Null,
        Value::Str(s) => StoredValue::Str(s.clone()),
        Value::Num(n) => StoredValue::Num(*n),
        // integers are valid in number columns; stored as written so reads
        // return exactly what was inserted
        Value::Int(i) => StoredValue::Int(*i),
        Value::Bool(b) => StoredValue::Bool(*b),
        Value::Date(d) => StoredValue::Date(d.timestamp_millis()),
        Value::Json(j) => StoredValue::Json(serde_json::to_string(j)?),
        Value::Bytes(b) => StoredValue::Bytes(b.clone()),
        Value::Vector(v) => StoredValue::Vector(pack_vector(v)),
    })
}

fn decode_value(stored: &StoredValue, ty: &ColumnType, column: &str) -> DbResult<Value> {
    let mismatch = |got: &str| {
        DbError::Serialization(format!(
            "column '{column}': stored {got} does not match schema type {}",
            ty.name()
        ))
    };
    Ok(match (stored, ty) {
        (StoredValue::Null, _) => Value::Null,
        (StoredValue::Str(s), ColumnType::Str) => Value::Str(s.clone()),
        (StoredValue::Num(n), ColumnType::Num) => Value::Num(*n),
        (StoredValue::Int(i), ColumnType::Int | ColumnType::Num) => Value::Int(*i),
        (StoredValue::Bool(b), ColumnType::Bool) => Value::Bool(*b),
        (StoredValue::Date(ms), ColumnType::Date) => Value::Date(date_from_millis(*ms)?),
        (StoredValue::Json(text), ColumnType::Json) => Value::Json(serde_json::from_str(text)?),
        (StoredValue::Bytes(b), ColumnType::Bytes) => Value::Bytes(b.clone()),
        (StoredValue::Vector(packed), ColumnType::Vector { dims }) => {
            let vector = unpack_vector(packed)?;
            if vector.len() != *dims {
                return Err(DbError::DimensionMismatch {
                    expected: *dims,
                    actual: vector.len(),
                });
            }
            Value::Vector(vector)
        }
        (StoredValue::Str(_), _) => return Err(mismatch("string")),
        (StoredValue::Num(_), _) => return Err(mismatch("number")),
        (StoredValue::Int(_), _) => return Err(mismatch("integer")),
        (StoredValue::Bool(_), _) => return Err(mismatch("boolean")),
        (StoredValue::Date(_), _) => return Err(mismatch("date")),
        (StoredValue::Json(_), _) => return Err(mismatch("json")),
        (StoredValue::Bytes(_), _) => return Err(mismatch("bytes")),
        (StoredValue::Vector(_), _) => return Err(mismatch("vector")),
        (StoredValue::Enc(_), _) => return Err(mismatch("envelope")),
    })
}

/// Encode a validated row for storage, encrypting sensitive columns
pub fn encode_row(
    def: &TableDef,
    row: &Row,
    cipher: Option<&FieldCipher>,
    committed_at_ms: i64,
    device_id: &str,
) -> DbResult<Vec<u8>> {
    let mut fields = Vec::with_capacity(def.columns.len());
    for (column, ty) in &def.columns {
        let value = row.get(column).unwrap_or(&Value::Null);
        let plain = encode_value(value, ty, column)?;
        let stored = if def.is_sensitive(column) && !matches!(plain, StoredValue::Null) {
            let cipher = cipher.ok_or_else(|| {
                DbError::InvalidConfig(format!(
                    "column '{column}' is sensitive but no encryption key is configured"
                ))
            })?;
            let plaintext = bincode::serialize(&plain)?;
            StoredValue::Enc(cipher.encrypt(&plaintext)?)
        } else {
            plain
        };
        fields.push((column.clone(), stored));
    }
    StoredRow {
        committed_at: committed_at_ms,
        device_id: device_id.to_string(),
        fields,
    }
    .to_bytes()
}

/// Decode a stored row, decrypting sensitive columns through the ring
pub fn decode_row(
    def: &TableDef,
    bytes: &[u8],
    cipher: Option<&FieldCipher>,
    mode: DecryptFailureMode,
) -> DbResult<Row> {
    let stored = StoredRow::from_bytes(bytes)?;
    decode_stored_row(def, &stored, cipher, mode)
}

/// Decode an already-parsed [`StoredRow`]
pub fn decode_stored_row(
    def: &TableDef,
    stored: &StoredRow,
    cipher: Option<&FieldCipher>,
    mode: DecryptFailureMode,
) -> DbResult<Row> {
    let mut row = Row::new();
    for (column, stored_value) in &stored.fields {
        let ty = match def.columns.get(column) {
            Some(ty) => ty,
            // column was removed by a schema upgrade; skip its data
            None => continue,
        };
        let value = match stored_value {
            StoredValue::Enc(envelope) => {
                let cipher = cipher.ok_or_else(|| {
                    DbError::DecryptFailed(format!(
                        "column '{column}' is encrypted but no key is configured"
                    ))
                })?;
                match cipher
                    .decrypt(envelope)
                    .and_then(|plain| Ok(bincode::deserialize::<StoredValue>(&plain)?))
                    .and_then(|inner| decode_value(&inner, ty, column))
                {
                    Ok(value) => value,
                    Err(err) => match mode {
                        DecryptFailureMode::Fail => return Err(err),
                        DecryptFailureMode::Mark => {
                            warn!(column = %column, error = %err, "field decrypt failed, marking");
                            Value::Json(serde_json::json!({
                                DECRYPT_ERROR_MARKER: err.to_string()
                            }))
                        }
                    },
                }
            }
            plain => decode_value(plain, ty, column)?,
        };
        row.set(column.clone(), value);
    }
    Ok(row)
}

/// Re-encrypt every envelope not already under the active key.
///
/// Returns `None` when the row has no stale envelopes, so rotation sweeps
/// can skip rewriting it.
pub fn reencrypt_row(bytes: &[u8], cipher: &FieldCipher) -> DbResult<Option<Vec<u8>>> {
    let mut stored = StoredRow::from_bytes(bytes)?;
    let active = cipher.active_key_id().to_string();
    let mut rewritten = false;
    for (_, value) in &mut stored.fields {
        if let StoredValue::Enc(envelope) = value {
            if envelope.k != active {
                let plaintext = cipher.decrypt(envelope)?;
                *envelope = cipher.encrypt(&plaintext)?;
                rewritten = true;
            }
        }
    }
    if rewritten {
        Ok(Some(stored.to_bytes()?))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;
    use indexmap::indexmap;

    fn secrets_def() -> TableDef {
        TableDef::new(
            "id",
            indexmap! {
                "id".to_string() => ColumnType::Str,
                "api_key".to_string() => ColumnType::Str,
                "created".to_string() => ColumnType::Date,
            },
        )
        .sensitive(&["api_key"])
    }

    #[test]
    fn test_roundtrip_without_encryption() {
        let def = TableDef::new(
            "id",
            indexmap! {
                "id".to_string() => ColumnType::Str,
                "score".to_string() => ColumnType::Num,
                "embedding".to_string() => ColumnType::Vector { dims: 3 },
                "meta".to_string() => ColumnType::Json,
            },
        );
        let row = Row::new()
            .with("id", Value::Str("r1".into()))
            .with("score", Value::Num(0.25))
            .with("embedding", Value::Vector(vec![0.1, 0.2, 0.3]))
            .with("meta", Value::Json(serde_json::json!({"b": 1, "a": 2})));

        let bytes = encode_row(&def, &row, None, 0, "dev").unwrap();
        let decoded = decode_row(&def, &bytes, None, DecryptFailureMode::Fail).unwrap();
        assert_eq!(decoded, row);
    }

    #[test]
    fn test_sensitive_column_never_stored_plain() {
        let def = secrets_def();
        let cipher = FieldCipher::new([3u8; 32]);
        let row = Row::new()
            .with("id", Value::Str("s1".into()))
            .with("api_key", Value::Str("top-secret-token".into()))
            .with("created", Value::Date(Utc.timestamp_millis_opt(1000).unwrap()));

        let bytes = encode_row(&def, &row, Some(&cipher), 0, "dev").unwrap();
        let raw = String::from_utf8_lossy(&bytes);
        assert!(!raw.contains("top-secret-token"));

        let stored = StoredRow::from_bytes(&bytes).unwrap();
        let api_key = &stored.fields.iter().find(|(c, _)| c == "api_key").unwrap().1;
        assert!(matches!(api_key, StoredValue::Enc(_)));

        let decoded = decode_row(&def, &bytes, Some(&cipher), DecryptFailureMode::Fail).unwrap();
        assert_eq!(
            decoded.get("api_key"),
            Some(&Value::Str("top-secret-token".into()))
        );
    }

    #[test]
    fn test_decrypt_mark_mode() {
        let def = secrets_def();
        let cipher = FieldCipher::new([3u8; 32]);
        let row = Row::new()
            .with("id", Value::Str("s1".into()))
            .with("api_key", Value::Str("k".into()))
            .with("created", Value::Date(Utc.timestamp_millis_opt(0).unwrap()));
        let bytes = encode_row(&def, &row, Some(&cipher), 0, "dev").unwrap();

        let wrong = FieldCipher::new([4u8; 32]);
        assert!(decode_row(&def, &bytes, Some(&wrong), DecryptFailureMode::Fail).is_err());

        let marked = decode_row(&def, &bytes, Some(&wrong), DecryptFailureMode::Mark).unwrap();
        match marked.get("api_key") {
            Some(Value::Json(j)) => assert!(j.get(DECRYPT_ERROR_MARKER).is_some()),
            other => panic!("expected marker, got {other:?}"),
        }
    }

    #[test]
    fn test_reencrypt_skips_current_key() {
        let def = secrets_def();
        let mut cipher = FieldCipher::new([1u8; 32]);
        let row = Row::new()
            .with("id", Value::Str("s1".into()))
            .with("api_key", Value::Str("k".into()))
            .with("created", Value::Date(Utc.timestamp_millis_opt(0).unwrap()));
        let bytes = encode_row(&def, &row, Some(&cipher), 0, "dev").unwrap();

        // No rotation pending: nothing to rewrite
        assert!(reencrypt_row(&bytes, &cipher).unwrap().is_none());

        cipher.activate([2u8; 32]);
        let rewritten = reencrypt_row(&bytes, &cipher).unwrap().unwrap();
        assert_ne!(rewritten, bytes);

        cipher.retire_inactive();
        let decoded =
            decode_row(&def, &rewritten, Some(&cipher), DecryptFailureMode::Fail).unwrap();
        assert_eq!(decoded.get("api_key"), Some(&Value::Str("k".into())));
    }
}
