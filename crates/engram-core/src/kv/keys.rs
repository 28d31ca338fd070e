//! Order-preserving key encoding
//!
//! Store keys are raw bytes compared lexicographically, so every value that
//! can act as a key (primary keys, secondary-index values) is encoded such
//! that byte order equals semantic order: a tag byte fixes the kind order,
//! integers and dates are big-endian with the sign bit flipped, floats use
//! the standard monotone bit trick, and strings/bytes are NUL-escaped and
//! self-terminating so concatenated composite keys stay unambiguous.

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{DbError, DbResult};
use crate::types::Value;

const TAG_NULL: u8 = 0x01;
const TAG_BOOL: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_NUM: u8 = 0x04;
const TAG_DATE: u8 = 0x05;
const TAG_STR: u8 = 0x06;
const TAG_BYTES: u8 = 0x07;

/// Encode a value as an order-preserving key
pub fn encode_key(value: &Value) -> DbResult<Vec<u8>> {
    let mut out = Vec::with_capacity(16);
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*b));
        }
        Value::Int(i) => {
            out.push(TAG_INT);
            out.extend_from_slice(&((*i as u64) ^ (1 << 63)).to_be_bytes());
        }
        Value::Num(n) => {
            out.push(TAG_NUM);
            out.extend_from_slice(&monotone_f64(*n).to_be_bytes());
        }
        Value::Date(d) => {
            out.push(TAG_DATE);
            out.extend_from_slice(&((d.timestamp_millis() as u64) ^ (1 << 63)).to_be_bytes());
        }
        Value::Str(s) => {
            out.push(TAG_STR);
            push_escaped(&mut out, s.as_bytes());
        }
        Value::Bytes(b) => {
            out.push(TAG_BYTES);
            push_escaped(&mut out, b);
        }
        Value::Json(_) | Value::Vector(_) => {
            return Err(DbError::InvalidOperator(
                "json and vector values cannot be used as keys".into(),
            ));
        }
    }
    Ok(out)
}

/// Decode a key produced by [`encode_key`], returning the value and the
/// number of bytes consumed
pub fn decode_key(bytes: &[u8]) -> DbResult<(Value, usize)> {
    let malformed = || DbError::Serialization("malformed key".into());
    let tag = *bytes.first().ok_or_else(malformed)?;
    match tag {
        TAG_NULL => Ok((Value::Null, 1)),
        TAG_BOOL => {
            let b = *bytes.get(1).ok_or_else(malformed)?;
            Ok((Value::Bool(b != 0), 2))
        }
        TAG_INT | TAG_DATE => {
            let raw: [u8; 8] = bytes
                .get(1..9)
                .ok_or_else(malformed)?
                .try_into()
                .map_err(|_| malformed())?;
            let i = (u64::from_be_bytes(raw) ^ (1 << 63)) as i64;
            if tag == TAG_INT {
                Ok((Value::Int(i), 9))
            } else {
                let date = Utc
                    .timestamp_millis_opt(i)
                    .single()
                    .ok_or_else(malformed)?;
                Ok((Value::Date(date), 9))
            }
        }
        TAG_NUM => {
            let raw: [u8; 8] = bytes
                .get(1..9)
                .ok_or_else(malformed)?
                .try_into()
                .map_err(|_| malformed())?;
            Ok((Value::Num(unmonotone_f64(u64::from_be_bytes(raw))), 9))
        }
        TAG_STR | TAG_BYTES => {
            let (payload, consumed) = pop_escaped(&bytes[1..]).ok_or_else(malformed)?;
            let value = if tag == TAG_STR {
                Value::Str(String::from_utf8(payload).map_err(|_| malformed())?)
            } else {
                Value::Bytes(payload)
            };
            Ok((value, consumed + 1))
        }
        _ => Err(malformed()),
    }
}

/// Composite key: `first` then `second`; both components self-delimiting
pub fn compose_key(first: &[u8], second: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(first.len() + second.len());
    out.extend_from_slice(first);
    out.extend_from_slice(second);
    out
}

/// Millisecond-epoch helper shared with the codec
pub fn date_from_millis(millis: i64) -> DbResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| DbError::Serialization(format!("invalid millisecond epoch {millis}")))
}

fn monotone_f64(v: f64) -> u64 {
    let bits = v.to_bits();
    if bits >> 63 == 1 {
        !bits
    } else {
        bits ^ (1 << 63)
    }
}

fn unmonotone_f64(bits: u64) -> f64 {
    if bits >> 63 == 1 {
        f64::from_bits(bits ^ (1 << 63))
    } else {
        f64::from_bits(!bits)
    }
}

// 0x00 in the payload becomes 0x00 0xFF; the terminator 0x00 0x01 sorts
// below every continuation, so prefixes order before their extensions.
fn push_escaped(out: &mut Vec<u8>, payload: &[u8]) {
    for &b in payload {
        if b == 0x00 {
            out.push(0x00);
            out.push(0xFF);
        } else {
            out.push(b);
        }
    }
    out.push(0x00);
    out.push(0x01);
}

fn pop_escaped(bytes: &[u8]) -> Option<(Vec<u8>, usize)> {
    let mut payload = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            0x00 => match bytes.get(i + 1)? {
                0x01 => return Some((payload, i + 2)),
                0xFF => {
                    payload.push(0x00);
                    i += 2;
                }
                _ => return None,
            },
            b => {
                payload.push(b);
                i += 1;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(v: Value) -> Vec<u8> {
        encode_key(&v).unwrap()
    }

    #[test]
    fn test_int_order_preserved() {
        let values = [-500i64, -1, 0, 1, 42, i64::MAX];
        let keys: Vec<_> = values.iter().map(|&i| key(Value::Int(i))).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_float_order_preserved() {
        let values = [-3.5f64, -0.0, 0.0, 0.25, 7.0, 1e12];
        let keys: Vec<_> = values.iter().map(|&n| key(Value::Num(n))).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_string_prefix_orders_first() {
        assert!(key(Value::Str("ab".into())) < key(Value::Str("abc".into())));
        assert!(key(Value::Str("a".into())) < key(Value::Str("a\u{0}".into())));
    }

    #[test]
    fn test_roundtrip() {
        for v in [
            Value::Int(-77),
            Value::Str("hello\u{0}world".into()),
            Value::Bytes(vec![0, 1, 2, 0]),
            Value::Bool(true),
            Value::Num(2.75),
        ] {
            let encoded = key(v.clone());
            let (decoded, consumed) = decode_key(&encoded).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(consumed, encoded.len());
        }
    }

    #[test]
    fn test_composite_decodes_both_parts() {
        let composite = compose_key(
            &key(Value::Str("alpha".into())),
            &key(Value::Str("pk-1".into())),
        );
        let (first, used) = decode_key(&composite).unwrap();
        let (second, _) = decode_key(&composite[used..]).unwrap();
        assert_eq!(first, Value::Str("alpha".into()));
        assert_eq!(second, Value::Str("pk-1".into()));
    }

    #[test]
    fn test_json_rejected_as_key() {
        assert!(encode_key(&Value::Json(serde_json::json!({}))).is_err());
    }
}
