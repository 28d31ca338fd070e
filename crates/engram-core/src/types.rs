//! Core value and row types
//!
//! Rows are tagged variants over the column's semantic type; the schema
//! drives codec dispatch. Heterogeneous `serde_json::Value` maps only appear
//! inside `Json` columns, never at the row level.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Semantic column types supported by table schemas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// UTF-8 text
    Str,
    /// 64-bit float
    Num,
    /// 64-bit signed integer
    Int,
    /// Boolean flag
    Bool,
    /// Point in time, stored as millisecond epoch
    Date,
    /// Arbitrary JSON document, stored as canonical text
    Json,
    /// Raw bytes
    Bytes,
    /// Dense vector with a fixed dimension
    Vector {
        /// Declared dimension; vectors of any other length are rejected
        dims: usize,
    },
}

impl ColumnType {
    /// Human-readable name used in validation errors
    pub fn name(&self) -> &'static str {
        match self {
            Self::Str => "string",
            Self::Num => "number",
            Self::Int => "integer",
            Self::Bool => "boolean",
            Self::Date => "date",
            Self::Json => "json",
            Self::Bytes => "bytes",
            Self::Vector { .. } => "vector",
        }
    }

    /// Type-appropriate default used to backfill added columns
    pub fn default_value(&self) -> Value {
        match self {
            Self::Str => Value::Str(String::new()),
            Self::Num => Value::Num(0.0),
            Self::Int => Value::Int(0),
            Self::Bool => Value::Bool(false),
            Self::Date => Value::Date(DateTime::<Utc>::UNIX_EPOCH),
            Self::Json => Value::Json(serde_json::Value::Null),
            Self::Bytes => Value::Bytes(Vec::new()),
            Self::Vector { .. } => Value::Null,
        }
    }
}

/// A single typed cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
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
    /// Point in time
    Date(DateTime<Utc>),
    /// Arbitrary JSON document
    Json(serde_json::Value),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Dense vector
    Vector(Vec<f32>),
}

impl Value {
    /// Whether this value conforms to `ty`; `Null` conforms to everything
    /// (optionality is checked separately by the schema)
    pub fn conforms_to(&self, ty: &ColumnType) -> bool {
        match (self, ty) {
            (Self::Null, _) => true,
            (Self::Str(_), ColumnType::Str) => true,
            (Self::Num(_), ColumnType::Num) => true,
            (Self::Int(_), ColumnType::Int | ColumnType::Num) => true,
            (Self::Bool(_), ColumnType::Bool) => true,
            (Self::Date(_), ColumnType::Date) => true,
            (Self::Json(_), ColumnType::Json) => true,
            (Self::Bytes(_), ColumnType::Bytes) => true,
            (Self::Vector(v), ColumnType::Vector { dims }) => v.len() == *dims,
            _ => false,
        }
    }

    /// Text content, if this is a string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Vector content, if present
    pub fn as_vector(&self) -> Option<&[f32]> {
        match self {
            Self::Vector(v) => Some(v),
            _ => None,
        }
    }

    /// Numeric view shared by `Int` and `Num`
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Num(n) => Some(*n),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// True for `Null`
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Total order used by `find` comparisons and `order_by`.
    ///
    /// Values of different kinds order by kind; `Null` sorts first. Float
    /// NaN sorts after every other number so the order stays total.
    pub fn cmp_semantic(&self, other: &Self) -> Ordering {
        fn kind(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Bool(_) => 1,
                Value::Int(_) | Value::Num(_) => 2,
                Value::Date(_) => 3,
                Value::Str(_) => 4,
                Value::Bytes(_) => 5,
                Value::Json(_) => 6,
                Value::Vector(_) => 7,
            }
        }
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Date(a), Self::Date(b)) => a.cmp(b),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or_else(|| {
                    // NaN sorts last among numbers
                    if a.is_nan() && b.is_nan() {
                        Ordering::Equal
                    } else if a.is_nan() {
                        Ordering::Greater
                    } else {
                        Ordering::Less
                    }
                }),
                _ => kind(self).cmp(&kind(other)),
            },
        }
    }

    /// Display form used in error messages and log fields
    pub fn display_key(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Str(s) => s.clone(),
            Self::Num(n) => n.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Date(d) => d.timestamp_millis().to_string(),
            Self::Json(j) => j.to_string(),
            Self::Bytes(b) => format!("<{} bytes>", b.len()),
            Self::Vector(v) => format!("<{}-vector>", v.len()),
        }
    }
}

/// A database row: ordered mapping of column name to value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Column values in schema order
    pub fields: IndexMap<String, Value>,
}

impl Row {
    /// Empty row
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a column value, builder-style
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: Value) -> Self {
        self.fields.insert(column.into(), value);
        self
    }

    /// Set a column value
    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        self.fields.insert(column.into(), value);
    }

    /// Read a column value
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    /// Remove a column value
    pub fn remove(&mut self, column: &str) -> Option<Value> {
        self.fields.shift_remove(column)
    }

    /// Non-null lookup; `Null` reads as absent
    pub fn get_non_null(&self, column: &str) -> Option<&Value> {
        self.fields.get(column).filter(|v| !v.is_null())
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conformance() {
        assert!(Value::Str("a".into()).conforms_to(&ColumnType::Str));
        assert!(Value::Int(3).conforms_to(&ColumnType::Num));
        assert!(!Value::Num(3.5).conforms_to(&ColumnType::Int));
        assert!(Value::Null.conforms_to(&ColumnType::Bytes));
        assert!(Value::Vector(vec![0.0; 4]).conforms_to(&ColumnType::Vector { dims: 4 }));
        assert!(!Value::Vector(vec![0.0; 3]).conforms_to(&ColumnType::Vector { dims: 4 }));
    }

    #[test]
    fn test_semantic_order_mixed_numbers() {
        let a = Value::Int(2);
        let b = Value::Num(2.5);
        assert_eq!(a.cmp_semantic(&b), Ordering::Less);
        assert_eq!(b.cmp_semantic(&a), Ordering::Greater);
    }

    #[test]
    fn test_row_roundtrip_order() {
        let row = Row::new()
            .with("id", Value::Str("r1".into()))
            .with("score", Value::Num(0.5));
        let cols: Vec<&String> = row.fields.keys().collect();
        assert_eq!(cols, ["id", "score"]);
    }
}
