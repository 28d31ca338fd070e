//! Query types: filters, options, hits, and bulk reports
//!
//! The operator set is fixed: equality, the four range comparisons, `In`,
//! `Contains`, and the `And`/`Or` combinators. `Contains` is substring on
//! string columns and element membership on json arrays; anything else is
//! an [`DbError::InvalidOperator`].

pub mod engine;
pub mod search;

use std::cmp::Ordering;

use serde::Serialize;

use crate::clock::{CancelFlag, Deadline};
use crate::error::{DbError, DbResult};
use crate::types::{Row, Value};

/// Where-clause filter tree
#[derive(Debug, Clone)]
pub enum Filter {
    /// Column equals value
    Eq(String, Value),
    /// Column strictly less than value
    Lt(String, Value),
    /// Column less than or equal to value
    Lte(String, Value),
    /// Column strictly greater than value
    Gt(String, Value),
    /// Column greater than or equal to value
    Gte(String, Value),
    /// Column equals one of the values
    In(String, Vec<Value>),
    /// Substring on strings, element membership on json arrays
    Contains(String, Value),
    /// All conditions hold
    And(Vec<Filter>),
    /// At least one condition holds
    Or(Vec<Filter>),
}

impl Filter {
    /// Evaluate against a row
    pub fn matches(&self, row: &Row) -> DbResult<bool> {
        match self {
            Self::Eq(column, value) => Ok(row.get(column) == Some(value)),
            Self::Lt(column, value) => Ok(compare(row, column, value)
                .map(|o| o == Ordering::Less)
                .unwrap_or(false)),
            Self::Lte(column, value) => Ok(compare(row, column, value)
                .map(|o| o != Ordering::Greater)
                .unwrap_or(false)),
            Self::Gt(column, value) => Ok(compare(row, column, value)
                .map(|o| o == Ordering::Greater)
                .unwrap_or(false)),
            Self::Gte(column, value) => Ok(compare(row, column, value)
                .map(|o| o != Ordering::Less)
                .unwrap_or(false)),
            Self::In(column, values) => {
                Ok(row.get(column).is_some_and(|v| values.contains(v)))
            }
            Self::Contains(column, needle) => contains(row, column, needle),
            Self::And(filters) => {
                for filter in filters {
                    if !filter.matches(row)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Or(filters) => {
                for filter in filters {
                    if filter.matches(row)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    /// Equality constraint on `column`, if this filter pins one; used for
    /// secondary-index assisted lookups
    pub fn equality_on(&self, column: &str) -> Option<&Value> {
        match self {
            Self::Eq(c, v) if c == column => Some(v),
            Self::And(filters) => filters.iter().find_map(|f| f.equality_on(column)),
            _ => None,
        }
    }
}

// range comparisons only between comparable kinds; incomparable pairs
// simply do not match
fn compare(row: &Row, column: &str, value: &Value) -> Option<Ordering> {
    let lhs = row.get(column)?;
    let comparable = matches!(
        (lhs, value),
        (Value::Str(_), Value::Str(_))
            | (Value::Date(_), Value::Date(_))
            | (Value::Bytes(_), Value::Bytes(_))
            | (Value::Bool(_), Value::Bool(_))
            | (
                Value::Int(_) | Value::Num(_),
                Value::Int(_) | Value::Num(_)
            )
    );
    comparable.then(|| lhs.cmp_semantic(value))
}

fn contains(row: &Row, column: &str, needle: &Value) -> DbResult<bool> {
    let Some(haystack) = row.get(column) else {
        return Ok(false);
    };
    match haystack {
        Value::Str(text) => match needle {
            Value::Str(sub) => Ok(text.contains(sub.as_str())),
            other => Err(DbError::InvalidOperator(format!(
                "contains on a string column requires a string operand, got {}",
                other.display_key()
            ))),
        },
        Value::Json(serde_json::Value::Array(items)) => {
            let needle_json = value_to_json(needle)?;
            Ok(items.contains(&needle_json))
        }
        Value::Null => Ok(false),
        _ => Err(DbError::InvalidOperator(format!(
            "contains is not defined for column '{column}'"
        ))),
    }
}

fn value_to_json(value: &Value) -> DbResult<serde_json::Value> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Num(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .ok_or_else(|| {
                DbError::InvalidOperator("non-finite number cannot be matched".into())
            })?,
        Value::Json(j) => j.clone(),
        other => {
            return Err(DbError::InvalidOperator(format!(
                "{} cannot be matched against a json array",
                other.display_key()
            )))
        }
    })
}

/// Sort direction for `order_by`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    /// Smallest first
    #[default]
    Ascending,
    /// Largest first
    Descending,
}

/// Ordering clause
#[derive(Debug, Clone)]
pub struct OrderBy {
    /// Column to sort on
    pub column: String,
    /// Direction
    pub direction: SortDirection,
}

/// Options for [`crate::Database::find`]
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Where-clause
    pub filter: Option<Filter>,
    /// Ordering applied after filtering
    pub order_by: Option<OrderBy>,
    /// Maximum rows returned
    pub limit: Option<usize>,
    /// Rows skipped before the limit
    pub offset: usize,
    /// Optional deadline
    pub deadline: Option<Deadline>,
    /// Optional cancellation flag
    pub cancel: Option<CancelFlag>,
}

/// Options for mutating operations
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Optional deadline
    pub deadline: Option<Deadline>,
    /// Optional cancellation flag
    pub cancel: Option<CancelFlag>,
}

/// Options for [`crate::Database::search`]
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Maximum hits returned
    pub limit: usize,
    /// Skip the query cache for this call
    pub no_cache: bool,
    /// Optional deadline
    pub deadline: Option<Deadline>,
    /// Optional cancellation flag
    pub cancel: Option<CancelFlag>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            no_cache: false,
            deadline: None,
            cancel: None,
        }
    }
}

/// Query input for [`crate::Database::vector_search`]
#[derive(Debug, Clone)]
pub enum VectorQuery {
    /// Search by an explicit vector
    Vector(Vec<f32>),
    /// Embed the text through the table's registered embedder first
    Text(String),
}

/// Options for [`crate::Database::vector_search`]
#[derive(Debug, Clone)]
pub struct VectorSearchOptions {
    /// Maximum hits returned
    pub k: usize,
    /// Drop hits scoring below this cosine similarity
    pub threshold: Option<f32>,
    /// Skip the query cache for this call
    pub no_cache: bool,
    /// Optional deadline
    pub deadline: Option<Deadline>,
    /// Optional cancellation flag
    pub cancel: Option<CancelFlag>,
}

impl Default for VectorSearchOptions {
    fn default() -> Self {
        Self {
            k: 10,
            threshold: None,
            no_cache: false,
            deadline: None,
            cancel: None,
        }
    }
}

/// Options for [`crate::Database::hybrid_search`]
#[derive(Debug, Clone)]
pub struct HybridSearchOptions {
    /// Weight of the text score; the vector score gets `1 - alpha`
    pub alpha: f32,
    /// Maximum hits returned
    pub limit: usize,
    /// Drop hits with a combined score below this
    pub threshold: Option<f32>,
    /// Skip the query cache for this call
    pub no_cache: bool,
    /// Optional deadline
    pub deadline: Option<Deadline>,
    /// Optional cancellation flag
    pub cancel: Option<CancelFlag>,
}

impl Default for HybridSearchOptions {
    fn default() -> Self {
        Self {
            alpha: 0.5,
            limit: 10,
            threshold: None,
            no_cache: false,
            deadline: None,
            cancel: None,
        }
    }
}

/// One ranked result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    /// Primary key of the row
    pub pk: Value,
    /// Relevance score; meaning depends on the search kind
    pub score: f32,
    /// The decoded row
    pub row: Row,
}

/// One failed row in a best-effort bulk insert
#[derive(Debug)]
pub struct BulkFailure {
    /// Position in the submitted batch
    pub index: usize,
    /// Why the row was rejected
    pub error: DbError,
}

/// Outcome of a bulk insert
#[derive(Debug, Default)]
pub struct BulkReport {
    /// Rows written
    pub inserted: usize,
    /// Rows rejected (best-effort mode only)
    pub failed: Vec<BulkFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> Row {
        Row::new()
            .with("id", Value::Str("r1".into()))
            .with("age", Value::Int(30))
            .with("name", Value::Str("Ada Lovelace".into()))
            .with(
                "tags",
                Value::Json(serde_json::json!(["math", "pioneer"])),
            )
    }

    #[test]
    fn test_range_operators() {
        let r = row();
        assert!(Filter::Gt("age".into(), Value::Int(20)).matches(&r).unwrap());
        assert!(Filter::Lte("age".into(), Value::Int(30)).matches(&r).unwrap());
        assert!(!Filter::Lt("age".into(), Value::Int(30)).matches(&r).unwrap());
        // mixed int/float comparisons work
        assert!(Filter::Gt("age".into(), Value::Num(29.5)).matches(&r).unwrap());
    }

    #[test]
    fn test_contains_substring_and_membership() {
        let r = row();
        assert!(Filter::Contains("name".into(), Value::Str("Love".into()))
            .matches(&r)
            .unwrap());
        assert!(Filter::Contains("tags".into(), Value::Str("math".into()))
            .matches(&r)
            .unwrap());
        assert!(!Filter::Contains("tags".into(), Value::Str("physics".into()))
            .matches(&r)
            .unwrap());
    }

    #[test]
    fn test_contains_rejects_mismatched_types() {
        let r = row();
        assert!(matches!(
            Filter::Contains("age".into(), Value::Int(3)).matches(&r),
            Err(DbError::InvalidOperator(_))
        ));
        assert!(matches!(
            Filter::Contains("name".into(), Value::Int(3)).matches(&r),
            Err(DbError::InvalidOperator(_))
        ));
    }

    #[test]
    fn test_combinators() {
        let r = row();
        let filter = Filter::And(vec![
            Filter::Gte("age".into(), Value::Int(18)),
            Filter::Or(vec![
                Filter::Eq("name".into(), Value::Str("nobody".into())),
                Filter::In("id".into(), vec![Value::Str("r1".into())]),
            ]),
        ]);
        assert!(filter.matches(&r).unwrap());
    }

    #[test]
    fn test_equality_extraction() {
        let filter = Filter::And(vec![
            Filter::Gt("age".into(), Value::Int(10)),
            Filter::Eq("category".into(), Value::Str("work".into())),
        ]);
        assert_eq!(
            filter.equality_on("category"),
            Some(&Value::Str("work".into()))
        );
        assert_eq!(filter.equality_on("age"), None);
    }
}
