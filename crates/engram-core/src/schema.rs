//! Table definitions and row validation
//!
//! A schema is a set of table definitions keyed by table name. Definitions
//! are validated once at init; rows are validated against their definition
//! on every insert and update.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{DbError, DbResult};
use crate::types::{ColumnType, Row, Value};

/// Reason a per-row validator rejected a row
#[derive(Debug, Clone)]
pub struct ValidationRejection {
    /// Offending column
    pub column: String,
    /// Human-readable reason
    pub reason: String,
}

/// Per-row validation hook, run on insert and update
pub type Validator = Arc<dyn Fn(&Row) -> Result<(), ValidationRejection> + Send + Sync>;

/// Similarity metric for vector search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Cosine similarity over L2-normalized vectors
    #[default]
    Cosine,
}

/// Vector-field descriptor for a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorSpec {
    /// Column holding the vector; must be `ColumnType::Vector { dims }`
    pub vector_field: String,
    /// String column the embedding is computed from
    pub source_field: String,
    /// Declared dimension; ambiguity is rejected, there is no inference
    pub dims: usize,
    /// Similarity metric
    #[serde(default)]
    pub metric: Metric,
}

/// Table definition: columns, keys, search and encryption declarations
#[derive(Clone, Serialize, Deserialize)]
pub struct TableDef {
    /// Ordered column name to semantic type mapping
    pub columns: IndexMap<String, ColumnType>,
    /// Primary-key column; unique and non-null
    pub primary_key: String,
    /// Columns feeding the full-text inverted index
    #[serde(default)]
    pub searchable: Vec<String>,
    /// Optional vector descriptor
    #[serde(default)]
    pub vector: Option<VectorSpec>,
    /// Columns encrypted at rest
    #[serde(default)]
    pub sensitive: Vec<String>,
    /// User-declared secondary indexes
    #[serde(default)]
    pub indexes: Vec<String>,
    /// Columns that may be absent; absent values are backfilled with defaults
    #[serde(default)]
    pub optional: Vec<String>,
    /// Per-row validator hook; not persisted
    #[serde(skip)]
    pub validator: Option<Validator>,
}

impl std::fmt::Debug for TableDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableDef")
            .field("columns", &self.columns)
            .field("primary_key", &self.primary_key)
            .field("searchable", &self.searchable)
            .field("vector", &self.vector)
            .field("sensitive", &self.sensitive)
            .field("indexes", &self.indexes)
            .field("optional", &self.optional)
            .field("validator", &self.validator.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl TableDef {
    /// Minimal definition: columns plus primary key
    pub fn new(primary_key: impl Into<String>, columns: IndexMap<String, ColumnType>) -> Self {
        Self {
            columns,
            primary_key: primary_key.into(),
            searchable: Vec::new(),
            vector: None,
            sensitive: Vec::new(),
            indexes: Vec::new(),
            optional: Vec::new(),
            validator: None,
        }
    }

    /// Declare full-text-searchable columns, builder-style
    #[must_use]
    pub fn searchable(mut self, columns: &[&str]) -> Self {
        self.searchable = columns.iter().map(ToString::to_string).collect();
        self
    }

    /// Declare the vector descriptor
    #[must_use]
    pub fn vector(mut self, spec: VectorSpec) -> Self {
        self.vector = Some(spec);
        self
    }

    /// Declare encrypted-at-rest columns
    #[must_use]
    pub fn sensitive(mut self, columns: &[&str]) -> Self {
        self.sensitive = columns.iter().map(ToString::to_string).collect();
        self
    }

    /// Declare secondary indexes
    #[must_use]
    pub fn indexes(mut self, columns: &[&str]) -> Self {
        self.indexes = columns.iter().map(ToString::to_string).collect();
        self
    }

    /// Declare optional columns
    #[must_use]
    pub fn optional(mut self, columns: &[&str]) -> Self {
        self.optional = columns.iter().map(ToString::to_string).collect();
        self
    }

    /// Attach a per-row validator
    #[must_use]
    pub fn validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    fn require_column(&self, table: &str, column: &str, role: &str) -> DbResult<&ColumnType> {
        self.columns.get(column).ok_or_else(|| {
            DbError::InvalidConfig(format!(
                "table '{table}': {role} column '{column}' is not declared"
            ))
        })
    }

    /// Validate the definition itself; run once at init
    pub fn validate_definition(&self, table: &str) -> DbResult<()> {
        if self.columns.is_empty() {
            return Err(DbError::InvalidConfig(format!(
                "table '{table}' declares no columns"
            )));
        }
        let pk_type = self.require_column(table, &self.primary_key, "primary-key")?;
        if !matches!(pk_type, ColumnType::Str | ColumnType::Int) {
            return Err(DbError::InvalidConfig(format!(
                "table '{table}': primary key must be string or integer, got {}",
                pk_type.name()
            )));
        }
        if self.optional.contains(&self.primary_key) {
            return Err(DbError::InvalidConfig(format!(
                "table '{table}': primary key cannot be optional"
            )));
        }
        for column in &self.searchable {
            let ty = self.require_column(table, column, "searchable")?;
            if !matches!(ty, ColumnType::Str) {
                return Err(DbError::InvalidConfig(format!(
                    "table '{table}': searchable column '{column}' must be string"
                )));
            }
        }
        for column in &self.sensitive {
            self.require_column(table, column, "sensitive")?;
            if *column == self.primary_key {
                return Err(DbError::InvalidConfig(format!(
                    "table '{table}': primary key cannot be sensitive"
                )));
            }
            // plaintext terms in the inverted store would defeat the envelope
            if self.searchable.contains(column) {
                return Err(DbError::InvalidConfig(format!(
                    "table '{table}': sensitive column '{column}' cannot be searchable"
                )));
            }
        }
        for column in &self.indexes {
            self.require_column(table, column, "indexed")?;
            if self.sensitive.contains(column) {
                return Err(DbError::InvalidConfig(format!(
                    "table '{table}': sensitive column '{column}' cannot be indexed"
                )));
            }
        }
        if let Some(spec) = &self.vector {
            if spec.dims == 0 {
                return Err(DbError::InvalidConfig(format!(
                    "table '{table}': vector dims must be explicit and non-zero"
                )));
            }
            let vec_ty = self.require_column(table, &spec.vector_field, "vector")?;
            match vec_ty {
                ColumnType::Vector { dims } if *dims == spec.dims => {}
                ColumnType::Vector { dims } => {
                    return Err(DbError::InvalidConfig(format!(
                        "table '{table}': vector column '{}' declares {dims} dims, descriptor says {}",
                        spec.vector_field, spec.dims
                    )));
                }
                other => {
                    return Err(DbError::InvalidConfig(format!(
                        "table '{table}': vector column '{}' must be vector, got {}",
                        spec.vector_field,
                        other.name()
                    )));
                }
            }
            let src_ty = self.require_column(table, &spec.source_field, "vector-source")?;
            if !matches!(src_ty, ColumnType::Str) {
                return Err(DbError::InvalidConfig(format!(
                    "table '{table}': vector source '{}' must be string",
                    spec.source_field
                )));
            }
        }
        Ok(())
    }

    /// Fill absent optional columns with type defaults
    pub fn apply_defaults(&self, row: &mut Row) {
        for (column, ty) in &self.columns {
            if !row.fields.contains_key(column) && self.optional.contains(column) {
                row.set(column.clone(), ty.default_value());
            }
        }
    }

    /// Validate a row against this definition and the validator hook
    pub fn validate_row(&self, row: &Row) -> DbResult<()> {
        let pk = row.get_non_null(&self.primary_key).ok_or_else(|| {
            DbError::ValidationFailed {
                column: self.primary_key.clone(),
                reason: "primary key is required".to_string(),
            }
        })?;
        let pk_type = self.columns.get(&self.primary_key).ok_or_else(|| {
            DbError::ValidationFailed {
                column: self.primary_key.clone(),
                reason: "primary key column is not declared".to_string(),
            }
        })?;
        if !pk.conforms_to(pk_type) {
            return Err(DbError::ValidationFailed {
                column: self.primary_key.clone(),
                reason: format!("primary key must be {}", pk_type.name()),
            });
        }
        for (column, ty) in &self.columns {
            match row.get(column) {
                Some(value) => {
                    if !value.conforms_to(ty) {
                        return Err(DbError::ValidationFailed {
                            column: column.clone(),
                            reason: format!(
                                "expected {}, got incompatible value",
                                ty.name()
                            ),
                        });
                    }
                }
                None if self.optional.contains(column) => {}
                None => {
                    return Err(DbError::ValidationFailed {
                        column: column.clone(),
                        reason: "column is required".to_string(),
                    });
                }
            }
        }
        for column in row.fields.keys() {
            if !self.columns.contains_key(column) {
                return Err(DbError::ValidationFailed {
                    column: column.clone(),
                    reason: "column is not declared in the schema".to_string(),
                });
            }
        }
        if let Some(validator) = &self.validator {
            validator(row).map_err(|r| DbError::ValidationFailed {
                column: r.column,
                reason: r.reason,
            })?;
        }
        Ok(())
    }

    /// Whether the column participates in the inverted index
    pub fn is_searchable(&self, column: &str) -> bool {
        self.searchable.iter().any(|c| c == column)
    }

    /// Whether the column is encrypted at rest
    pub fn is_sensitive(&self, column: &str) -> bool {
        self.sensitive.iter().any(|c| c == column)
    }
}

/// Persisted schema descriptor: the declared table definitions of a schema
/// version (validators are runtime-only and not persisted)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    /// Schema version number
    pub version: u32,
    /// Table definitions
    pub tables: HashMap<String, TableDef>,
}

impl SchemaDescriptor {
    /// Snapshot the declared schema
    pub fn from_tables(version: u32, tables: &IndexMap<String, TableDef>) -> Self {
        Self {
            version,
            tables: tables
                .iter()
                .map(|(name, def)| (name.clone(), def.clone()))
                .collect(),
        }
    }
}

/// Whether index or encryption declarations differ, forcing a rebuild of
/// the table's auxiliary stores on upgrade
pub fn aux_config_changed(stored: &TableDef, requested: &TableDef) -> bool {
    stored.searchable != requested.searchable
        || stored.vector != requested.vector
        || stored.indexes != requested.indexes
        || stored.sensitive != requested.sensitive
}

/// Difference between a stored schema and the requested one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDiff {
    /// Tables to create
    pub added_tables: Vec<String>,
    /// Tables (and their index stores) to drop
    pub removed_tables: Vec<String>,
    /// Columns to backfill with defaults, per table
    pub added_columns: Vec<(String, String)>,
    /// Columns to drop from stored rows, per table
    pub removed_columns: Vec<(String, String)>,
}

/// Diff stored vs requested schema; changed column types are rejected
pub fn diff_schemas(
    stored: &SchemaDescriptor,
    requested: &IndexMap<String, TableDef>,
) -> DbResult<SchemaDiff> {
    let mut diff = SchemaDiff::default();
    for (name, def) in requested {
        match stored.tables.get(name) {
            None => diff.added_tables.push(name.clone()),
            Some(stored_def) => {
                let stored_cols = &stored_def.columns;
                for (column, ty) in &def.columns {
                    match stored_cols.get(column) {
                        None => diff.added_columns.push((name.clone(), column.clone())),
                        Some(stored_ty) if stored_ty != ty => {
                            return Err(DbError::IncompatibleSchemaChange {
                                table: name.clone(),
                                column: column.clone(),
                                reason: format!(
                                    "stored type {} cannot become {}",
                                    stored_ty.name(),
                                    ty.name()
                                ),
                            });
                        }
                        Some(_) => {}
                    }
                }
                for column in stored_cols.keys() {
                    if !def.columns.contains_key(column) {
                        diff.removed_columns.push((name.clone(), column.clone()));
                    }
                }
            }
        }
    }
    for name in stored.tables.keys() {
        if !requested.contains_key(name) {
            diff.removed_tables.push(name.clone());
        }
    }
    Ok(diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::indexmap;

    fn users() -> TableDef {
        TableDef::new(
            "id",
            indexmap! {
                "id".to_string() => ColumnType::Str,
                "name".to_string() => ColumnType::Str,
                "age".to_string() => ColumnType::Int,
            },
        )
        .searchable(&["name"])
        .optional(&["age"])
    }

    #[test]
    fn test_definition_accepts_valid() {
        users().validate_definition("users").unwrap();
    }

    #[test]
    fn test_definition_rejects_missing_pk_column() {
        let def = TableDef::new("missing", indexmap! { "id".to_string() => ColumnType::Str });
        assert!(matches!(
            def.validate_definition("t"),
            Err(DbError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_vector_dims_must_match_column() {
        let def = TableDef::new(
            "id",
            indexmap! {
                "id".to_string() => ColumnType::Str,
                "text".to_string() => ColumnType::Str,
                "embedding".to_string() => ColumnType::Vector { dims: 8 },
            },
        )
        .vector(VectorSpec {
            vector_field: "embedding".to_string(),
            source_field: "text".to_string(),
            dims: 16,
            metric: Metric::Cosine,
        });
        assert!(matches!(
            def.validate_definition("t"),
            Err(DbError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_row_validation_reports_column() {
        let def = users();
        let row = Row::new().with("id", Value::Str("u1".into()));
        let err = def.validate_row(&row).unwrap_err();
        match err {
            DbError::ValidationFailed { column, .. } => assert_eq!(column, "name"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_defaults_backfill_optional() {
        let def = users();
        let mut row = Row::new()
            .with("id", Value::Str("u1".into()))
            .with("name", Value::Str("Ada".into()));
        def.apply_defaults(&mut row);
        assert_eq!(row.get("age"), Some(&Value::Int(0)));
        def.validate_row(&row).unwrap();
    }

    #[test]
    fn test_diff_rejects_type_change() {
        let stored = SchemaDescriptor {
            version: 1,
            tables: [(
                "users".to_string(),
                TableDef::new(
                    "id",
                    indexmap! { "id".to_string() => ColumnType::Str, "age".to_string() => ColumnType::Str },
                ),
            )]
            .into_iter()
            .collect(),
        };
        let requested = indexmap! { "users".to_string() => users() };
        assert!(matches!(
            diff_schemas(&stored, &requested),
            Err(DbError::IncompatibleSchemaChange { .. })
        ));
    }
}
