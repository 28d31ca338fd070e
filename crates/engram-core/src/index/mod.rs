//! Index maintenance
//!
//! Every index is updated synchronously inside the mutating transaction:
//! primary (the row store itself), user-declared secondary indexes, the
//! inverted term index, and the vector index. Removal always precedes
//! re-insertion on update, so no dangling postings or stale entries survive
//! a commit.

pub mod text;
pub mod vector;

use crate::error::DbResult;
use crate::kv::keys::{compose_key, encode_key};
use crate::kv::WriteTxn;
use crate::schema::TableDef;
use crate::types::{Row, Value};

/// Store holding the rows of `table`
pub fn table_store(table: &str) -> String {
    table.to_string()
}

/// Store holding inverted postings for `table`
pub fn inverted_store(table: &str) -> String {
    format!("__inv_{table}")
}

/// Store holding vector entries for `table`
pub fn vector_store(table: &str) -> String {
    format!("__vec_{table}")
}

/// Store holding the secondary index on `table.column`
pub fn secondary_store(table: &str, column: &str) -> String {
    format!("__idx_{table}_{column}")
}

/// All stores a table owns, in creation order
pub fn stores_for_table(table: &str, def: &TableDef) -> Vec<String> {
    let mut stores = vec![table_store(table)];
    if !def.searchable.is_empty() {
        stores.push(inverted_store(table));
    }
    if def.vector.is_some() {
        stores.push(vector_store(table));
    }
    for column in &def.indexes {
        stores.push(secondary_store(table, column));
    }
    stores
}

fn searchable_text(def: &TableDef, row: &Row) -> Vec<(String, String)> {
    def.searchable
        .iter()
        .filter_map(|column| {
            row.get(column)
                .and_then(Value::as_str)
                .map(|text| (column.clone(), text.to_string()))
        })
        .collect()
}

/// Add a freshly written row to every index it participates in
pub fn add_row(
    txn: &mut WriteTxn,
    table: &str,
    def: &TableDef,
    pk_key: &[u8],
    row: &Row,
    stop_words: &[String],
) -> DbResult<()> {
    if !def.searchable.is_empty() {
        let fields = searchable_text(def, row);
        text::index_document(txn, &inverted_store(table), pk_key, &fields, stop_words)?;
    }

    if let Some(spec) = &def.vector {
        if let Some(vector) = row.get_non_null(&spec.vector_field).and_then(Value::as_vector) {
            vector::put_entry(txn, &vector_store(table), pk_key, vector, spec.dims)?;
        }
    }

    for column in &def.indexes {
        if let Some(value) = row.get_non_null(column) {
            let entry_key = compose_key(&encode_key(value)?, pk_key);
            txn.put(&secondary_store(table, column), entry_key, pk_key.to_vec())?;
        }
    }
    Ok(())
}

/// Remove a row from every index, given the row as it was stored
pub fn remove_row(
    txn: &mut WriteTxn,
    table: &str,
    def: &TableDef,
    pk_key: &[u8],
    old_row: &Row,
    stop_words: &[String],
) -> DbResult<()> {
    if !def.searchable.is_empty() {
        let fields = searchable_text(def, old_row);
        text::deindex_document(txn, &inverted_store(table), pk_key, &fields, stop_words)?;
    }

    if def.vector.is_some() {
        vector::remove_entry(txn, &vector_store(table), pk_key)?;
    }

    for column in &def.indexes {
        if let Some(value) = old_row.get_non_null(column) {
            let entry_key = compose_key(&encode_key(value)?, pk_key);
            txn.delete(&secondary_store(table, column), entry_key)?;
        }
    }
    Ok(())
}
