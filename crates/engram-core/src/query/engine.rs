//! CRUD operations
//!
//! Every mutation runs in one transaction spanning the row store, all
//! affected index stores, and the change log; indexes are never out of step
//! with rows. After commit the mutated table's cache entries are dropped
//! and registered sync adapters are flushed (best effort).

use std::ops::Bound;

use tracing::{debug, instrument, warn};

use crate::codec::{decode_row, encode_row, StoredRow};
use crate::config::{BulkMode, EmbedderFailureMode};
use crate::db::Database;
use crate::error::{DbError, DbResult};
use crate::index;
use crate::kv::keys::encode_key;
use crate::kv::{Direction, KvRead};
use crate::query::{BulkFailure, BulkReport, FindOptions, SortDirection, WriteOptions};
use crate::schema::TableDef;
use crate::sync::{append_change, ChangeKind, ChangeRecord};
use crate::types::{Row, Value};

impl Database {
    /// Insert one row; returns its primary key
    pub async fn insert(&self, table: &str, row: Row) -> DbResult<Value> {
        self.insert_with(table, row, WriteOptions::default()).await
    }

    /// Insert one row with a deadline / cancellation control
    #[instrument(level = "debug", skip(self, row), fields(table = %table))]
    pub async fn insert_with(
        &self,
        table: &str,
        mut row: Row,
        opts: WriteOptions,
    ) -> DbResult<Value> {
        self.ensure_ready().await?;
        self.gate(opts.deadline.as_ref(), opts.cancel.as_ref())?;
        let def = self.table_def(table).await?;

        def.apply_defaults(&mut row);
        self.materialize_vector(table, &def, &mut row, None).await?;
        def.validate_row(&row)?;

        let pk = row
            .get(&def.primary_key)
            .cloned()
            .ok_or_else(|| DbError::ValidationFailed {
                column: def.primary_key.clone(),
                reason: "primary key is required".into(),
            })?;
        let pk_key = encode_key(&pk)?;

        let scope = Self::write_scope(table, &def);
        let scope_refs: Vec<&str> = scope.iter().map(String::as_str).collect();
        let cipher_guard = self.inner.cipher.read().await;
        let mut txn = self.inner.kv.write(&scope_refs).await?;

        if txn.get(table, &pk_key)?.is_some() {
            return Err(DbError::DuplicateKey {
                table: table.to_string(),
                key: pk.display_key(),
            });
        }

        let now_ms = self.now().timestamp_millis();
        let encoded = encode_row(
            &def,
            &row,
            cipher_guard.as_ref(),
            now_ms,
            self.device_id(),
        )?;
        txn.put(table, pk_key.clone(), encoded.clone())?;
        index::add_row(&mut txn, table, &def, &pk_key, &row, &self.inner.opts.stop_words)?;

        append_change(
            &mut txn,
            &ChangeRecord {
                seq: self.next_change_seq(),
                table: table.to_string(),
                kind: ChangeKind::Insert,
                pk: pk.clone(),
                before: None,
                after: Some(StoredRow::from_bytes(&encoded)?),
                committed_at: now_ms,
                origin_device_id: self.device_id().to_string(),
            },
        )?;

        self.gate(opts.deadline.as_ref(), opts.cancel.as_ref())?;
        drop(cipher_guard);
        txn.commit().await?;

        self.after_mutation(table).await;
        debug!(table = %table, pk = %pk.display_key(), "row inserted");
        Ok(pk)
    }

    /// Bulk insert.
    ///
    /// In the default all-or-nothing mode the first failure aborts the whole
    /// batch; in best-effort mode failed rows are reported and the rest
    /// commit within the same transaction.
    #[instrument(level = "debug", skip(self, rows), fields(table = %table, rows = rows.len()))]
    pub async fn insert_many(&self, table: &str, rows: Vec<Row>) -> DbResult<BulkReport> {
        self.insert_many_with(table, rows, WriteOptions::default())
            .await
    }

    /// Bulk insert with a deadline / cancellation control
    pub async fn insert_many_with(
        &self,
        table: &str,
        rows: Vec<Row>,
        opts: WriteOptions,
    ) -> DbResult<BulkReport> {
        self.ensure_ready().await?;
        self.gate(opts.deadline.as_ref(), opts.cancel.as_ref())?;
        let def = self.table_def(table).await?;
        let best_effort = self.inner.opts.bulk_mode == BulkMode::BestEffort;

        let scope = Self::write_scope(table, &def);
        let scope_refs: Vec<&str> = scope.iter().map(String::as_str).collect();
        let cipher_guard = self.inner.cipher.read().await;
        let mut txn = self.inner.kv.write(&scope_refs).await?;

        let mut report = BulkReport::default();
        for (position, mut row) in rows.into_iter().enumerate() {
            self.gate(opts.deadline.as_ref(), opts.cancel.as_ref())?;
            let outcome = async {
                def.apply_defaults(&mut row);
                self.materialize_vector(table, &def, &mut row, None).await?;
                def.validate_row(&row)?;

                let pk = row
                    .get(&def.primary_key)
                    .cloned()
                    .ok_or_else(|| DbError::ValidationFailed {
                        column: def.primary_key.clone(),
                        reason: "primary key is required".into(),
                    })?;
                let pk_key = encode_key(&pk)?;
                if txn.get(table, &pk_key)?.is_some() {
                    return Err(DbError::DuplicateKey {
                        table: table.to_string(),
                        key: pk.display_key(),
                    });
                }

                let now_ms = self.now().timestamp_millis();
                let encoded = encode_row(
                    &def,
                    &row,
                    cipher_guard.as_ref(),
                    now_ms,
                    self.device_id(),
                )?;
                txn.put(table, pk_key.clone(), encoded.clone())?;
                index::add_row(
                    &mut txn,
                    table,
                    &def,
                    &pk_key,
                    &row,
                    &self.inner.opts.stop_words,
                )?;
                append_change(
                    &mut txn,
                    &ChangeRecord {
                        seq: self.next_change_seq(),
                        table: table.to_string(),
                        kind: ChangeKind::Insert,
                        pk,
                        before: None,
                        after: Some(StoredRow::from_bytes(&encoded)?),
                        committed_at: now_ms,
                        origin_device_id: self.device_id().to_string(),
                    },
                )?;
                Ok(())
            }
            .await;

            match outcome {
                Ok(()) => report.inserted += 1,
                Err(error) if best_effort => {
                    warn!(table = %table, index = position, error = %error, "bulk row rejected");
                    report.failed.push(BulkFailure {
                        index: position,
                        error,
                    });
                }
                Err(error) => {
                    txn.abort();
                    return Err(error);
                }
            }
        }

        self.gate(opts.deadline.as_ref(), opts.cancel.as_ref())?;
        drop(cipher_guard);
        txn.commit().await?;
        self.after_mutation(table).await;
        Ok(report)
    }

    /// Merge `partial` into the row at `pk`; returns the updated row
    pub async fn update(&self, table: &str, pk: &Value, partial: Row) -> DbResult<Row> {
        self.update_with(table, pk, partial, WriteOptions::default())
            .await
    }

    /// Update with a deadline / cancellation control
    #[instrument(level = "debug", skip(self, partial), fields(table = %table))]
    pub async fn update_with(
        &self,
        table: &str,
        pk: &Value,
        partial: Row,
        opts: WriteOptions,
    ) -> DbResult<Row> {
        self.ensure_ready().await?;
        self.gate(opts.deadline.as_ref(), opts.cancel.as_ref())?;
        let def = self.table_def(table).await?;
        let pk_key = encode_key(pk)?;

        if let Some(new_pk) = partial.get(&def.primary_key) {
            if new_pk != pk {
                return Err(DbError::ValidationFailed {
                    column: def.primary_key.clone(),
                    reason: "primary key cannot be changed by update".into(),
                });
            }
        }

        let scope = Self::write_scope(table, &def);
        let scope_refs: Vec<&str> = scope.iter().map(String::as_str).collect();
        let cipher_guard = self.inner.cipher.read().await;
        let mut txn = self.inner.kv.write(&scope_refs).await?;

        let old_raw = txn.get(table, &pk_key)?.ok_or_else(|| DbError::NotFound {
            table: table.to_string(),
            key: pk.display_key(),
        })?;
        let old_stored = StoredRow::from_bytes(&old_raw)?;
        let old_row = crate::codec::decode_stored_row(
            &def,
            &old_stored,
            cipher_guard.as_ref(),
            self.inner.opts.decrypt_failure,
        )?;

        let mut merged = old_row.clone();
        let source_changed = def
            .vector
            .as_ref()
            .is_some_and(|spec| partial.fields.contains_key(&spec.source_field));
        let vector_given = def
            .vector
            .as_ref()
            .is_some_and(|spec| partial.fields.contains_key(&spec.vector_field));
        for (column, value) in &partial.fields {
            merged.set(column.clone(), value.clone());
        }
        if source_changed && !vector_given {
            self.materialize_vector(table, &def, &mut merged, Some(true))
                .await?;
        }
        def.validate_row(&merged)?;

        index::remove_row(
            &mut txn,
            table,
            &def,
            &pk_key,
            &old_row,
            &self.inner.opts.stop_words,
        )?;
        let now_ms = self.now().timestamp_millis();
        let encoded = encode_row(
            &def,
            &merged,
            cipher_guard.as_ref(),
            now_ms,
            self.device_id(),
        )?;
        txn.put(table, pk_key.clone(), encoded.clone())?;
        index::add_row(
            &mut txn,
            table,
            &def,
            &pk_key,
            &merged,
            &self.inner.opts.stop_words,
        )?;

        append_change(
            &mut txn,
            &ChangeRecord {
                seq: self.next_change_seq(),
                table: table.to_string(),
                kind: ChangeKind::Update,
                pk: pk.clone(),
                before: Some(old_stored),
                after: Some(StoredRow::from_bytes(&encoded)?),
                committed_at: now_ms,
                origin_device_id: self.device_id().to_string(),
            },
        )?;

        self.gate(opts.deadline.as_ref(), opts.cancel.as_ref())?;
        drop(cipher_guard);
        txn.commit().await?;
        self.after_mutation(table).await;
        Ok(merged)
    }

    /// Delete the row at `pk`
    pub async fn delete(&self, table: &str, pk: &Value) -> DbResult<()> {
        self.delete_with(table, pk, WriteOptions::default()).await
    }

    /// Delete with a deadline / cancellation control
    #[instrument(level = "debug", skip(self), fields(table = %table))]
    pub async fn delete_with(
        &self,
        table: &str,
        pk: &Value,
        opts: WriteOptions,
    ) -> DbResult<()> {
        self.ensure_ready().await?;
        self.gate(opts.deadline.as_ref(), opts.cancel.as_ref())?;
        let def = self.table_def(table).await?;
        let pk_key = encode_key(pk)?;

        let scope = Self::write_scope(table, &def);
        let scope_refs: Vec<&str> = scope.iter().map(String::as_str).collect();
        let cipher_guard = self.inner.cipher.read().await;
        let mut txn = self.inner.kv.write(&scope_refs).await?;

        let old_raw = txn.get(table, &pk_key)?.ok_or_else(|| DbError::NotFound {
            table: table.to_string(),
            key: pk.display_key(),
        })?;
        let old_stored = StoredRow::from_bytes(&old_raw)?;
        let old_row = crate::codec::decode_stored_row(
            &def,
            &old_stored,
            cipher_guard.as_ref(),
            self.inner.opts.decrypt_failure,
        )?;

        index::remove_row(
            &mut txn,
            table,
            &def,
            &pk_key,
            &old_row,
            &self.inner.opts.stop_words,
        )?;
        txn.delete(table, pk_key.clone())?;

        append_change(
            &mut txn,
            &ChangeRecord {
                seq: self.next_change_seq(),
                table: table.to_string(),
                kind: ChangeKind::Delete,
                pk: pk.clone(),
                before: Some(old_stored),
                after: None,
                committed_at: self.now().timestamp_millis(),
                origin_device_id: self.device_id().to_string(),
            },
        )?;

        self.gate(opts.deadline.as_ref(), opts.cancel.as_ref())?;
        drop(cipher_guard);
        txn.commit().await?;
        self.after_mutation(table).await;
        Ok(())
    }

    /// Merge partial rows into several existing rows inside one write
    /// transaction; used by access-stat bumps and consolidation
    pub(crate) async fn update_fields_batch(
        &self,
        table: &str,
        updates: Vec<(Value, Row)>,
    ) -> DbResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        self.ensure_ready().await?;
        let def = self.table_def(table).await?;

        let scope = Self::write_scope(table, &def);
        let scope_refs: Vec<&str> = scope.iter().map(String::as_str).collect();
        let cipher_guard = self.inner.cipher.read().await;
        let mut txn = self.inner.kv.write(&scope_refs).await?;

        for (pk, partial) in updates {
            let pk_key = encode_key(&pk)?;
            let old_raw = txn.get(table, &pk_key)?.ok_or_else(|| DbError::NotFound {
                table: table.to_string(),
                key: pk.display_key(),
            })?;
            let old_stored = StoredRow::from_bytes(&old_raw)?;
            let old_row = crate::codec::decode_stored_row(
                &def,
                &old_stored,
                cipher_guard.as_ref(),
                self.inner.opts.decrypt_failure,
            )?;
            let mut merged = old_row.clone();
            for (column, value) in &partial.fields {
                merged.set(column.clone(), value.clone());
            }
            def.validate_row(&merged)?;

            index::remove_row(
                &mut txn,
                table,
                &def,
                &pk_key,
                &old_row,
                &self.inner.opts.stop_words,
            )?;
            let now_ms = self.now().timestamp_millis();
            let encoded = encode_row(
                &def,
                &merged,
                cipher_guard.as_ref(),
                now_ms,
                self.device_id(),
            )?;
            txn.put(table, pk_key.clone(), encoded.clone())?;
            index::add_row(
                &mut txn,
                table,
                &def,
                &pk_key,
                &merged,
                &self.inner.opts.stop_words,
            )?;
            append_change(
                &mut txn,
                &ChangeRecord {
                    seq: self.next_change_seq(),
                    table: table.to_string(),
                    kind: ChangeKind::Update,
                    pk,
                    before: Some(old_stored),
                    after: Some(StoredRow::from_bytes(&encoded)?),
                    committed_at: now_ms,
                    origin_device_id: self.device_id().to_string(),
                },
            )?;
        }

        drop(cipher_guard);
        txn.commit().await?;
        self.after_mutation(table).await;
        Ok(())
    }

    /// Read one row by primary key
    pub async fn get(&self, table: &str, pk: &Value) -> DbResult<Option<Row>> {
        self.ensure_ready().await?;
        let def = self.table_def(table).await?;
        let pk_key = encode_key(pk)?;

        let cipher_guard = self.inner.cipher.read().await;
        let read = self.inner.kv.read().await;
        match read.get(table, &pk_key)? {
            Some(raw) => Ok(Some(decode_row(
                &def,
                &raw,
                cipher_guard.as_ref(),
                self.inner.opts.decrypt_failure,
            )?)),
            None => Ok(None),
        }
    }

    /// Read up to `limit` rows in primary-key order
    pub async fn get_all(&self, table: &str, limit: Option<usize>) -> DbResult<Vec<Row>> {
        self.ensure_ready().await?;
        let def = self.table_def(table).await?;

        let cipher_guard = self.inner.cipher.read().await;
        let read = self.inner.kv.read().await;
        let entries = read.scan(
            table,
            (Bound::Unbounded, Bound::Unbounded),
            Direction::Forward,
        )?;
        let take = limit.unwrap_or(usize::MAX);
        entries
            .into_iter()
            .take(take)
            .map(|(_, raw)| {
                decode_row(
                    &def,
                    &raw,
                    cipher_guard.as_ref(),
                    self.inner.opts.decrypt_failure,
                )
            })
            .collect()
    }

    /// Filtered, ordered, paginated read
    #[instrument(level = "debug", skip(self, options), fields(table = %table))]
    pub async fn find(&self, table: &str, options: FindOptions) -> DbResult<Vec<Row>> {
        self.ensure_ready().await?;
        self.gate(options.deadline.as_ref(), options.cancel.as_ref())?;
        let def = self.table_def(table).await?;

        let cipher_guard = self.inner.cipher.read().await;
        let read = self.inner.kv.read().await;

        let candidates = self.candidate_rows(&read, table, &def, options.filter.as_ref())?;
        let mut rows = Vec::new();
        for raw in candidates {
            let row = decode_row(
                &def,
                &raw,
                cipher_guard.as_ref(),
                self.inner.opts.decrypt_failure,
            )?;
            let keep = match &options.filter {
                Some(filter) => filter.matches(&row)?,
                None => true,
            };
            if keep {
                rows.push(row);
            }
        }

        if let Some(order) = &options.order_by {
            rows.sort_by(|a, b| {
                let ordering = match (a.get(&order.column), b.get(&order.column)) {
                    (Some(left), Some(right)) => left.cmp_semantic(right),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                };
                match order.direction {
                    SortDirection::Ascending => ordering,
                    SortDirection::Descending => ordering.reverse(),
                }
            });
        }

        let rows: Vec<Row> = rows
            .into_iter()
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    /// Row payloads to evaluate: an indexed equality narrows the scan to a
    /// secondary-index prefix, everything else is a full table scan
    fn candidate_rows<R: KvRead>(
        &self,
        read: &R,
        table: &str,
        def: &TableDef,
        filter: Option<&crate::query::Filter>,
    ) -> DbResult<Vec<Vec<u8>>> {
        if let Some(filter) = filter {
            for column in &def.indexes {
                if let Some(value) = filter.equality_on(column) {
                    let prefix = encode_key(value)?;
                    let upper = prefix_upper_bound(&prefix);
                    let entries = read.scan(
                        &index::secondary_store(table, column),
                        (Bound::Included(prefix), upper),
                        Direction::Forward,
                    )?;
                    debug!(table = %table, column = %column, hits = entries.len(), "index-assisted find");
                    let mut rows = Vec::with_capacity(entries.len());
                    for (_, pk_key) in entries {
                        if let Some(raw) = read.get(table, &pk_key)? {
                            rows.push(raw);
                        }
                    }
                    return Ok(rows);
                }
            }
        }
        Ok(read
            .scan(
                table,
                (Bound::Unbounded, Bound::Unbounded),
                Direction::Forward,
            )?
            .into_iter()
            .map(|(_, raw)| raw)
            .collect())
    }

    /// Fill the vector field from the registered embedder when the source
    /// text is present and no explicit vector was supplied
    pub(crate) async fn materialize_vector(
        &self,
        table: &str,
        def: &TableDef,
        row: &mut Row,
        force: Option<bool>,
    ) -> DbResult<()> {
        let Some(spec) = &def.vector else {
            return Ok(());
        };
        let has_vector = row.get_non_null(&spec.vector_field).is_some();
        if has_vector && force != Some(true) {
            // explicit vector: only check the dimension
            if let Some(vector) = row.get_non_null(&spec.vector_field).and_then(Value::as_vector)
            {
                if vector.len() != spec.dims {
                    return Err(DbError::DimensionMismatch {
                        expected: spec.dims,
                        actual: vector.len(),
                    });
                }
            }
            return Ok(());
        }
        let text = match row.get_non_null(&spec.source_field).and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => return Ok(()),
        };
        match self
            .inner
            .embedders
            .embed(table, &text, spec.dims)
            .await
        {
            Ok(Some(vector)) => {
                row.set(spec.vector_field.clone(), Value::Vector(vector));
                Ok(())
            }
            // no embedder: the row is stored without a vector entry
            Ok(None) => {
                if force == Some(true) {
                    row.set(spec.vector_field.clone(), Value::Null);
                }
                Ok(())
            }
            Err(err @ DbError::DimensionMismatch { .. }) => Err(err),
            Err(err) => match self.inner.opts.embedder_failure {
                EmbedderFailureMode::Strict => Err(err),
                EmbedderFailureMode::Lenient => {
                    warn!(table = %table, error = %err, "embedder failed; storing row without vector");
                    row.set(spec.vector_field.clone(), Value::Null);
                    Ok(())
                }
            },
        }
    }

    /// Post-commit bookkeeping shared by all mutations
    pub(crate) async fn after_mutation(&self, table: &str) {
        self.inner.cache.invalidate_table(table);
        if let Err(err) = self.flush_sync().await {
            warn!(error = %err, "post-commit sync flush failed");
        }
    }
}

/// Exclusive upper bound covering every key starting with `prefix`
fn prefix_upper_bound(prefix: &[u8]) -> Bound<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.last_mut() {
        if *last < u8::MAX {
            *last += 1;
            return Bound::Excluded(upper);
        }
        upper.pop();
    }
    Bound::Unbounded
}
