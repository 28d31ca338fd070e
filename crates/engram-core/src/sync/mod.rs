//! Sync change log and adapter plumbing
//!
//! Every committed mutating transaction appends one [`ChangeRecord`] to the
//! reserved `__changelog` store, keyed by a monotonic big-endian sequence.
//! Registered adapters are notified in commit order and acknowledge what
//! they have durably consumed; the log is truncated up to the minimum
//! acknowledged sequence. Transport failures never fail a user write: the
//! adapter moves to `error` and retries with exponential backoff driven by
//! the injected clock.

pub mod adapter;

use std::collections::HashMap;
use std::ops::Bound;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec::StoredRow;
use crate::db::{Database, CHANGELOG_STORE, K_ACKS, K_SEQ, META_STORE};
use crate::error::{DbError, DbResult};
use crate::kv::keys::encode_key;
use crate::kv::{Direction, WriteTxn};
use crate::types::Value;

pub use adapter::{AdapterHandle, AdapterState, SyncTransport};

/// Kind of mutation a change record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Row created
    Insert,
    /// Row replaced
    Update,
    /// Row removed
    Delete,
}

/// One committed mutation, as consumed by sync adapters.
///
/// `before`/`after` carry the stored (encoded, still-encrypted) row images;
/// sensitive plaintext never enters the change log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Monotonic per-database sequence
    pub seq: u64,
    /// Table the mutation hit
    pub table: String,
    /// Mutation kind
    pub kind: ChangeKind,
    /// Primary key of the affected row
    pub pk: Value,
    /// Stored row image before the mutation
    pub before: Option<StoredRow>,
    /// Stored row image after the mutation
    pub after: Option<StoredRow>,
    /// Commit time, millisecond epoch
    pub committed_at: i64,
    /// Device the mutation originated on
    pub origin_device_id: String,
}

/// Entry in the reserved device registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Device id
    pub device_id: String,
    /// First registration, millisecond epoch
    pub registered_at: i64,
    /// Last time the device opened the database
    pub last_seen: i64,
}

/// Stage a change record (and the bumped sequence) inside a mutation's
/// transaction, so the log entry commits atomically with the data
pub(crate) fn append_change(txn: &mut WriteTxn, record: &ChangeRecord) -> DbResult<()> {
    txn.put(
        CHANGELOG_STORE,
        record.seq.to_be_bytes().to_vec(),
        bincode::serialize(record)?,
    )?;
    txn.put(META_STORE, K_SEQ.to_vec(), bincode::serialize(&record.seq)?)?;
    Ok(())
}

impl Database {
    /// Register a sync adapter under a unique name; re-registration with
    /// the same name is a no-op.
    ///
    /// A previously persisted acknowledgement for the name is restored, so
    /// a reopened database does not re-deliver consumed records.
    pub async fn register_sync_adapter(
        &self,
        name: &str,
        transport: std::sync::Arc<dyn SyncTransport>,
    ) -> DbResult<()> {
        if !self.inner.opts.sync.enabled {
            return Err(DbError::InvalidConfig(
                "sync is disabled for this database".into(),
            ));
        }
        if self.inner.adapters.contains_key(name) {
            debug!(adapter = %name, "adapter already registered; ignoring");
            return Ok(());
        }
        let max_backoff_ms = if self.inner.opts.sync.max_backoff_ms == 0 {
            adapter::DEFAULT_MAX_BACKOFF_MS
        } else {
            self.inner.opts.sync.max_backoff_ms
        };
        let handle = AdapterHandle::new(name, transport, max_backoff_ms);
        if let Some(acked) = self.persisted_acks().await?.get(name) {
            handle.restore_ack(*acked);
        }
        self.inner
            .adapters
            .insert(name.to_string(), std::sync::Arc::new(handle));
        Ok(())
    }

    /// Adapter names currently registered
    pub fn sync_adapters(&self) -> Vec<String> {
        self.inner.adapters.iter().map(|a| a.key().clone()).collect()
    }

    /// Push pending change records to every registered adapter.
    ///
    /// Called after each committed mutation and from `close`. Failures move
    /// the adapter into the `error` state with backoff; they are never
    /// surfaced to the writer.
    pub async fn flush_sync(&self) -> DbResult<()> {
        if self.inner.adapters.is_empty() {
            return Ok(());
        }
        let now_ms = self.now().timestamp_millis();
        let adapters: Vec<std::sync::Arc<AdapterHandle>> = self
            .inner
            .adapters
            .iter()
            .map(|a| std::sync::Arc::clone(&a))
            .collect();

        let flushes = adapters.iter().map(|handle| async move {
            let since = handle.acked_seq();
            let pending = match self.changes_since(since).await {
                Ok(pending) => pending,
                Err(err) => {
                    warn!(adapter = %handle.name(), error = %err, "change log read failed");
                    return;
                }
            };
            if pending.is_empty() {
                return;
            }
            if let Some(new_ack) = handle.deliver(&pending, now_ms).await {
                if let Err(err) = self.persist_ack(handle.name(), new_ack).await {
                    warn!(adapter = %handle.name(), error = %err, "ack persist failed");
                }
            }
        });
        futures::future::join_all(flushes).await;

        self.truncate_changelog().await
    }

    /// Stop one adapter: back to `idle`, backoff cleared
    pub fn stop_sync_adapter(&self, name: &str) {
        if let Some(handle) = self.inner.adapters.get(name) {
            handle.stop();
        }
    }

    /// Change records with sequence strictly greater than `since`
    pub async fn changes_since(&self, since: u64) -> DbResult<Vec<ChangeRecord>> {
        let read = self.inner.kv.read().await;
        let entries = read.scan(
            CHANGELOG_STORE,
            (
                Bound::Excluded(since.to_be_bytes().to_vec()),
                Bound::Unbounded,
            ),
            Direction::Forward,
        )?;
        entries
            .into_iter()
            .map(|(_, raw)| Ok(bincode::deserialize(&raw)?))
            .collect()
    }

    /// Apply a change record received from another device.
    ///
    /// Conflict policy: last-writer-wins on commit time with a
    /// deterministic device-id tiebreak; the losing side is logged.
    pub async fn apply_remote_change(&self, record: &ChangeRecord) -> DbResult<()> {
        self.ensure_ready().await?;
        let def = self.table_def(&record.table).await?;
        let pk_key = encode_key(&record.pk)?;

        let scope = Self::write_scope(&record.table, &def);
        let scope_refs: Vec<&str> = scope.iter().map(String::as_str).collect();

        let cipher_guard = self.inner.cipher.read().await;
        let cipher = cipher_guard.as_ref();

        let mut txn = self.inner.kv.write(&scope_refs).await?;

        let local = txn.get(&record.table, &pk_key)?;
        if let Some(raw) = &local {
            let stored = StoredRow::from_bytes(raw)?;
            let remote_wins = match stored.committed_at.cmp(&record.committed_at) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Greater => false,
                std::cmp::Ordering::Equal => stored.device_id < record.origin_device_id,
            };
            if !remote_wins {
                warn!(
                    table = %record.table,
                    pk = %record.pk.display_key(),
                    local_at = stored.committed_at,
                    remote_at = record.committed_at,
                    "sync conflict resolved in favor of local row"
                );
                txn.abort();
                return Ok(());
            }
            // remote wins: drop the local image from the indexes first
            let old_row = crate::codec::decode_stored_row(
                &def,
                &stored,
                cipher,
                self.inner.opts.decrypt_failure,
            )?;
            crate::index::remove_row(
                &mut txn,
                &record.table,
                &def,
                &pk_key,
                &old_row,
                &self.inner.opts.stop_words,
            )?;
        }

        match (&record.kind, &record.after) {
            (ChangeKind::Delete, _) | (_, None) => {
                txn.delete(&record.table, pk_key.clone())?;
            }
            (_, Some(after)) => {
                let row = crate::codec::decode_stored_row(
                    &def,
                    after,
                    cipher,
                    self.inner.opts.decrypt_failure,
                )?;
                txn.put(&record.table, pk_key.clone(), after.to_bytes()?)?;
                crate::index::add_row(
                    &mut txn,
                    &record.table,
                    &def,
                    &pk_key,
                    &row,
                    &self.inner.opts.stop_words,
                )?;
            }
        }
        drop(cipher_guard);
        txn.commit().await?;
        self.inner.cache.invalidate_table(&record.table);
        Ok(())
    }

    async fn persist_ack(&self, adapter: &str, seq: u64) -> DbResult<()> {
        let mut txn = self.inner.kv.write(&[META_STORE]).await?;
        let mut acks: HashMap<String, u64> = match txn.get(META_STORE, K_ACKS)? {
            Some(raw) => bincode::deserialize(&raw)?,
            None => HashMap::new(),
        };
        acks.insert(adapter.to_string(), seq);
        txn.put(META_STORE, K_ACKS.to_vec(), bincode::serialize(&acks)?)?;
        txn.commit().await?;
        Ok(())
    }

    /// Acked sequences per adapter, as persisted
    pub(crate) async fn persisted_acks(&self) -> DbResult<HashMap<String, u64>> {
        let read = self.inner.kv.read().await;
        Ok(match read.get(META_STORE, K_ACKS)? {
            Some(raw) => bincode::deserialize(&raw)?,
            None => HashMap::new(),
        })
    }

    /// Drop change records every registered adapter has acknowledged
    async fn truncate_changelog(&self) -> DbResult<()> {
        if self.inner.adapters.is_empty() {
            return Ok(());
        }
        let min_ack = self
            .inner
            .adapters
            .iter()
            .map(|a| a.acked_seq())
            .min()
            .unwrap_or(0);
        if min_ack == 0 {
            return Ok(());
        }
        let mut txn = self.inner.kv.write(&[CHANGELOG_STORE]).await?;
        let stale = txn.scan(
            CHANGELOG_STORE,
            (
                Bound::Unbounded,
                Bound::Included(min_ack.to_be_bytes().to_vec()),
            ),
            Direction::Forward,
        )?;
        let dropped = stale.len();
        for (key, _) in stale {
            txn.delete(CHANGELOG_STORE, key)?;
        }
        txn.commit().await?;
        if dropped > 0 {
            debug!(dropped, min_ack, "change log truncated");
        }
        Ok(())
    }
}
