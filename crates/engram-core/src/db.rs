//! Database facade: lifecycle, schema upgrade, and shared engine state
//!
//! `Database` is a cheap-to-clone handle over one open database. Opening
//! acquires the single-writer lock, bootstraps the reserved stores, derives
//! the encryption key, applies any pending schema upgrade, resumes an
//! interrupted key rotation, and registers this device when sync is on.
//!
//! Lifecycle: `opening -> ready -> (rotating) -> closed`. Mutations outside
//! `ready`/`rotating` fail with [`DbError::NotReady`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use indexmap::IndexMap;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cache::QueryCache;
use crate::clock::{check_deadline, CancelFlag, Clock, Deadline};
use crate::codec::{decode_stored_row, encode_row, StoredRow};
use crate::config::{
    BulkMode, DbConfig, DecryptFailureMode, EmbedderFailureMode, KdfParams, SyncConfig,
};
use crate::crypto::{self, FieldCipher, SALT_LEN};
use crate::embed::{Embedder, EmbedderRegistry};
use crate::error::{DbError, DbResult};
use crate::index;
use crate::kv::keys::encode_key;
use crate::kv::{KvEngine, WriteTxn};
use crate::schema::{aux_config_changed, diff_schemas, SchemaDescriptor, TableDef};
use crate::sync::AdapterHandle;
use crate::types::Value;

/// Reserved metadata store
pub(crate) const META_STORE: &str = "__meta";
/// Reserved append-only change log store
pub(crate) const CHANGELOG_STORE: &str = "__changelog";
/// Reserved device registry store
pub(crate) const DEVICES_STORE: &str = "__devices";

pub(crate) const K_SCHEMA: &[u8] = b"schema";
pub(crate) const K_SALT: &[u8] = b"kdf_salt";
pub(crate) const K_DEVICE: &[u8] = b"device_id";
pub(crate) const K_SEQ: &[u8] = b"change_seq";
pub(crate) const K_RING: &[u8] = b"key_ring";
pub(crate) const K_ROTATION: &[u8] = b"rotation";
pub(crate) const K_ACKS: &[u8] = b"sync_acks";

/// Facade lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbState {
    /// Handle constructed, upgrade still running
    Opening,
    /// Accepting operations
    Ready,
    /// Accepting operations; a key rotation sweep is running
    Rotating,
    /// Closed; all operations fail with `NotReady`
    Closed,
}

/// Runtime options distilled from [`DbConfig`]
#[derive(Debug, Clone)]
pub(crate) struct RuntimeOptions {
    pub(crate) name: String,
    pub(crate) bulk_mode: BulkMode,
    pub(crate) embedder_failure: EmbedderFailureMode,
    pub(crate) decrypt_failure: DecryptFailureMode,
    pub(crate) rotation_batch: usize,
    pub(crate) stop_words: Vec<String>,
    pub(crate) sync: SyncConfig,
    pub(crate) kdf: KdfParams,
}

pub(crate) struct DbInner {
    pub(crate) kv: KvEngine,
    pub(crate) state: RwLock<DbState>,
    pub(crate) tables: RwLock<IndexMap<String, TableDef>>,
    pub(crate) cipher: RwLock<Option<FieldCipher>>,
    pub(crate) rotation: Mutex<()>,
    pub(crate) cache: QueryCache,
    pub(crate) embedders: EmbedderRegistry,
    pub(crate) adapters: DashMap<String, Arc<AdapterHandle>>,
    pub(crate) change_seq: AtomicU64,
    pub(crate) device_id: String,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) opts: RuntimeOptions,
    pub(crate) kdf_salt: [u8; SALT_LEN],
}

impl std::fmt::Debug for DbInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbInner")
            .field("name", &self.opts.name)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

/// Handle to one open database; clone freely, all clones share state
#[derive(Debug, Clone)]
pub struct Database {
    pub(crate) inner: Arc<DbInner>,
}

/// Persisted rotation marker: the target key id plus the prior ring keys
/// wrapped under the target key, so a crashed sweep can resume on reopen
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub(crate) struct RotationState {
    pub(crate) target: String,
    pub(crate) wrapped: Vec<(String, crate::crypto::Envelope)>,
}

impl Database {
    /// Open (or create) a database and bring it to `ready`
    #[instrument(level = "info", skip_all, fields(name = %config.name, version = config.version))]
    pub async fn open(config: DbConfig) -> DbResult<Self> {
        config.validate()?;

        let wants_encryption = config.schema.values().any(|def| !def.sensitive.is_empty());
        if wants_encryption && config.encryption_key.is_none() {
            return Err(DbError::InvalidConfig(
                "schema declares sensitive columns but no encryption key was supplied".into(),
            ));
        }

        let kv = KvEngine::open(&config.dir, &config.name, config.upgrade_wait_ms).await?;

        // bootstrap reserved stores
        let existing = kv.store_names().await;
        if !existing.iter().any(|s| s == META_STORE) {
            let mut txn = kv.write_structural().await;
            txn.create_store(META_STORE);
            txn.create_store(CHANGELOG_STORE);
            txn.commit().await?;
        }

        // per-database salt, device id, change sequence
        let (kdf_salt, device_id, change_seq) = {
            let read = kv.read().await;
            let salt = read.get(META_STORE, K_SALT)?;
            let device = read.get(META_STORE, K_DEVICE)?;
            let seq = read.get(META_STORE, K_SEQ)?;
            (salt, device, seq)
        };
        let (kdf_salt, device_id, change_seq) = {
            let mut txn = kv.write(&[META_STORE]).await?;
            let salt: [u8; SALT_LEN] = match kdf_salt {
                Some(raw) => raw.try_into().map_err(|_| {
                    DbError::Serialization("stored kdf salt has the wrong length".into())
                })?,
                None => {
                    let salt = crypto::generate_salt();
                    txn.put(META_STORE, K_SALT.to_vec(), salt.to_vec())?;
                    salt
                }
            };
            let device = match device_id {
                Some(raw) => String::from_utf8(raw)
                    .map_err(|_| DbError::Serialization("stored device id is not utf-8".into()))?,
                None => {
                    let device = Uuid::new_v4().to_string();
                    txn.put(META_STORE, K_DEVICE.to_vec(), device.clone().into_bytes())?;
                    device
                }
            };
            let seq = match change_seq {
                Some(raw) => bincode::deserialize::<u64>(&raw)?,
                None => 0,
            };
            txn.commit().await?;
            (salt, device, seq)
        };

        // key derivation before the upgrade: backfill may need to encrypt
        let cipher = match &config.encryption_key {
            Some(source) => {
                let key = crypto::derive_key(source, &kdf_salt, &config.kdf)?;
                Some(FieldCipher::new(key))
            }
            None => None,
        };

        let opts = RuntimeOptions {
            name: config.name.clone(),
            bulk_mode: config.bulk_mode,
            embedder_failure: config.embedder_failure,
            decrypt_failure: config.decrypt_failure,
            rotation_batch: config.rotation_batch,
            stop_words: config.stop_words.clone(),
            sync: config.sync.clone(),
            kdf: config.kdf,
        };

        let db = Self {
            inner: Arc::new(DbInner {
                kv,
                state: RwLock::new(DbState::Opening),
                tables: RwLock::new(config.schema.clone()),
                cipher: RwLock::new(cipher),
                rotation: Mutex::new(()),
                cache: QueryCache::new(config.cache_max_entries, config.cache_duration_ms),
                embedders: EmbedderRegistry::default(),
                adapters: DashMap::new(),
                change_seq: AtomicU64::new(change_seq),
                device_id,
                clock: Arc::clone(&config.clock),
                opts,
                kdf_salt,
            }),
        };

        db.upgrade_schema(&config).await?;
        db.resume_rotation_if_pending().await?;

        if config.sync.enabled && config.sync.auto_register_devices {
            db.ensure_device_registered().await?;
        }

        *db.inner.state.write().await = DbState::Ready;
        info!(device = %db.inner.device_id, "database ready");
        Ok(db)
    }

    /// Idempotent init: a no-op on a ready handle
    pub async fn initialize(&self) -> DbResult<()> {
        self.ensure_ready().await
    }

    /// Current lifecycle state
    pub async fn state(&self) -> DbState {
        *self.inner.state.read().await
    }

    /// Device id assigned to this database instance
    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    /// Register an embedder for a vector-bearing table.
    ///
    /// The embedder's declared dimension must match the table descriptor.
    pub async fn register_embedder(
        &self,
        table: &str,
        embedder: Arc<dyn Embedder>,
    ) -> DbResult<()> {
        let def = self.table_def(table).await?;
        let spec = def.vector.as_ref().ok_or_else(|| {
            DbError::InvalidConfig(format!("table '{table}' declares no vector field"))
        })?;
        if embedder.dims() != spec.dims {
            return Err(DbError::DimensionMismatch {
                expected: spec.dims,
                actual: embedder.dims(),
            });
        }
        self.inner.embedders.register(table, embedder);
        Ok(())
    }

    /// Close: drain writers, flush sync adapters, persist a snapshot and
    /// zero key material. Idempotent.
    #[instrument(level = "info", skip(self))]
    pub async fn close(&self) -> DbResult<()> {
        {
            let mut state = self.inner.state.write().await;
            if *state == DbState::Closed {
                return Ok(());
            }
            *state = DbState::Closed;
        }
        // flush is best-effort; a dead transport must not block close
        if let Err(err) = self.flush_sync().await {
            warn!(error = %err, "sync flush on close failed");
        }
        // with no consumers the change log has no reason to outlive the handle
        if self.inner.adapters.is_empty() {
            use std::ops::Bound;
            let mut txn = self.inner.kv.write(&[CHANGELOG_STORE]).await?;
            let all = txn.scan(
                CHANGELOG_STORE,
                (Bound::Unbounded, Bound::Unbounded),
                crate::kv::Direction::Forward,
            )?;
            for (key, _) in all {
                txn.delete(CHANGELOG_STORE, key)?;
            }
            txn.commit().await?;
        }
        self.inner.kv.flush().await?;
        self.inner.kv.release_lock();
        self.inner.cache.clear();
        // dropping the ring zeroizes key material
        *self.inner.cipher.write().await = None;
        info!("database closed");
        Ok(())
    }

    /// Raw stored bytes of one row, exactly as persisted (sensitive columns
    /// still enveloped). Diagnostic surface used by tooling and tests.
    pub async fn stored_row_bytes(&self, table: &str, pk: &Value) -> DbResult<Option<Vec<u8>>> {
        self.ensure_ready().await?;
        let pk_key = encode_key(pk)?;
        let read = self.inner.kv.read().await;
        read.get(table, &pk_key)
    }

    /// The vector-index entry for one row, if present. Diagnostic surface.
    pub async fn vector_index_entry(
        &self,
        table: &str,
        pk: &Value,
    ) -> DbResult<Option<Vec<f32>>> {
        self.ensure_ready().await?;
        let pk_key = encode_key(pk)?;
        let read = self.inner.kv.read().await;
        match read.get(&index::vector_store(table), &pk_key)? {
            Some(packed) => Ok(Some(crate::codec::unpack_vector(&packed)?)),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // shared helpers for the engine modules
    // ------------------------------------------------------------------

    pub(crate) async fn ensure_ready(&self) -> DbResult<()> {
        match *self.inner.state.read().await {
            DbState::Ready | DbState::Rotating => Ok(()),
            _ => Err(DbError::NotReady),
        }
    }

    pub(crate) fn gate(
        &self,
        deadline: Option<&Deadline>,
        cancel: Option<&CancelFlag>,
    ) -> DbResult<()> {
        check_deadline(deadline, self.inner.clock.as_ref())?;
        if let Some(cancel) = cancel {
            cancel.check()?;
        }
        Ok(())
    }

    /// Definition for a user table
    pub(crate) async fn table_def(&self, table: &str) -> DbResult<TableDef> {
        self.inner
            .tables
            .read()
            .await
            .get(table)
            .cloned()
            .ok_or_else(|| DbError::NotFound {
                table: table.to_string(),
                key: "<table>".to_string(),
            })
    }

    /// Stores a mutation on `table` may touch, including the change log
    pub(crate) fn write_scope(table: &str, def: &TableDef) -> Vec<String> {
        let mut scope = index::stores_for_table(table, def);
        scope.push(CHANGELOG_STORE.to_string());
        scope.push(META_STORE.to_string());
        scope
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub(crate) fn next_change_seq(&self) -> u64 {
        self.inner.change_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn current_change_seq(&self) -> u64 {
        self.inner.change_seq.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // open-time phases
    // ------------------------------------------------------------------

    async fn upgrade_schema(&self, config: &DbConfig) -> DbResult<()> {
        let stored_version = self.inner.kv.version().await;
        if stored_version == 0 {
            return self.create_initial_schema(config).await;
        }
        if config.version < stored_version {
            return Err(DbError::InvalidConfig(format!(
                "requested schema version {} is below stored version {stored_version}",
                config.version
            )));
        }

        let stored: SchemaDescriptor = {
            let read = self.inner.kv.read().await;
            let raw = read.get(META_STORE, K_SCHEMA)?.ok_or_else(|| {
                DbError::Serialization("schema descriptor missing from metadata".into())
            })?;
            bincode::deserialize(&raw)?
        };

        let diff = diff_schemas(&stored, &config.schema)?;
        let aux_rebuilds: Vec<String> = config
            .schema
            .iter()
            .filter(|(name, def)| {
                stored
                    .tables
                    .get(name.as_str())
                    .is_some_and(|old| aux_config_changed(old, def))
            })
            .map(|(name, _)| name.clone())
            .collect();

        if config.version == stored_version {
            if diff != crate::schema::SchemaDiff::default() || !aux_rebuilds.is_empty() {
                return Err(DbError::InvalidConfig(
                    "schema changed without a version bump".into(),
                ));
            }
            return Ok(());
        }

        info!(
            from = stored_version,
            to = config.version,
            added = diff.added_tables.len(),
            removed = diff.removed_tables.len(),
            "upgrading schema"
        );

        let mut txn = self.inner.kv.write_structural().await;

        for table in &diff.added_tables {
            if let Some(def) = config.schema.get(table) {
                for store in index::stores_for_table(table, def) {
                    txn.create_store(&store);
                }
            }
        }
        for table in &diff.removed_tables {
            if let Some(old_def) = stored.tables.get(table) {
                for store in index::stores_for_table(table, old_def) {
                    txn.drop_store(&store);
                }
            }
        }

        // tables whose rows or auxiliary stores must be rewritten
        let mut rewrite: Vec<String> = aux_rebuilds;
        for (table, _) in diff.added_columns.iter().chain(diff.removed_columns.iter()) {
            if !rewrite.contains(table) {
                rewrite.push(table.clone());
            }
        }
        for table in &rewrite {
            let Some(def) = config.schema.get(table) else {
                continue;
            };
            let old_def = stored.tables.get(table);
            self.rewrite_table(&mut txn, table, def, old_def).await?;
        }

        txn.set_version(config.version);
        let descriptor = SchemaDescriptor::from_tables(config.version, &config.schema);
        txn.put(META_STORE, K_SCHEMA.to_vec(), bincode::serialize(&descriptor)?)?;
        txn.commit().await?;
        Ok(())
    }

    async fn create_initial_schema(&self, config: &DbConfig) -> DbResult<()> {
        debug!("creating initial schema");
        let mut txn = self.inner.kv.write_structural().await;
        for (table, def) in &config.schema {
            for store in index::stores_for_table(table, def) {
                txn.create_store(&store);
            }
        }
        if config.sync.enabled {
            txn.create_store(DEVICES_STORE);
        }
        txn.set_version(config.version);
        let descriptor = SchemaDescriptor::from_tables(config.version, &config.schema);
        txn.put(META_STORE, K_SCHEMA.to_vec(), bincode::serialize(&descriptor)?)?;
        txn.commit().await?;
        Ok(())
    }

    /// Rewrite every row of `table`: backfill added columns, drop removed
    /// ones, re-encode per the new sensitive set, and rebuild aux stores
    async fn rewrite_table(
        &self,
        txn: &mut WriteTxn,
        table: &str,
        def: &TableDef,
        old_def: Option<&TableDef>,
    ) -> DbResult<()> {
        use std::ops::Bound;

        let cipher_guard = self.inner.cipher.read().await;
        let cipher = cipher_guard.as_ref();

        // aux stores are rebuilt from scratch
        if let Some(old_def) = old_def {
            for store in index::stores_for_table(table, old_def) {
                if store != table {
                    txn.drop_store(&store);
                }
            }
        }
        for store in index::stores_for_table(table, def) {
            if store != table {
                txn.create_store(&store);
            }
        }

        let rows = txn.scan(
            table,
            (Bound::Unbounded, Bound::Unbounded),
            crate::kv::Direction::Forward,
        )?;
        debug!(table = %table, rows = rows.len(), "rewriting table for upgrade");

        for (pk_key, raw) in rows {
            let stored = StoredRow::from_bytes(&raw)?;
            let mut row =
                decode_stored_row(def, &stored, cipher, self.inner.opts.decrypt_failure)?;
            for (column, ty) in &def.columns {
                if !row.fields.contains_key(column) {
                    row.set(column.clone(), ty.default_value());
                }
            }
            let encoded = encode_row(def, &row, cipher, stored.committed_at, &stored.device_id)?;
            txn.put(table, pk_key.clone(), encoded)?;
            index::add_row(
                txn,
                table,
                def,
                &pk_key,
                &row,
                &self.inner.opts.stop_words,
            )?;
        }
        Ok(())
    }

    async fn ensure_device_registered(&self) -> DbResult<()> {
        let existing = self.inner.kv.store_names().await;
        if !existing.iter().any(|s| s == DEVICES_STORE) {
            let mut txn = self.inner.kv.write_structural().await;
            txn.create_store(DEVICES_STORE);
            txn.commit().await?;
        }

        let key = encode_key(&Value::Str(self.inner.device_id.clone()))?;
        let record = crate::sync::DeviceRecord {
            device_id: self.inner.device_id.clone(),
            registered_at: self.now().timestamp_millis(),
            last_seen: self.now().timestamp_millis(),
        };
        let mut txn = self.inner.kv.write(&[DEVICES_STORE]).await?;
        txn.put(DEVICES_STORE, key, bincode::serialize(&record)?)?;
        txn.commit().await?;
        debug!(device = %self.inner.device_id, "device registered");
        Ok(())
    }

    async fn resume_rotation_if_pending(&self) -> DbResult<()> {
        let pending: Option<RotationState> = {
            let read = self.inner.kv.read().await;
            match read.get(META_STORE, K_ROTATION)? {
                Some(raw) => Some(bincode::deserialize(&raw)?),
                None => None,
            }
        };
        let Some(rotation) = pending else {
            return Ok(());
        };

        let mut cipher_guard = self.inner.cipher.write().await;
        let Some(cipher) = cipher_guard.as_mut() else {
            warn!("rotation marker present but no encryption key configured");
            return Ok(());
        };
        if cipher.active_key_id() != rotation.target {
            warn!(
                target = %rotation.target,
                active = %cipher.active_key_id(),
                "rotation marker targets a different key; reopen with the rotated key to resume"
            );
            return Ok(());
        }

        info!(target = %rotation.target, "resuming interrupted key rotation");
        cipher.import_wrapped(&rotation.wrapped)?;
        drop(cipher_guard);

        self.sweep_rotation().await?;
        self.finish_rotation().await?;
        Ok(())
    }
}
