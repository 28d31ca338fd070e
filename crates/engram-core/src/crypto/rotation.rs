//! Online encryption-key rotation
//!
//! Rotation makes the new key active for writes, then sweeps every table
//! with sensitive columns in bounded batches, re-encrypting stale envelopes
//! in place. Reads keep working throughout because the ring holds both keys
//! until the sweep finishes. The sweep is idempotent: rows already under
//! the new key are skipped, so a crashed rotation resumes on reopen via the
//! persisted marker and wrapped prior keys.

use std::ops::Bound;

use tracing::{debug, info, instrument};

use crate::codec::reencrypt_row;
use crate::config::KeySource;
use crate::crypto;
use crate::db::{Database, DbState, RotationState, K_RING, K_ROTATION, META_STORE};
use crate::error::{DbError, DbResult};
use crate::kv::Direction;

impl Database {
    /// Rotate the field-encryption key to `new_key`.
    ///
    /// Fails with [`DbError::RotationInProgress`] when a rotation is
    /// already running, [`DbError::KeyDerivationFailed`] when the KDF
    /// rejects the input, and [`DbError::DecryptFailed`] when any stored
    /// envelope does not verify (the ring is left unchanged).
    #[instrument(level = "info", skip_all)]
    pub async fn rotate_encryption_key(&self, new_key: KeySource) -> DbResult<()> {
        self.ensure_ready().await?;
        let _rotation_guard = self
            .inner
            .rotation
            .try_lock()
            .map_err(|_| DbError::RotationInProgress)?;

        let derived = crypto::derive_key(&new_key, &self.inner.kdf_salt, &self.inner.opts.kdf)?;

        // activate the new key and persist the marker before any rewrite
        let (target, wrapped, ring_ids) = {
            let mut cipher_guard = self.inner.cipher.write().await;
            let cipher = cipher_guard.as_mut().ok_or_else(|| {
                DbError::InvalidConfig("database was opened without an encryption key".into())
            })?;
            let target = cipher.activate(derived);
            (target, cipher.export_wrapped()?, cipher.key_ids())
        };

        *self.inner.state.write().await = DbState::Rotating;
        info!(target = %target, ring = ring_ids.len(), "key rotation started");

        let marker = RotationState {
            target: target.clone(),
            wrapped,
        };
        let mut txn = self.inner.kv.write(&[META_STORE]).await?;
        txn.put(META_STORE, K_ROTATION.to_vec(), bincode::serialize(&marker)?)?;
        txn.put(META_STORE, K_RING.to_vec(), bincode::serialize(&ring_ids)?)?;
        txn.commit().await?;

        let result = self.sweep_rotation().await;
        match result {
            Ok(()) => {
                self.finish_rotation().await?;
                *self.inner.state.write().await = DbState::Ready;
                info!(target = %target, "key rotation complete");
                Ok(())
            }
            Err(err) => {
                // the marker stays; reopen with the new key resumes the sweep
                *self.inner.state.write().await = DbState::Ready;
                Err(err)
            }
        }
    }

    /// Re-encrypt every stale envelope, one bounded batch per transaction
    pub(crate) async fn sweep_rotation(&self) -> DbResult<()> {
        let tables: Vec<String> = {
            let tables = self.inner.tables.read().await;
            tables
                .iter()
                .filter(|(_, def)| !def.sensitive.is_empty())
                .map(|(name, _)| name.clone())
                .collect()
        };
        let batch_size = self.inner.opts.rotation_batch;

        for table in tables {
            let mut resume_after: Option<Vec<u8>> = None;
            loop {
                let cipher_guard = self.inner.cipher.read().await;
                let cipher = cipher_guard.as_ref().ok_or_else(|| {
                    DbError::InvalidConfig("encryption key disappeared during rotation".into())
                })?;

                let mut txn = self.inner.kv.write(&[table.as_str()]).await?;
                let lower = match resume_after.take() {
                    Some(key) => Bound::Excluded(key),
                    None => Bound::Unbounded,
                };
                let rows = txn.scan(&table, (lower, Bound::Unbounded), Direction::Forward)?;
                if rows.is_empty() {
                    txn.abort();
                    break;
                }

                let mut rewritten = 0usize;
                let mut last_key = None;
                for (pk_key, raw) in rows.into_iter().take(batch_size) {
                    if let Some(updated) = reencrypt_row(&raw, cipher)? {
                        txn.put(&table, pk_key.clone(), updated)?;
                        rewritten += 1;
                    }
                    last_key = Some(pk_key);
                }
                drop(cipher_guard);
                txn.commit().await?;
                debug!(table = %table, rewritten, "rotation batch committed");
                resume_after = last_key;
            }
        }
        Ok(())
    }

    /// Clear the marker and retire prior keys once every row is rewritten
    pub(crate) async fn finish_rotation(&self) -> DbResult<()> {
        let ring_ids = {
            let mut cipher_guard = self.inner.cipher.write().await;
            if let Some(cipher) = cipher_guard.as_mut() {
                cipher.retire_inactive();
                cipher.key_ids()
            } else {
                Vec::new()
            }
        };
        let mut txn = self.inner.kv.write(&[META_STORE]).await?;
        txn.delete(META_STORE, K_ROTATION.to_vec())?;
        txn.put(META_STORE, K_RING.to_vec(), bincode::serialize(&ring_ids)?)?;
        txn.commit().await?;
        Ok(())
    }

    /// Key ids currently in the ring, head (active) first
    pub async fn key_ring_ids(&self) -> Vec<String> {
        self.inner
            .cipher
            .read()
            .await
            .as_ref()
            .map(crate::crypto::FieldCipher::key_ids)
            .unwrap_or_default()
    }
}
