//! Ordered transactional key-value substrate
//!
//! Named object stores over `BTreeMap<Vec<u8>, Vec<u8>>`, with staged
//! read-write transactions that commit atomically across every touched
//! store. Writers are serialized through one exclusive lock, so a committed
//! transaction is fully applied before the next begins and readers always
//! observe a consistent snapshot.
//!
//! Durability: commits append to the [`journal`] first, then apply in
//! memory; a snapshot file absorbs the journal when it grows past a
//! threshold and on close.

pub mod journal;
pub mod keys;

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info, instrument};

use crate::error::{DbError, DbResult};
use journal::{Journal, JournalOp, JournalRecord};

/// Journal size that triggers a snapshot on the next commit
const SNAPSHOT_THRESHOLD: u64 = 4 * 1024 * 1024;

type Store = BTreeMap<Vec<u8>, Vec<u8>>;

/// Cursor direction for range scans
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Ascending key order
    Forward,
    /// Descending key order
    Reverse,
}

/// In-memory image of every store
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KvInner {
    stores: BTreeMap<String, Store>,
    version: u32,
}

impl KvInner {
    fn store(&self, name: &str) -> DbResult<&Store> {
        self.stores
            .get(name)
            .ok_or_else(|| DbError::TransactionAborted(format!("unknown store '{name}'")))
    }
}

/// Engine handle; cheap to clone
#[derive(Debug, Clone)]
pub struct KvEngine {
    inner: Arc<RwLock<KvInner>>,
    journal: Arc<Mutex<Journal>>,
    paths: Arc<KvPaths>,
}

#[derive(Debug)]
struct KvPaths {
    snapshot: PathBuf,
    lock: PathBuf,
    released: std::sync::atomic::AtomicBool,
}

impl KvPaths {
    fn release(&self) {
        if !self
            .released
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            let _ = std::fs::remove_file(&self.lock);
        }
    }
}

impl Drop for KvPaths {
    fn drop(&mut self) {
        self.release();
    }
}

impl KvEngine {
    /// Open the engine under `dir/name`, acquiring the single-writer lock.
    ///
    /// Waits up to `upgrade_wait_ms` for another handle to release before
    /// failing with [`DbError::UpgradeBlocked`].
    #[instrument(level = "debug", skip_all, fields(name = %name))]
    pub async fn open(dir: &PathBuf, name: &str, upgrade_wait_ms: u64) -> DbResult<Self> {
        let root = dir.join(name);
        tokio::fs::create_dir_all(&root).await?;

        let lock = root.join(".lock");
        acquire_lock(&lock, upgrade_wait_ms).await?;

        let snapshot = root.join("snapshot");
        let journal_path = root.join("journal");

        let mut inner = if snapshot.exists() {
            let raw = tokio::fs::read(&snapshot).await?;
            bincode::deserialize::<KvInner>(&raw)?
        } else {
            KvInner::default()
        };

        let records = Journal::replay(&journal_path).await?;
        let replayed = records.len();
        for record in records {
            apply_record(&mut inner, &record);
        }
        info!(
            stores = inner.stores.len(),
            version = inner.version,
            replayed,
            "kv engine opened"
        );

        let journal = Journal::open(&journal_path).await?;
        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
            journal: Arc::new(Mutex::new(journal)),
            paths: Arc::new(KvPaths {
                snapshot,
                lock,
                released: std::sync::atomic::AtomicBool::new(false),
            }),
        })
    }

    /// Release the single-writer lock; the handle stays usable for reads
    /// but another open may take ownership afterwards
    pub fn release_lock(&self) {
        self.paths.release();
    }

    /// Stored schema version; 0 for a fresh database
    pub async fn version(&self) -> u32 {
        self.inner.read().await.version
    }

    /// Begin a read-only transaction (consistent snapshot)
    pub async fn read(&self) -> ReadTxn {
        ReadTxn {
            guard: Arc::clone(&self.inner).read_owned().await,
        }
    }

    /// Begin a read-write transaction over the named stores
    pub async fn write(&self, stores: &[&str]) -> DbResult<WriteTxn> {
        let guard = Arc::clone(&self.inner).write_owned().await;
        for store in stores {
            if !guard.stores.contains_key(*store) {
                return Err(DbError::TransactionAborted(format!(
                    "unknown store '{store}'"
                )));
            }
        }
        Ok(WriteTxn {
            guard,
            journal: Arc::clone(&self.journal),
            snapshot_path: self.paths.snapshot.clone(),
            scope: stores.iter().map(ToString::to_string).collect(),
            overlay: BTreeMap::new(),
            structural: Vec::new(),
            reset: std::collections::HashSet::new(),
        })
    }

    /// Begin a transaction that may also create or drop stores
    pub async fn write_structural(&self) -> WriteTxn {
        let guard = Arc::clone(&self.inner).write_owned().await;
        WriteTxn {
            guard,
            journal: Arc::clone(&self.journal),
            snapshot_path: self.paths.snapshot.clone(),
            scope: Vec::new(),
            overlay: BTreeMap::new(),
            structural: Vec::new(),
            reset: std::collections::HashSet::new(),
        }
    }

    /// Names of all existing stores
    pub async fn store_names(&self) -> Vec<String> {
        self.inner.read().await.stores.keys().cloned().collect()
    }

    /// Write a snapshot and truncate the journal; called on close
    pub async fn flush(&self) -> DbResult<()> {
        let guard = self.inner.read().await;
        let mut journal = self.journal.lock().await;
        write_snapshot(&self.paths.snapshot, &guard).await?;
        journal.truncate().await?;
        Ok(())
    }
}

async fn acquire_lock(path: &PathBuf, wait_ms: u64) -> DbResult<()> {
    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(wait_ms);
    loop {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if std::time::Instant::now() >= deadline {
                    return Err(DbError::UpgradeBlocked(format!(
                        "another handle holds {}",
                        path.display()
                    )));
                }
                tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn apply_record(inner: &mut KvInner, record: &JournalRecord) {
    for op in &record.ops {
        match op {
            JournalOp::Put { store, key, value } => {
                inner
                    .stores
                    .entry(store.clone())
                    .or_default()
                    .insert(key.clone(), value.clone());
            }
            JournalOp::Delete { store, key } => {
                if let Some(s) = inner.stores.get_mut(store) {
                    s.remove(key);
                }
            }
            JournalOp::CreateStore { store } => {
                inner.stores.entry(store.clone()).or_default();
            }
            JournalOp::DropStore { store } => {
                inner.stores.remove(store);
            }
            JournalOp::SetVersion { version } => inner.version = *version,
        }
    }
}

async fn write_snapshot(path: &PathBuf, inner: &KvInner) -> DbResult<()> {
    let tmp = path.with_extension("tmp");
    let raw = bincode::serialize(inner)?;
    tokio::fs::write(&tmp, &raw).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!(bytes = raw.len(), "snapshot written");
    Ok(())
}

/// Read access shared by read-only and read-write transactions
pub trait KvRead {
    /// Read one key
    fn get(&self, store: &str, key: &[u8]) -> DbResult<Option<Vec<u8>>>;
    /// Range scan in the given direction
    fn scan(
        &self,
        store: &str,
        range: (Bound<Vec<u8>>, Bound<Vec<u8>>),
        direction: Direction,
    ) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>>;
}

impl KvRead for ReadTxn {
    fn get(&self, store: &str, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        ReadTxn::get(self, store, key)
    }

    fn scan(
        &self,
        store: &str,
        range: (Bound<Vec<u8>>, Bound<Vec<u8>>),
        direction: Direction,
    ) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        ReadTxn::scan(self, store, range, direction)
    }
}

impl KvRead for WriteTxn {
    fn get(&self, store: &str, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        WriteTxn::get(self, store, key)
    }

    fn scan(
        &self,
        store: &str,
        range: (Bound<Vec<u8>>, Bound<Vec<u8>>),
        direction: Direction,
    ) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        WriteTxn::scan(self, store, range, direction)
    }
}

/// Read-only transaction over a consistent snapshot
pub struct ReadTxn {
    guard: OwnedRwLockReadGuard<KvInner>,
}

impl ReadTxn {
    /// Read one key
    pub fn get(&self, store: &str, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        Ok(self.guard.store(store)?.get(key).cloned())
    }

    /// Range scan in the given direction
    pub fn scan(
        &self,
        store: &str,
        range: (Bound<Vec<u8>>, Bound<Vec<u8>>),
        direction: Direction,
    ) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let store = self.guard.store(store)?;
        let iter = store.range(range).map(|(k, v)| (k.clone(), v.clone()));
        Ok(match direction {
            Direction::Forward => iter.collect(),
            Direction::Reverse => {
                let mut items: Vec<_> = iter.collect();
                items.reverse();
                items
            }
        })
    }

    /// Number of keys in a store
    pub fn count(&self, store: &str) -> DbResult<usize> {
        Ok(self.guard.store(store)?.len())
    }

    /// Whether the store exists
    pub fn has_store(&self, store: &str) -> bool {
        self.guard.stores.contains_key(store)
    }
}

/// Staged read-write transaction; all mutations commit atomically or not at
/// all. Dropping without [`WriteTxn::commit`] aborts.
pub struct WriteTxn {
    guard: OwnedRwLockWriteGuard<KvInner>,
    journal: Arc<Mutex<Journal>>,
    snapshot_path: PathBuf,
    scope: Vec<String>,
    // staged values; None marks a delete
    overlay: BTreeMap<String, BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    structural: Vec<JournalOp>,
    // stores dropped in this transaction: base content is invisible to reads
    reset: std::collections::HashSet<String>,
}

impl WriteTxn {
    fn check_scope(&self, store: &str) -> DbResult<()> {
        if self.scope.is_empty() || self.scope.iter().any(|s| s == store) {
            Ok(())
        } else {
            Err(DbError::TransactionAborted(format!(
                "store '{store}' is outside the transaction scope"
            )))
        }
    }

    /// Read through the staged overlay
    pub fn get(&self, store: &str, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        self.check_scope(store)?;
        if let Some(staged) = self.overlay.get(store).and_then(|s| s.get(key)) {
            return Ok(staged.clone());
        }
        if self.reset.contains(store) || self.created_in_txn(store) {
            return Ok(None);
        }
        Ok(self.guard.store(store)?.get(key).cloned())
    }

    fn created_in_txn(&self, store: &str) -> bool {
        !self.guard.stores.contains_key(store)
            && self
                .structural
                .iter()
                .any(|op| matches!(op, JournalOp::CreateStore { store: s } if s == store))
    }

    /// Stage an upsert
    pub fn put(&mut self, store: &str, key: Vec<u8>, value: Vec<u8>) -> DbResult<()> {
        self.check_scope(store)?;
        if !self.guard.stores.contains_key(store)
            && !self
                .structural
                .iter()
                .any(|op| matches!(op, JournalOp::CreateStore { store: s } if s == store))
        {
            return Err(DbError::TransactionAborted(format!(
                "unknown store '{store}'"
            )));
        }
        self.overlay
            .entry(store.to_string())
            .or_default()
            .insert(key, Some(value));
        Ok(())
    }

    /// Stage a delete
    pub fn delete(&mut self, store: &str, key: Vec<u8>) -> DbResult<()> {
        self.check_scope(store)?;
        self.overlay
            .entry(store.to_string())
            .or_default()
            .insert(key, None);
        Ok(())
    }

    /// Stage store creation (structural transactions only)
    pub fn create_store(&mut self, store: &str) {
        self.structural.push(JournalOp::CreateStore {
            store: store.to_string(),
        });
    }

    /// Stage dropping a store and its contents; subsequent reads in this
    /// transaction see the store as empty
    pub fn drop_store(&mut self, store: &str) {
        self.overlay.remove(store);
        self.reset.insert(store.to_string());
        self.structural.push(JournalOp::DropStore {
            store: store.to_string(),
        });
    }

    /// Stage a schema-version bump
    pub fn set_version(&mut self, version: u32) {
        self.structural.push(JournalOp::SetVersion { version });
    }

    /// Range scan merging the staged overlay over the base store
    pub fn scan(
        &self,
        store: &str,
        range: (Bound<Vec<u8>>, Bound<Vec<u8>>),
        direction: Direction,
    ) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.check_scope(store)?;
        let empty_base = BTreeMap::new();
        let base = if self.reset.contains(store) || self.created_in_txn(store) {
            &empty_base
        } else {
            self.guard.store(store)?
        };
        let empty = BTreeMap::new();
        let staged = self.overlay.get(store).unwrap_or(&empty);

        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = base
            .range(range.clone())
            .map(|(k, v)| (k.clone(), Some(v.clone())))
            .collect();
        for (k, v) in staged.range(range) {
            merged.insert(k.clone(), v.clone());
        }

        let iter = merged.into_iter().filter_map(|(k, v)| v.map(|v| (k, v)));
        Ok(match direction {
            Direction::Forward => iter.collect(),
            Direction::Reverse => {
                let mut items: Vec<_> = iter.collect();
                items.reverse();
                items
            }
        })
    }

    /// Commit: journal first, then apply; the write lock is held throughout
    pub async fn commit(mut self) -> DbResult<()> {
        let mut ops = std::mem::take(&mut self.structural);
        for (store, staged) in &self.overlay {
            for (key, value) in staged {
                ops.push(match value {
                    Some(value) => JournalOp::Put {
                        store: store.clone(),
                        key: key.clone(),
                        value: value.clone(),
                    },
                    None => JournalOp::Delete {
                        store: store.clone(),
                        key: key.clone(),
                    },
                });
            }
        }
        if ops.is_empty() {
            return Ok(());
        }
        let record = JournalRecord { ops };

        let mut journal = self.journal.lock().await;
        journal.append(&record).await?;
        apply_record(&mut self.guard, &record);

        if journal.len() > SNAPSHOT_THRESHOLD {
            write_snapshot(&self.snapshot_path, &self.guard).await?;
            journal.truncate().await?;
        }
        Ok(())
    }

    /// Drop every staged change
    pub fn abort(self) {
        // Dropping the guard releases the writer lock; nothing was applied
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fresh(dir: &tempfile::TempDir) -> KvEngine {
        KvEngine::open(&dir.path().to_path_buf(), "testdb", 200)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_commit_applies_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let kv = fresh(&dir).await;

        let mut txn = kv.write_structural().await;
        txn.create_store("a");
        txn.create_store("b");
        txn.put("a", vec![1], vec![10]).unwrap();
        txn.put("b", vec![2], vec![20]).unwrap();
        txn.commit().await.unwrap();

        let read = kv.read().await;
        assert_eq!(read.get("a", &[1]).unwrap(), Some(vec![10]));
        assert_eq!(read.get("b", &[2]).unwrap(), Some(vec![20]));
    }

    #[tokio::test]
    async fn test_abort_discards_everything() {
        let dir = tempfile::tempdir().unwrap();
        let kv = fresh(&dir).await;

        let mut txn = kv.write_structural().await;
        txn.create_store("a");
        txn.commit().await.unwrap();

        let mut txn = kv.write(&["a"]).await.unwrap();
        txn.put("a", vec![1], vec![10]).unwrap();
        txn.abort();

        let read = kv.read().await;
        assert_eq!(read.get("a", &[1]).unwrap(), None);
    }

    #[tokio::test]
    async fn test_scan_merges_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let kv = fresh(&dir).await;

        let mut txn = kv.write_structural().await;
        txn.create_store("a");
        txn.put("a", vec![1], vec![1]).unwrap();
        txn.put("a", vec![3], vec![3]).unwrap();
        txn.commit().await.unwrap();

        let mut txn = kv.write(&["a"]).await.unwrap();
        txn.put("a", vec![2], vec![2]).unwrap();
        txn.delete("a", vec![3]).unwrap();
        let items = txn
            .scan("a", (Bound::Unbounded, Bound::Unbounded), Direction::Forward)
            .unwrap();
        assert_eq!(items, vec![(vec![1], vec![1]), (vec![2], vec![2])]);
        txn.abort();
    }

    #[tokio::test]
    async fn test_reopen_replays_journal() {
        let dir = tempfile::tempdir().unwrap();
        {
            let kv = fresh(&dir).await;
            let mut txn = kv.write_structural().await;
            txn.create_store("a");
            txn.set_version(3);
            txn.put("a", vec![7], vec![70]).unwrap();
            txn.commit().await.unwrap();
        }

        let kv = fresh(&dir).await;
        assert_eq!(kv.version().await, 3);
        let read = kv.read().await;
        assert_eq!(read.get("a", &[7]).unwrap(), Some(vec![70]));
    }

    #[tokio::test]
    async fn test_second_handle_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let _kv = fresh(&dir).await;
        let result = KvEngine::open(&dir.path().to_path_buf(), "testdb", 100).await;
        assert!(matches!(result, Err(DbError::UpgradeBlocked(_))));
    }

    #[tokio::test]
    async fn test_scope_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let kv = fresh(&dir).await;

        let mut txn = kv.write_structural().await;
        txn.create_store("a");
        txn.create_store("b");
        txn.commit().await.unwrap();

        let mut txn = kv.write(&["a"]).await.unwrap();
        assert!(txn.put("b", vec![1], vec![1]).is_err());
        txn.abort();
    }
}
