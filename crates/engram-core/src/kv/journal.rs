//! Append-only commit journal
//!
//! Every committed transaction is framed as `[u32 len][u32 crc][bincode]`
//! and appended before it is applied in memory. Reopen replays the journal
//! over the latest snapshot; a corrupt or partial tail is truncated at the
//! last intact frame.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, warn};

use crate::error::{DbError, DbResult};

/// One mutation inside a committed transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JournalOp {
    /// Upsert a key in a store
    Put {
        store: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    /// Remove a key from a store
    Delete { store: String, key: Vec<u8> },
    /// Create an empty store
    CreateStore { store: String },
    /// Drop a store and its contents
    DropStore { store: String },
    /// Record a schema version bump
    SetVersion { version: u32 },
}

/// One committed transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Ops in application order
    pub ops: Vec<JournalOp>,
}

/// Append-only journal file handle
#[derive(Debug)]
pub struct Journal {
    file: File,
    path: PathBuf,
    len: u64,
}

impl Journal {
    /// Open (creating if absent) the journal at `path`
    pub async fn open(path: &Path) -> DbResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .await?;
        let len = file.metadata().await?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            len,
        })
    }

    /// Current journal size in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Append one committed transaction and flush it to disk
    pub async fn append(&mut self, record: &JournalRecord) -> DbResult<()> {
        let body = bincode::serialize(record)?;
        let mut frame = Vec::with_capacity(body.len() + 8);
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        frame.extend_from_slice(&body);

        self.file.write_all(&frame).await?;
        self.file.sync_data().await?;
        self.len += frame.len() as u64;
        Ok(())
    }

    /// Replay all intact records; truncates a corrupt tail in place
    pub async fn replay(path: &Path) -> DbResult<Vec<JournalRecord>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut file = OpenOptions::new().read(true).write(true).open(path).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;

        let mut records = Vec::new();
        let mut offset = 0usize;
        let mut good_end = 0usize;
        while offset + 8 <= buf.len() {
            let len = u32::from_le_bytes([
                buf[offset],
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
            ]) as usize;
            let crc = u32::from_le_bytes([
                buf[offset + 4],
                buf[offset + 5],
                buf[offset + 6],
                buf[offset + 7],
            ]);
            let body_start = offset + 8;
            let body_end = body_start + len;
            if body_end > buf.len() {
                break;
            }
            let body = &buf[body_start..body_end];
            if crc32fast::hash(body) != crc {
                break;
            }
            match bincode::deserialize::<JournalRecord>(body) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
            offset = body_end;
            good_end = body_end;
        }

        if good_end < buf.len() {
            warn!(
                dropped = buf.len() - good_end,
                "truncating corrupt journal tail"
            );
            file.set_len(good_end as u64).await?;
            file.sync_data().await?;
        }
        debug!(records = records.len(), "journal replayed");
        Ok(records)
    }

    /// Discard every record; called after a snapshot makes them redundant
    pub async fn truncate(&mut self) -> DbResult<()> {
        self.file.set_len(0).await?;
        self.file.seek(SeekFrom::Start(0)).await?;
        self.file.sync_data().await?;
        self.len = 0;
        Ok(())
    }

    /// Path the journal lives at
    pub fn path(&self) -> &Path {
        &self.path
    }
}
