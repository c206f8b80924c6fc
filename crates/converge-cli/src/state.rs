//! File-backed store for in-flight logical operations.
//!
//! One JSON record per resource, written atomically. Records only exist while
//! an operation is in progress; reaching a terminal status deletes the record
//! so the next reconcile starts a fresh operation.

use chrono::{DateTime, Utc};
use converge_core::{CallbackContext, InvocationOutcome, OperationStatus};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

const LOCK_FILE: &str = "converge.lock";
const RECORD_EXT: &str = "json";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt state record {path}: {message}")]
    Corrupt { path: String, message: String },
}

/// Persisted progress of one logical operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub op_id: String,
    /// Resource key, e.g. `db-instance/orders-db`.
    pub resource: String,
    pub context: CallbackContext,
    pub invocations: u32,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<InvocationOutcome>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OperationRecord {
    pub fn new(resource: &str) -> Self {
        let now = Utc::now();
        Self {
            op_id: new_op_id(resource, now),
            resource: resource.to_owned(),
            context: CallbackContext::new(),
            invocations: 0,
            status: OperationStatus::InProgress,
            last_outcome: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Seconds until the scheduler should re-invoke, if waiting.
    pub fn resume_delay(&self) -> Option<u32> {
        self.last_outcome
            .as_ref()
            .and_then(|o| o.resume_delay_seconds)
    }
}

/// `20260101T120000Z-1a2b3c4d`: sortable, unique per resource and start time.
fn new_op_id(resource: &str, at: DateTime<Utc>) -> String {
    let seed = format!("{resource}@{}", at.to_rfc3339());
    let hash = blake3::hash(seed.as_bytes()).to_hex();
    format!("{}-{}", at.format("%Y%m%dT%H%M%SZ"), &hash[..8])
}

/// Exclusive lock over the state directory, released on drop.
pub struct StateLock {
    file: File,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Block until no other invocation holds the store.
    pub fn lock(&self) -> Result<StateLock, StateError> {
        std::fs::create_dir_all(&self.dir)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.dir.join(LOCK_FILE))?;
        file.lock_exclusive()?;
        Ok(StateLock { file })
    }

    fn record_path(&self, resource: &str) -> PathBuf {
        let name = resource.replace(['/', '\\'], ".");
        self.dir.join(format!("{name}.{RECORD_EXT}"))
    }

    pub fn load(&self, resource: &str) -> Result<Option<OperationRecord>, StateError> {
        let path = self.record_path(resource);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record = serde_json::from_str(&content).map_err(|e| StateError::Corrupt {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Ok(Some(record))
    }

    /// Write the record via a temp file in the same directory plus rename.
    pub fn save(&self, record: &OperationRecord) -> Result<(), StateError> {
        std::fs::create_dir_all(&self.dir)?;
        let content = serde_json::to_string_pretty(record)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.record_path(&record.resource))
            .map_err(|e| StateError::Io(e.error))?;
        Ok(())
    }

    /// Returns whether a record existed.
    pub fn remove(&self, resource: &str) -> Result<bool, StateError> {
        match std::fs::remove_file(self.record_path(resource)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every in-flight operation, oldest first.
    pub fn list(&self) -> Result<Vec<OperationRecord>, StateError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            let record: OperationRecord =
                serde_json::from_str(&content).map_err(|e| StateError::Corrupt {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
            records.push(record);
        }
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(records)
    }
}
