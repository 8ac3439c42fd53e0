//! Persistent record of each task's last execution

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::CacheKey;
use crate::fingerprint::{sha256_hex, Fingerprint};
use crate::task::TaskId;

/// What was true the last time a task finished
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub task_id: TaskId,
    /// Combined input + implementation fingerprint
    pub cache_key: CacheKey,
    /// Hash of the action implementation
    pub implementation: String,
    pub input_fingerprint: Fingerprint,
    pub output_fingerprint: Fingerprint,
    pub success: bool,
    pub recorded_at: String,
}

/// Execution history, one JSON file per task
#[derive(Debug, Clone)]
pub struct HistoryStore {
    dir: PathBuf,
}

impl HistoryStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn default_dir(root: &Path) -> Self {
        Self::new(root.join(".anvil").join("history"))
    }

    /// Create the backing directory. Failure here aborts the build.
    pub fn open(dir: PathBuf) -> Result<Self, HistoryError> {
        fs::create_dir_all(&dir).map_err(|source| HistoryError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self::new(dir))
    }

    /// Make sure the backing directory exists and is writable
    pub fn ensure_writable(&self) -> Result<(), HistoryError> {
        let io_err = |source| HistoryError::Io {
            path: self.dir.clone(),
            source,
        };
        fs::create_dir_all(&self.dir).map_err(io_err)?;
        tempfile::NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &TaskId) -> PathBuf {
        self.dir.join(format!("{}.json", sha256_hex(id.as_str().as_bytes())))
    }

    /// Load the record for a task. A missing record is `Ok(None)`.
    pub fn load(&self, id: &TaskId) -> Result<Option<ExecutionRecord>, HistoryError> {
        let path = self.record_path(id);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(HistoryError::Io { path, source }),
        };

        let record: ExecutionRecord =
            serde_json::from_str(&contents).map_err(|e| HistoryError::Corrupt {
                task: id.to_string(),
                reason: e.to_string(),
            })?;

        if &record.task_id != id {
            return Err(HistoryError::Corrupt {
                task: id.to_string(),
                reason: format!("record belongs to {}", record.task_id),
            });
        }

        Ok(Some(record))
    }

    /// Load a record, treating unreadable history as absent
    pub fn load_or_none(&self, id: &TaskId) -> Option<ExecutionRecord> {
        match self.load(id) {
            Ok(record) => record,
            Err(e) => {
                warn!(task = %id, error = %e, "ignoring unusable execution history");
                None
            }
        }
    }

    /// Persist a record, atomically replacing any previous one
    pub fn store(&self, record: &ExecutionRecord) -> Result<(), HistoryError> {
        let path = self.record_path(&record.task_id);
        let io_err = |source: io::Error| HistoryError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let json = serde_json::to_vec_pretty(record).map_err(|e| HistoryError::Corrupt {
            task: record.task_id.to_string(),
            reason: e.to_string(),
        })?;

        let mut temp = tempfile::NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        temp.write_all(&json).map_err(io_err)?;
        temp.as_file().sync_all().map_err(io_err)?;
        temp.persist(&path).map_err(|e| io_err(e.error))?;

        debug!(task = %record.task_id, success = record.success, "execution history recorded");
        Ok(())
    }

    /// Flip an existing record to failed so the next run executes the task
    pub fn mark_failed(&self, id: &TaskId) -> Result<(), HistoryError> {
        match self.load(id) {
            Ok(Some(mut record)) => {
                record.success = false;
                record.recorded_at = chrono::Utc::now().to_rfc3339();
                self.store(&record)
            }
            Ok(None) => Ok(()),
            Err(HistoryError::Corrupt { .. }) => self.remove(id),
            Err(e) => Err(e),
        }
    }

    pub fn remove(&self, id: &TaskId) -> Result<(), HistoryError> {
        let path = self.record_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(HistoryError::Io { path, source }),
        }
    }

    /// Forget every record
    pub fn clear(&self) -> Result<usize, HistoryError> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        let entries = fs::read_dir(&self.dir).map_err(|source| HistoryError::Io {
            path: self.dir.clone(),
            source,
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Execution history errors
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("History IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Execution history for '{task}' is corrupt: {reason}")]
    Corrupt { task: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str, success: bool) -> ExecutionRecord {
        let id = TaskId::new(id);
        ExecutionRecord {
            cache_key: CacheKey::compute(&id, "impl", "inputs"),
            task_id: id,
            implementation: "impl".to_string(),
            input_fingerprint: Fingerprint::empty(),
            output_fingerprint: Fingerprint::empty(),
            success,
            recorded_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn test_store_and_load() {
        let temp = TempDir::new().unwrap();
        let store = HistoryStore::open(temp.path().join("history")).unwrap();

        let rec = record(":app:compile", true);
        store.store(&rec).unwrap();

        assert_eq!(store.load(&rec.task_id).unwrap(), Some(rec));
        assert_eq!(store.load(&TaskId::new("other")).unwrap(), None);
    }

    #[test]
    fn test_store_replaces_previous() {
        let temp = TempDir::new().unwrap();
        let store = HistoryStore::new(temp.path().join("history"));

        store.store(&record("t", true)).unwrap();
        let mut newer = record("t", true);
        newer.implementation = "impl-2".to_string();
        store.store(&newer).unwrap();

        assert_eq!(store.load(&TaskId::new("t")).unwrap().unwrap().implementation, "impl-2");
        // No temp files left behind
        assert_eq!(fs::read_dir(store.dir()).unwrap().count(), 1);
    }

    #[test]
    fn test_corrupt_record_reported_and_ignored() {
        let temp = TempDir::new().unwrap();
        let store = HistoryStore::new(temp.path().to_path_buf());
        let id = TaskId::new("t");
        fs::write(store.record_path(&id), "{ truncated").unwrap();

        assert!(matches!(store.load(&id), Err(HistoryError::Corrupt { .. })));
        assert!(store.load_or_none(&id).is_none());
    }

    #[test]
    fn test_mark_failed() {
        let temp = TempDir::new().unwrap();
        let store = HistoryStore::new(temp.path().to_path_buf());
        store.store(&record("t", true)).unwrap();

        store.mark_failed(&TaskId::new("t")).unwrap();
        assert!(!store.load(&TaskId::new("t")).unwrap().unwrap().success);

        // Nothing to mark
        store.mark_failed(&TaskId::new("never-ran")).unwrap();
    }

    #[test]
    fn test_clear() {
        let temp = TempDir::new().unwrap();
        let store = HistoryStore::new(temp.path().to_path_buf());
        store.store(&record("a", true)).unwrap();
        store.store(&record("b", true)).unwrap();

        assert_eq!(store.clear().unwrap(), 2);
        assert!(store.load(&TaskId::new("a")).unwrap().is_none());
    }
}
