//! Content-addressable build cache

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::fingerprint::{hash_file, Fingerprint};
use crate::task::{normalize_path, TaskId};

const ENTRY_FILE: &str = "entry.json";
const ARCHIVE_FILE: &str = "outputs.tar.gz";

/// Cache key: SHA-256 over task identity, implementation and input fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(pub String);

impl CacheKey {
    /// Compute a cache key from a task's identity and fingerprints
    pub fn compute(id: &TaskId, implementation: &str, inputs_hash: &str) -> Self {
        let mut hasher = Sha256::new();

        hasher.update(id.as_str().as_bytes());
        hasher.update(b"\0");
        hasher.update(implementation.as_bytes());
        hasher.update(b"\0");
        hasher.update(inputs_hash.as_bytes());

        CacheKey(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    /// Task that produced the outputs
    pub task_id: TaskId,
    /// Declared output paths, relative to the build root
    pub output_paths: Vec<String>,
    /// Fingerprint of the outputs when they were stored
    pub output_fingerprint: Fingerprint,
    /// SHA-256 of the output archive
    pub checksum: String,
    /// Archive size in bytes
    pub size: u64,
    /// When this entry was created
    pub created_at: String,
}

/// Outputs of a successful execution, ready to be stored
#[derive(Debug, Clone)]
pub struct CacheBundle {
    pub task_id: TaskId,
    pub root: PathBuf,
    /// Declared output paths as written in the task
    pub outputs: Vec<PathBuf>,
    pub output_fingerprint: Fingerprint,
}

/// Result of a `put`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// A valid entry already existed; same inputs and action are trusted to
    /// produce the same outputs, so nothing was written.
    AlreadyPresent,
}

/// A store of task outputs keyed by [`CacheKey`].
///
/// A remote store implements the same contract; only the local store ships here.
pub trait BuildCache: Send + Sync {
    /// Look up an entry. A corrupt entry is an error, not a miss.
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;

    /// Store outputs under `key`. No-op if a valid entry exists.
    fn put(&self, key: &CacheKey, bundle: &CacheBundle) -> Result<PutOutcome, CacheError>;

    /// Replace the entry's declared outputs under `root` with the cached copies
    fn restore(&self, entry: &CacheEntry, root: &Path) -> Result<(), CacheError>;

    /// Drop the entry under `key` so the next successful `put` stores fresh outputs
    fn invalidate(&self, key: &CacheKey) -> Result<(), CacheError>;
}

/// Content-addressable task cache on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalCache {
    cache_dir: PathBuf,
}

impl LocalCache {
    /// Create a new local cache
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    /// Create cache with default directory
    pub fn default_dir(root: &Path) -> Self {
        Self::new(root.join(".anvil").join("cache"))
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(key.as_str())
    }

    fn write_archive(&self, bundle: &CacheBundle, archive_path: &Path) -> Result<Vec<String>, CacheError> {
        let file = fs::File::create(archive_path)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        let mut output_paths = Vec::new();
        for output in &bundle.outputs {
            let absolute = normalize_path(&bundle.root, output);
            let relative = absolute
                .strip_prefix(&bundle.root)
                .map_err(|_| CacheError::OutsideRoot(absolute.clone()))?
                .to_path_buf();
            output_paths.push(relative.to_string_lossy().replace('\\', "/"));

            match fs::symlink_metadata(&absolute) {
                Ok(meta) if meta.is_dir() => builder.append_dir_all(&relative, &absolute)?,
                Ok(_) => builder.append_path_with_name(&absolute, &relative)?,
                // Declared but not produced; restore reproduces the absence
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let encoder = builder.into_inner()?;
        let mut file = encoder.finish()?;
        file.flush()?;
        file.sync_all()?;
        Ok(output_paths)
    }

    /// Remove old cache entries
    pub fn prune(&self, max_age: Duration) -> Result<PruneStats, CacheError> {
        info!(max_age_secs = max_age.as_secs(), "pruning cache");
        let mut stats = PruneStats::default();

        if !self.cache_dir.exists() {
            return Ok(stats);
        }

        let cutoff = chrono::Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();

        for entry in fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            let path = entry.path();

            if !path.is_dir() {
                continue;
            }

            stats.total += 1;

            let created = fs::read_to_string(path.join(ENTRY_FILE))
                .ok()
                .and_then(|contents| serde_json::from_str::<CacheEntry>(&contents).ok())
                .and_then(|e| chrono::DateTime::parse_from_rfc3339(&e.created_at).ok());

            // Unreadable entries are unusable; prune them along with expired ones
            let expired = created.map_or(true, |c| c < cutoff);
            if expired && fs::remove_dir_all(&path).is_ok() {
                stats.removed += 1;
                continue;
            }

            stats.kept += 1;
        }

        info!(total = stats.total, removed = stats.removed, kept = stats.kept, "cache prune complete");
        Ok(stats)
    }

    /// Get cache statistics
    pub fn status(&self) -> Result<CacheStats, CacheError> {
        let mut stats = CacheStats::default();

        if !self.cache_dir.exists() {
            return Ok(stats);
        }

        for entry in fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            let path = entry.path();

            if !path.is_dir() {
                continue;
            }

            stats.entries += 1;

            if let Ok(dir_entries) = fs::read_dir(&path) {
                for file in dir_entries.flatten() {
                    if let Ok(meta) = file.metadata() {
                        stats.total_size += meta.len();
                    }
                }
            }
        }

        Ok(stats)
    }

    /// Remove every entry
    pub fn clear(&self) -> Result<(), CacheError> {
        if self.cache_dir.exists() {
            fs::remove_dir_all(&self.cache_dir)?;
        }
        Ok(())
    }
}

impl BuildCache for LocalCache {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let entry_dir = self.entry_dir(key);
        let metadata_path = entry_dir.join(ENTRY_FILE);

        if !metadata_path.exists() {
            debug!(key = %key, "cache miss");
            return Ok(None);
        }

        let corrupted = |reason: String| CacheError::Corrupted {
            key: key.to_string(),
            reason,
        };

        let contents = fs::read_to_string(&metadata_path)?;
        let entry: CacheEntry = serde_json::from_str(&contents)
            .map_err(|e| corrupted(format!("unreadable entry metadata: {}", e)))?;

        if &entry.key != key {
            return Err(corrupted(format!("entry is stored under key {}", entry.key)));
        }

        let (checksum, size) = match hash_file(&entry_dir.join(ARCHIVE_FILE)) {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(corrupted("output archive is missing".to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if checksum != entry.checksum || size != entry.size {
            return Err(corrupted("output archive checksum mismatch".to_string()));
        }

        debug!(key = %key, task = %entry.task_id, "cache hit");
        Ok(Some(entry))
    }

    fn put(&self, key: &CacheKey, bundle: &CacheBundle) -> Result<PutOutcome, CacheError> {
        match self.get(key) {
            Ok(Some(_)) => {
                debug!(key = %key, "cache entry already present");
                return Ok(PutOutcome::AlreadyPresent);
            }
            Ok(None) => {}
            Err(CacheError::Corrupted { reason, .. }) => {
                warn!(key = %key, %reason, "overwriting corrupt cache entry");
            }
            Err(e) => return Err(e),
        }

        debug!(task = %bundle.task_id, key = %key, "storing outputs in cache");
        fs::create_dir_all(&self.cache_dir)?;
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.cache_dir)?;

        let archive_path = staging.path().join(ARCHIVE_FILE);
        let output_paths = self.write_archive(bundle, &archive_path)?;
        let (checksum, size) = hash_file(&archive_path)?;

        let entry = CacheEntry {
            key: key.clone(),
            task_id: bundle.task_id.clone(),
            output_paths,
            output_fingerprint: bundle.output_fingerprint.clone(),
            checksum,
            size,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let json = serde_json::to_string_pretty(&entry)?;
        let mut file = fs::File::create(staging.path().join(ENTRY_FILE))?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;

        let entry_dir = self.entry_dir(key);
        if entry_dir.exists() {
            fs::remove_dir_all(&entry_dir)?;
        }

        // Publish the fully written entry in one step
        if let Err(e) = fs::rename(staging.path(), &entry_dir) {
            if entry_dir.join(ENTRY_FILE).exists() {
                debug!(key = %key, "concurrent writer published entry first");
                return Ok(PutOutcome::AlreadyPresent);
            }
            return Err(e.into());
        }

        info!(task = %bundle.task_id, key = %key, size, "stored outputs in cache");
        Ok(PutOutcome::Stored)
    }

    fn invalidate(&self, key: &CacheKey) -> Result<(), CacheError> {
        let entry_dir = self.entry_dir(key);
        match fs::remove_dir_all(&entry_dir) {
            Ok(()) => {
                info!(key = %key, "invalidated cache entry");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn restore(&self, entry: &CacheEntry, root: &Path) -> Result<(), CacheError> {
        for output in &entry.output_paths {
            let target = root.join(output);
            match fs::symlink_metadata(&target) {
                Ok(meta) if meta.is_dir() => fs::remove_dir_all(&target)?,
                Ok(_) => fs::remove_file(&target)?,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let file = fs::File::open(self.entry_dir(&entry.key).join(ARCHIVE_FILE))?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive.set_preserve_mtime(true);
        archive.unpack(root)?;

        debug!(task = %entry.task_id, key = %entry.key, "restored outputs from cache");
        Ok(())
    }
}

/// Statistics from a prune operation
#[derive(Debug, Default)]
pub struct PruneStats {
    /// Total entries found
    pub total: usize,
    /// Entries removed
    pub removed: usize,
    /// Entries kept
    pub kept: usize,
}

/// Cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of cache entries
    pub entries: usize,
    /// Total size in bytes
    pub total_size: u64,
}

impl CacheStats {
    /// Format total size in human-readable form
    pub fn formatted_size(&self) -> String {
        if self.total_size < 1024 {
            format!("{} B", self.total_size)
        } else if self.total_size < 1024 * 1024 {
            format!("{:.1} KB", self.total_size as f64 / 1024.0)
        } else if self.total_size < 1024 * 1024 * 1024 {
            format!("{:.1} MB", self.total_size as f64 / (1024.0 * 1024.0))
        } else {
            format!(
                "{:.1} GB",
                self.total_size as f64 / (1024.0 * 1024.0 * 1024.0)
            )
        }
    }
}

/// Cache errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// IO error
    #[error("Cache IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error
    #[error("Cache serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Entry failed validation; callers fall back to running the task
    #[error("Cache entry {key} is corrupt: {reason}")]
    Corrupted { key: String, reason: String },

    /// Outputs outside the build root cannot be relocated
    #[error("Output {0} is outside the build root")]
    OutsideRoot(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprinter;
    use crate::task::OutputSpec;
    use tempfile::TempDir;

    fn bundle(root: &Path, outputs: &[&str]) -> CacheBundle {
        let specs: Vec<OutputSpec> = outputs.iter().map(|o| OutputSpec::file(*o)).collect();
        CacheBundle {
            task_id: TaskId::new("build"),
            root: root.to_path_buf(),
            outputs: outputs.iter().map(PathBuf::from).collect(),
            output_fingerprint: Fingerprinter::new(root).fingerprint_outputs(&specs).unwrap(),
        }
    }

    fn key(n: &str) -> CacheKey {
        CacheKey::compute(&TaskId::new("build"), "impl", n)
    }

    #[test]
    fn test_cache_key_deterministic() {
        assert_eq!(key("inputs"), key("inputs"));
    }

    #[test]
    fn test_cache_key_differs_on_each_component() {
        let base = CacheKey::compute(&TaskId::new("a"), "impl", "in");
        assert_ne!(base, CacheKey::compute(&TaskId::new("b"), "impl", "in"));
        assert_ne!(base, CacheKey::compute(&TaskId::new("a"), "impl2", "in"));
        assert_ne!(base, CacheKey::compute(&TaskId::new("a"), "impl", "in2"));
    }

    #[test]
    fn test_cache_miss() {
        let temp = TempDir::new().unwrap();
        let cache = LocalCache::new(temp.path().join("cache"));
        assert!(cache.get(&key("x")).unwrap().is_none());
    }

    #[test]
    fn test_put_get_restore() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("ws");
        fs::create_dir_all(root.join("out")).unwrap();
        fs::write(root.join("out/app.bin"), b"compiled").unwrap();

        let cache = LocalCache::new(temp.path().join("cache"));
        let b = bundle(&root, &["out/app.bin"]);
        assert_eq!(cache.put(&key("1"), &b).unwrap(), PutOutcome::Stored);

        let entry = cache.get(&key("1")).unwrap().unwrap();
        assert_eq!(entry.output_paths, vec!["out/app.bin".to_string()]);
        assert_eq!(entry.output_fingerprint, b.output_fingerprint);

        // Restore into a fresh checkout
        let other = temp.path().join("other");
        fs::create_dir_all(&other).unwrap();
        cache.restore(&entry, &other).unwrap();
        assert_eq!(fs::read(other.join("out/app.bin")).unwrap(), b"compiled");

        let restored = Fingerprinter::new(&other)
            .fingerprint_outputs(&[OutputSpec::file("out/app.bin")])
            .unwrap();
        assert_eq!(restored, entry.output_fingerprint);
    }

    #[test]
    fn test_restore_replaces_stale_outputs() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("ws");
        fs::create_dir_all(root.join("dist")).unwrap();
        fs::write(root.join("dist/a.js"), "a").unwrap();

        let cache = LocalCache::new(temp.path().join("cache"));
        let specs = [OutputSpec::dir("dist")];
        let b = CacheBundle {
            task_id: TaskId::new("bundle"),
            root: root.clone(),
            outputs: vec![PathBuf::from("dist")],
            output_fingerprint: Fingerprinter::new(&root).fingerprint_outputs(&specs).unwrap(),
        };
        cache.put(&key("dist"), &b).unwrap();

        fs::write(root.join("dist/stale.js"), "old").unwrap();
        let entry = cache.get(&key("dist")).unwrap().unwrap();
        cache.restore(&entry, &root).unwrap();

        assert!(!root.join("dist/stale.js").exists());
        let restored = Fingerprinter::new(&root).fingerprint_outputs(&specs).unwrap();
        assert_eq!(restored, entry.output_fingerprint);
    }

    #[test]
    fn test_put_existing_is_noop() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        fs::write(root.join("o.txt"), "1").unwrap();
        let cache = LocalCache::new(temp.path().join("cache"));

        cache.put(&key("k"), &bundle(&root, &["o.txt"])).unwrap();
        let first = cache.get(&key("k")).unwrap().unwrap();

        fs::write(root.join("o.txt"), "different").unwrap();
        assert_eq!(
            cache.put(&key("k"), &bundle(&root, &["o.txt"])).unwrap(),
            PutOutcome::AlreadyPresent
        );
        assert_eq!(cache.get(&key("k")).unwrap().unwrap(), first);
    }

    #[test]
    fn test_corrupt_archive_is_distinct_from_miss() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        fs::write(root.join("o.txt"), "1").unwrap();
        let cache = LocalCache::new(temp.path().join("cache"));
        cache.put(&key("k"), &bundle(&root, &["o.txt"])).unwrap();

        let archive = cache.cache_dir().join(key("k").as_str()).join(ARCHIVE_FILE);
        fs::write(&archive, b"garbage").unwrap();

        assert!(matches!(
            cache.get(&key("k")),
            Err(CacheError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_corrupt_metadata_detected_and_overwritten_by_put() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        fs::write(root.join("o.txt"), "1").unwrap();
        let cache = LocalCache::new(temp.path().join("cache"));
        cache.put(&key("k"), &bundle(&root, &["o.txt"])).unwrap();

        let metadata = cache.cache_dir().join(key("k").as_str()).join(ENTRY_FILE);
        fs::write(&metadata, "{not json").unwrap();
        assert!(matches!(
            cache.get(&key("k")),
            Err(CacheError::Corrupted { .. })
        ));

        assert_eq!(
            cache.put(&key("k"), &bundle(&root, &["o.txt"])).unwrap(),
            PutOutcome::Stored
        );
        assert!(cache.get(&key("k")).unwrap().is_some());
    }

    #[test]
    fn test_output_outside_root_rejected() {
        let temp = TempDir::new().unwrap();
        let cache = LocalCache::new(temp.path().join("cache"));
        let b = CacheBundle {
            task_id: TaskId::new("t"),
            root: temp.path().join("ws"),
            outputs: vec![PathBuf::from("/somewhere/else")],
            output_fingerprint: Fingerprint::empty(),
        };
        assert!(matches!(
            cache.put(&key("k"), &b),
            Err(CacheError::OutsideRoot(_))
        ));
    }

    #[test]
    fn test_status_prune_clear() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        fs::write(root.join("o.txt"), "1").unwrap();
        let cache = LocalCache::new(temp.path().join("cache"));

        let empty = cache.status().unwrap();
        assert_eq!(empty.entries, 0);
        assert_eq!(empty.total_size, 0);

        cache.put(&key("a"), &bundle(&root, &["o.txt"])).unwrap();
        cache.put(&key("b"), &bundle(&root, &["o.txt"])).unwrap();
        let stats = cache.status().unwrap();
        assert_eq!(stats.entries, 2);
        assert!(stats.total_size > 0);

        let pruned = cache.prune(Duration::from_secs(3600)).unwrap();
        assert_eq!(pruned.total, 2);
        assert_eq!(pruned.removed, 0);
        assert_eq!(pruned.kept, 2);

        cache.clear().unwrap();
        assert_eq!(cache.status().unwrap().entries, 0);
    }

    #[test]
    fn test_cache_stats_formatted_size() {
        let stats = CacheStats {
            entries: 0,
            total_size: 1536,
        };
        assert_eq!(stats.formatted_size(), "1.5 KB");

        let stats = CacheStats {
            entries: 0,
            total_size: 500,
        };
        assert_eq!(stats.formatted_size(), "500 B");
    }
}
