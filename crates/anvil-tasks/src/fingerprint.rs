//! Content fingerprints for files, directory trees and opaque values

use std::collections::HashSet;
use std::fs;
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::trace;
use walkdir::WalkDir;

use crate::cache::CacheKey;
use crate::task::{normalize_path, InputSpec, Normalization, OutputSpec, Task};

const READ_BUFFER: usize = 64 * 1024;

/// What a fingerprinted location turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    File,
    Directory,
    Missing,
    Value,
}

/// Fingerprint of one input/output unit
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FingerprintEntry {
    /// Normalized location; empty for content-only entries
    pub key: String,
    pub kind: FileKind,
    /// Hex SHA-256 of the content; empty for directories and missing paths
    pub hash: String,
    pub len: u64,
}

/// An ordered set of entries plus a hash combining them.
///
/// Entries are sorted, so declaration order never affects the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub entries: Vec<FingerprintEntry>,
    pub hash: String,
}

impl Fingerprint {
    /// Entries form a multiset: identical content-only or name-only entries
    /// from distinct files are all kept.
    pub fn from_entries(mut entries: Vec<FingerprintEntry>) -> Self {
        entries.sort();

        let mut hasher = Sha256::new();
        for entry in &entries {
            hasher.update(entry.key.as_bytes());
            hasher.update([0u8]);
            hasher.update([entry.kind as u8]);
            hasher.update(entry.hash.as_bytes());
            hasher.update(entry.len.to_le_bytes());
        }

        Self {
            entries,
            hash: format!("{:x}", hasher.finalize()),
        }
    }

    pub fn empty() -> Self {
        Self::from_entries(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys whose entries differ between `self` and `previous`
    pub fn changed_keys(&self, previous: &Fingerprint) -> Vec<String> {
        let mut changed: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !previous.entries.contains(e))
            .chain(previous.entries.iter().filter(|e| !self.entries.contains(e)))
            .map(|e| e.key.clone())
            .collect();
        changed.sort();
        changed.dedup();
        changed
    }
}

/// Fingerprint of everything that determines a task's outputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFingerprint {
    pub inputs: Fingerprint,
    /// Hash of the action's implementation identity
    pub implementation: String,
    /// Combined key over task identity, implementation and inputs
    pub cache_key: CacheKey,
}

/// Computes fingerprints relative to a build root
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    root: PathBuf,
}

impl Fingerprinter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fingerprint a task's declared inputs and action identity
    pub fn fingerprint_task(&self, task: &Task) -> Result<TaskFingerprint, FingerprintError> {
        let inputs = self.fingerprint_inputs(&task.inputs)?;
        let implementation = sha256_hex(task.action.implementation_hash().as_bytes());
        let cache_key = CacheKey::compute(&task.id, &implementation, &inputs.hash);
        Ok(TaskFingerprint {
            inputs,
            implementation,
            cache_key,
        })
    }

    pub fn fingerprint_inputs(&self, inputs: &[InputSpec]) -> Result<Fingerprint, FingerprintError> {
        let mut entries = Entries::default();
        for input in inputs {
            match input {
                InputSpec::File {
                    path,
                    normalization,
                }
                | InputSpec::Directory {
                    path,
                    normalization,
                } => {
                    let absolute = normalize_path(&self.root, path);
                    self.collect(&absolute, *normalization, &mut entries)?;
                }
                InputSpec::Value { name, value } => {
                    entries.values.push(fingerprint_value(name, value));
                }
            }
        }
        Ok(Fingerprint::from_entries(entries.into_vec()))
    }

    /// Outputs are always fingerprinted relative to the root so restored outputs
    /// compare equal across checkouts.
    pub fn fingerprint_outputs(&self, outputs: &[OutputSpec]) -> Result<Fingerprint, FingerprintError> {
        let mut entries = Entries::default();
        for output in outputs {
            let absolute = normalize_path(&self.root, output.path());
            self.collect(&absolute, Normalization::Relative, &mut entries)?;
        }
        Ok(Fingerprint::from_entries(entries.into_vec()))
    }

    fn collect(
        &self,
        path: &Path,
        mode: Normalization,
        entries: &mut Entries,
    ) -> Result<(), FingerprintError> {
        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                entries.push(path, FingerprintEntry {
                    key: self.key_for(path, mode),
                    kind: FileKind::Missing,
                    hash: String::new(),
                    len: 0,
                });
                return Ok(());
            }
            Err(e) => return Err(FingerprintError::io(path, e)),
        };

        if !metadata.is_dir() {
            if !entries.seen(path) {
                entries.push(path, self.file_entry(path, mode)?);
            }
            return Ok(());
        }

        for item in WalkDir::new(path).follow_links(false).sort_by_file_name() {
            let item = item.map_err(|e| {
                let at = e.path().unwrap_or(path).to_path_buf();
                FingerprintError::io(&at, e.into())
            })?;
            let entry_path = item.path();

            let is_dir = if item.file_type().is_symlink() {
                match fs::metadata(entry_path) {
                    Ok(m) => m.is_dir(),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        entries.push(entry_path, FingerprintEntry {
                            key: self.key_for(entry_path, mode),
                            kind: FileKind::Missing,
                            hash: String::new(),
                            len: 0,
                        });
                        continue;
                    }
                    Err(e) => return Err(FingerprintError::io(entry_path, e)),
                }
            } else {
                item.file_type().is_dir()
            };

            if is_dir {
                // Content-only trees care about file contents, not layout
                if mode != Normalization::ContentOnly {
                    entries.push(entry_path, FingerprintEntry {
                        key: self.key_for(entry_path, mode),
                        kind: FileKind::Directory,
                        hash: String::new(),
                        len: 0,
                    });
                }
            } else if !entries.seen(entry_path) {
                entries.push(entry_path, self.file_entry(entry_path, mode)?);
            }
        }
        Ok(())
    }

    fn file_entry(&self, path: &Path, mode: Normalization) -> Result<FingerprintEntry, FingerprintError> {
        let key = self.key_for(path, mode);
        match hash_file(path) {
            Ok((hash, len)) => {
                trace!(path = %path.display(), %hash, "hashed file");
                Ok(FingerprintEntry {
                    key,
                    kind: FileKind::File,
                    hash,
                    len,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(FingerprintEntry {
                key,
                kind: FileKind::Missing,
                hash: String::new(),
                len: 0,
            }),
            Err(e) => Err(FingerprintError::io(path, e)),
        }
    }

    fn key_for(&self, path: &Path, mode: Normalization) -> String {
        match mode {
            Normalization::Absolute => portable(path),
            Normalization::Relative => match path.strip_prefix(&self.root) {
                Ok(rel) => portable(rel),
                Err(_) => portable(path),
            },
            Normalization::NameOnly => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Normalization::ContentOnly => String::new(),
        }
    }
}

/// Entries collected for one fingerprint. A location declared twice, directly
/// or through an enclosing directory, contributes once.
#[derive(Default)]
struct Entries {
    values: Vec<FingerprintEntry>,
    locations: HashSet<PathBuf>,
}

impl Entries {
    fn seen(&self, path: &Path) -> bool {
        self.locations.contains(path)
    }

    fn push(&mut self, path: &Path, entry: FingerprintEntry) {
        if self.locations.insert(path.to_path_buf()) {
            self.values.push(entry);
        }
    }

    fn into_vec(self) -> Vec<FingerprintEntry> {
        self.values
    }
}

/// Fingerprint an opaque value by its canonical JSON serialization
pub fn fingerprint_value(name: &str, value: &serde_json::Value) -> FingerprintEntry {
    // serde_json::Value keeps object keys sorted, so the encoding is canonical
    let encoded = value.to_string();
    FingerprintEntry {
        key: format!("value:{}", name),
        kind: FileKind::Value,
        hash: sha256_hex(encoded.as_bytes()),
        len: encoded.len() as u64,
    }
}

/// Stream a file through SHA-256, returning the hex digest and length
pub fn hash_file(path: &Path) -> io::Result<(String, u64)> {
    let file = fs::File::open(path)?;
    let mut reader = BufReader::with_capacity(READ_BUFFER, file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER];
    let mut len = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        len += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), len))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Render a path with `/` separators so keys are identical on every platform
fn portable(path: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut absolute = false;
    for component in path.components() {
        match component {
            Component::RootDir => absolute = true,
            Component::Prefix(p) => parts.push(p.as_os_str().to_string_lossy().into_owned()),
            Component::CurDir => {}
            other => parts.push(other.as_os_str().to_string_lossy().into_owned()),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

/// Errors computing fingerprints
#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("Failed to fingerprint {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FingerprintError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
