//! Per-invocation build context

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::{BuildCache, LocalCache};
use crate::fingerprint::Fingerprinter;
use crate::history::{HistoryError, HistoryStore};

/// Everything the engine shares across tasks during one build.
///
/// Constructed once per invocation and handed to the scheduler; there is no
/// process-wide state.
#[derive(Clone)]
pub struct BuildContext {
    root: PathBuf,
    fingerprinter: Fingerprinter,
    history: HistoryStore,
    cache: Option<Arc<dyn BuildCache>>,
}

impl BuildContext {
    pub fn new(root: impl Into<PathBuf>, history: HistoryStore, cache: Option<Arc<dyn BuildCache>>) -> Self {
        let root = root.into();
        Self {
            fingerprinter: Fingerprinter::new(root.clone()),
            root,
            history,
            cache,
        }
    }

    /// Open the default stores under `<root>/.anvil`
    pub fn open_default(root: &Path, with_cache: bool) -> Result<Self, HistoryError> {
        let history = HistoryStore::open(root.join(".anvil").join("history"))?;
        let cache: Option<Arc<dyn BuildCache>> = if with_cache {
            Some(Arc::new(LocalCache::default_dir(root)))
        } else {
            None
        };
        Ok(Self::new(root, history, cache))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fingerprinter(&self) -> &Fingerprinter {
        &self.fingerprinter
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn cache(&self) -> Option<&dyn BuildCache> {
        self.cache.as_deref()
    }
}

impl std::fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildContext")
            .field("root", &self.root)
            .field("history", &self.history)
            .field("cache", &self.cache.is_some())
            .finish()
    }
}
