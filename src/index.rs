//! The key map index.
//!
//! The backend cannot enumerate its keys, so every path that has been written
//! is recorded here, and the whole set is persisted as one blob under a
//! reserved key. The in-memory copy is a cache of that blob: it is loaded
//! lazily by [`KeyMap::reconcile`] and written back after each mutation.
//!
//! With [`IndexWriteMode::Overwrite`] two processes that reconcile, mutate and
//! persist at the same time race, and the last writer silently discards the
//! other's change. [`IndexWriteMode::CompareAndSwap`] closes that window on
//! backends with versioned writes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::backend::{BlobBackend, BlobKey};
use crate::config::{CacheConfig, IndexWriteMode};
use crate::error::{CacheError, Result};
use crate::path::{EntryKind, ResolvedPath};
use crate::tree::{expand, Branch, Node};

/// Persisted form of the index.
#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexSnapshot {
    paths: BTreeSet<String>,
}

/// In-memory mirror of the persisted key map.
pub struct KeyMap<B: BlobBackend> {
    backend: Arc<B>,
    key: BlobKey,
    ttl: Duration,
    mode: IndexWriteMode,
    cas_retries: u32,
    delimiter: char,
    paths: BTreeSet<String>,
    /// Backend version of the blob the in-memory copy was last synced with.
    version: u64,
    added: BTreeSet<String>,
    removed: BTreeSet<String>,
}

impl<B: BlobBackend> KeyMap<B> {
    pub fn new(backend: Arc<B>, config: &CacheConfig) -> Self {
        Self {
            backend,
            key: BlobKey::derive(EntryKind::IndexRoot, &config.index_key),
            ttl: config.index_ttl(),
            mode: config.index_write,
            cas_retries: config.index_cas_retries,
            delimiter: config.delimiter,
            paths: BTreeSet::new(),
            version: 0,
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
        }
    }

    /// Load the persisted index and merge it into memory.
    ///
    /// Only touches the backend when the in-memory copy is empty or `force`
    /// is set.
    pub async fn reconcile(&mut self, force: bool) -> Result<()> {
        if !self.paths.is_empty() && !force {
            return Ok(());
        }
        let remote = self.fetch().await?;
        debug!(
            known = self.paths.len(),
            remote = remote.paths.len(),
            force,
            "Reconciling key map"
        );
        // Pending removals stay removed until persisted.
        let removed = &self.removed;
        self.paths
            .extend(remote.paths.into_iter().filter(|p| !removed.contains(p)));
        Ok(())
    }

    /// Record `path` as known and persist.
    pub async fn add(&mut self, path: &str) -> Result<()> {
        self.insert(path);
        self.persist().await
    }

    /// Drop `path` from the index and persist.
    ///
    /// Reloads the persisted index first so a stale in-memory copy doesn't
    /// overwrite paths added by other writers.
    pub async fn remove(&mut self, path: &str) -> Result<()> {
        self.reconcile(true).await?;
        self.forget(path);
        self.persist().await
    }

    /// Record `path` in memory only.
    pub fn insert(&mut self, path: &str) {
        self.removed.remove(path);
        self.added.insert(path.to_string());
        self.paths.insert(path.to_string());
    }

    /// Drop `path` in memory only. The next [`persist`](Self::persist)
    /// carries the removal.
    pub fn forget(&mut self, path: &str) {
        self.added.remove(path);
        self.removed.insert(path.to_string());
        self.paths.remove(path);
    }

    /// Empty the in-memory index.
    pub fn clear(&mut self) {
        self.removed.extend(std::mem::take(&mut self.paths));
        self.added.clear();
    }

    /// Write the in-memory index to the backend.
    pub async fn persist(&mut self) -> Result<()> {
        match self.mode {
            IndexWriteMode::Overwrite => {
                let bytes = self.encode()?;
                self.version = self.backend.set(&self.key, bytes, self.ttl).await?;
            }
            IndexWriteMode::CompareAndSwap => self.persist_versioned().await?,
        }
        self.added.clear();
        self.removed.clear();
        debug!(paths = self.paths.len(), version = self.version, "Persisted key map");
        Ok(())
    }

    async fn persist_versioned(&mut self) -> Result<()> {
        let mut attempt = 0;
        loop {
            let bytes = self.encode()?;
            match self
                .backend
                .compare_and_set(&self.key, self.version, bytes, self.ttl)
                .await
            {
                Ok(version) => {
                    self.version = version;
                    return Ok(());
                }
                Err(CacheError::VersionConflict { expected, found }) => {
                    if attempt >= self.cas_retries {
                        warn!(expected, found, "Giving up on key map write after conflicts");
                        return Err(CacheError::VersionConflict { expected, found });
                    }
                    attempt += 1;
                    debug!(expected, found, attempt, "Key map changed underneath, reapplying");
                    self.rebase().await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Replace the in-memory copy with the remote one plus pending changes.
    ///
    /// If the remote blob is gone (expired or flushed) the in-memory copy is
    /// kept as is, so leaves that outlive the index stay listed.
    async fn rebase(&mut self) -> Result<()> {
        let remote = self.fetch().await?;
        if self.version == 0 {
            debug!(known = self.paths.len(), "Persisted key map vanished, keeping local copy");
            return Ok(());
        }
        let mut paths = remote.paths;
        for path in &self.removed {
            paths.remove(path);
        }
        paths.extend(self.added.iter().cloned());
        self.paths = paths;
        Ok(())
    }

    /// Read the persisted snapshot and remember its version.
    async fn fetch(&mut self) -> Result<IndexSnapshot> {
        match self.backend.get(&self.key).await? {
            Some(blob) => {
                self.version = blob.version;
                blob.value_json()
            }
            None => {
                self.version = 0;
                Ok(IndexSnapshot::default())
            }
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let snapshot = IndexSnapshot {
            paths: self.paths.clone(),
        };
        Ok(serde_json::to_vec(&snapshot)?)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Every known path, in order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    /// Known paths strictly below `prefix`, relative to it.
    pub fn paths_under<'a>(&'a self, prefix: &'a ResolvedPath) -> impl Iterator<Item = &'a str> {
        let start = format!("{}{}", prefix.as_str(), self.delimiter);
        self.paths
            .range(start.clone()..)
            .take_while(move |path| path.starts_with(&start))
            .filter_map(move |path| prefix.relative(path))
    }

    /// Look up `path` in the index expanded into a tree.
    ///
    /// Returns `None` if the index knows nothing at or below `path`, a
    /// placeholder leaf if `path` itself is known with nothing below it, and
    /// a branch of placeholders when descendants are known.
    pub fn subtree(&self, path: &ResolvedPath) -> Option<Node> {
        let below: Branch = expand(
            self.paths_under(path)
                .map(|rel| (rel.to_string(), Value::Null)),
            self.delimiter,
        );
        if !below.is_empty() {
            Some(Node::Branch(below))
        } else if self.contains(path.as_str()) {
            Some(Node::placeholder())
        } else {
            None
        }
    }
}
