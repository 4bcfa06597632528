//! Cache configuration.
//!
//! Every field has a default, so a config file only needs to name the
//! values it changes:
//!
//! ```json
//! { "app_roots": ["billing", "reports"], "default_ttl_secs": 120 }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{CacheError, Result};

/// How the key map index blob is written back to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexWriteMode {
    /// Unconditional write. Concurrent writers may drop each other's changes.
    #[default]
    Overwrite,
    /// Versioned write that reloads and reapplies pending changes on conflict.
    CompareAndSwap,
}

/// Configuration for an [`EntryStore`](crate::EntryStore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Path segment separator.
    pub delimiter: char,
    /// TTL applied when a write does not name one.
    pub default_ttl_secs: u64,
    /// TTL of the persisted key map index.
    pub index_ttl_secs: u64,
    /// Write a metadata record alongside every data leaf.
    pub metadata_enabled: bool,
    /// Root that every data path lives under.
    pub global_root: String,
    /// Root that every metadata path lives under.
    pub meta_root: String,
    /// Reserved name the key map index is stored under.
    pub index_key: String,
    /// Application roots discovered by the host environment.
    pub app_roots: Vec<String>,
    /// Application root relative paths are placed under. Always legal.
    pub default_app_root: String,
    pub index_write: IndexWriteMode,
    /// Conflict retries for [`IndexWriteMode::CompareAndSwap`].
    pub index_cas_retries: u32,
    /// Run the garbage collector from [`EntryStore::open`](crate::EntryStore::open).
    pub collect_on_open: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            delimiter: '.',
            default_ttl_secs: 600,
            index_ttl_secs: 3600,
            metadata_enabled: true,
            global_root: "global".to_string(),
            meta_root: "meta".to_string(),
            index_key: "cache-key-map".to_string(),
            app_roots: Vec::new(),
            default_app_root: "app".to_string(),
            index_write: IndexWriteMode::Overwrite,
            index_cas_retries: 3,
            collect_on_open: true,
        }
    }
}

impl CacheConfig {
    /// Parse a JSON config document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn with_app_roots<I, S>(mut self, roots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.app_roots = roots.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_default_app_root(mut self, root: impl Into<String>) -> Self {
        self.default_app_root = root.into();
        self
    }

    pub fn with_metadata(mut self, enabled: bool) -> Self {
        self.metadata_enabled = enabled;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl_secs = ttl.as_secs();
        self
    }

    pub fn with_index_write(mut self, mode: IndexWriteMode) -> Self {
        self.index_write = mode;
        self
    }

    pub fn with_collect_on_open(mut self, enabled: bool) -> Self {
        self.collect_on_open = enabled;
        self
    }

    /// Default entry TTL.
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// TTL of the persisted index.
    pub fn index_ttl(&self) -> Duration {
        Duration::from_secs(self.index_ttl_secs)
    }

    /// Check that roots are usable as path segments and don't collide.
    pub fn validate(&self) -> Result<()> {
        if self.delimiter.is_alphanumeric() {
            return Err(CacheError::InvalidConfig(format!(
                "delimiter '{}' must not be alphanumeric",
                self.delimiter
            )));
        }
        let reserved = [&self.global_root, &self.meta_root];
        for root in reserved
            .iter()
            .copied()
            .chain(std::iter::once(&self.default_app_root))
            .chain(self.app_roots.iter())
        {
            if root.is_empty() {
                return Err(CacheError::InvalidConfig(
                    "namespace roots cannot be empty".to_string(),
                ));
            }
            if root.contains(self.delimiter) {
                return Err(CacheError::InvalidConfig(format!(
                    "root '{}' contains the delimiter '{}'",
                    root, self.delimiter
                )));
            }
        }
        if self.global_root == self.meta_root {
            return Err(CacheError::InvalidConfig(
                "global and meta roots must differ".to_string(),
            ));
        }
        if reserved.contains(&&self.default_app_root) {
            return Err(CacheError::InvalidConfig(format!(
                "default app root '{}' collides with a reserved root",
                self.default_app_root
            )));
        }
        if self.index_key.is_empty() {
            return Err(CacheError::InvalidConfig(
                "index key cannot be empty".to_string(),
            ));
        }
        if self.index_ttl_secs < self.default_ttl_secs {
            return Err(CacheError::InvalidConfig(format!(
                "index ttl {}s is shorter than entry ttl {}s",
                self.index_ttl_secs, self.default_ttl_secs
            )));
        }
        Ok(())
    }
}
