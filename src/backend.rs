//! BlobBackend trait - the flat key-value store the namespace sits on.
//!
//! A backend only knows opaque keys and opaque byte values with a TTL. It
//! cannot list keys or hold nested values; everything hierarchical is built
//! on top of it by [`EntryStore`](crate::EntryStore).

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;

use crate::error::{CacheError, Result};
use crate::path::EntryKind;

/// Opaque backend key: hex SHA-256 of an entry kind tag and a path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobKey(String);

impl BlobKey {
    /// Derive the backend key for `path` in the given namespace.
    pub fn derive(kind: EntryKind, path: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(kind.tag().as_bytes());
        hasher.update([0u8]);
        hasher.update(path.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored value together with its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    /// The value (opaque bytes).
    pub value: Vec<u8>,
    /// Version assigned by the backend on the last write. Never reused.
    pub version: u64,
}

impl Blob {
    /// Deserialize the value as JSON.
    pub fn value_json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.value).map_err(Into::into)
    }
}

/// The backend contract.
///
/// A `ttl` of zero means the entry does not expire. Expired entries must
/// read as absent.
#[async_trait]
pub trait BlobBackend: Send + Sync {
    /// Get a blob by key.
    ///
    /// Returns `None` if the key does not exist or has expired.
    async fn get(&self, key: &BlobKey) -> Result<Option<Blob>>;

    /// Get a blob and deserialize it as JSON.
    async fn get_json<T: DeserializeOwned + Send>(&self, key: &BlobKey) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(blob) => Ok(Some(blob.value_json()?)),
            None => Ok(None),
        }
    }

    /// Store a value, replacing any previous one. Returns the new version.
    async fn set(&self, key: &BlobKey, value: Vec<u8>, ttl: Duration) -> Result<u64>;

    /// Store a JSON-encoded value.
    async fn set_json<T: Serialize + Send + Sync>(
        &self,
        key: &BlobKey,
        value: &T,
        ttl: Duration,
    ) -> Result<u64> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, bytes, ttl).await
    }

    /// Delete a key.
    ///
    /// Returns `Ok(())` if the key was deleted or didn't exist.
    async fn delete(&self, key: &BlobKey) -> Result<()>;

    /// Remove every key.
    async fn flush(&self) -> Result<()>;

    /// Compare-and-set: write only if the current version matches.
    ///
    /// An `expected_version` of 0 means the key must be absent. Returns the
    /// new version, or `VersionConflict`.
    async fn compare_and_set(
        &self,
        key: &BlobKey,
        expected_version: u64,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<u64> {
        let _ = (key, expected_version, value, ttl);
        Err(CacheError::Unsupported("compare_and_set".to_string()))
    }

    /// Check if a key exists.
    async fn exists(&self, key: &BlobKey) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Get the current version of a key (0 if not exists).
    async fn version(&self, key: &BlobKey) -> Result<u64> {
        Ok(self.get(key).await?.map(|b| b.version).unwrap_or(0))
    }
}
