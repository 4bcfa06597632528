//! In-memory blob backend.
//!
//! This implementation is NOT durable - data is lost on process exit.
//! Use for testing and development only. Expiry is lazy: expired blobs read
//! as absent and are dropped on the next write to the map.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::backend::{Blob, BlobBackend, BlobKey};
use crate::clock::{Clock, SystemClock};
use crate::error::{CacheError, Result};

#[derive(Debug, Clone)]
struct StoredBlob {
    value: Vec<u8>,
    version: u64,
    expires_at: Option<SystemTime>,
}

impl StoredBlob {
    fn is_live(&self, now: SystemTime) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-memory implementation of BlobBackend.
///
/// Uses a BTreeMap behind a RwLock. Versions come from one counter shared by
/// all keys, so a version is never handed out twice even across flushes.
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<BlobKey, StoredBlob>>>,
    next_version: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl MemoryBackend {
    /// Create a new empty backend on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a new empty backend that expires entries against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            next_version: AtomicU64::new(1),
            clock,
        }
    }

    /// Number of live (unexpired) blobs.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.data.read().values().filter(|b| b.is_live(now)).count()
    }

    /// Check if the backend holds no live blobs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired blobs. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut data = self.data.write();
        let before = data.len();
        data.retain(|_, blob| blob.is_live(now));
        before - data.len()
    }

    /// Zero, or a TTL past the end of representable time, never expires.
    fn expiry(&self, ttl: Duration) -> Option<SystemTime> {
        if ttl.is_zero() {
            None
        } else {
            self.clock.now().checked_add(ttl)
        }
    }

    fn bump_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobBackend for MemoryBackend {
    async fn get(&self, key: &BlobKey) -> Result<Option<Blob>> {
        let now = self.clock.now();
        Ok(self
            .data
            .read()
            .get(key)
            .filter(|blob| blob.is_live(now))
            .map(|blob| Blob {
                value: blob.value.clone(),
                version: blob.version,
            }))
    }

    async fn set(&self, key: &BlobKey, value: Vec<u8>, ttl: Duration) -> Result<u64> {
        let mut data = self.data.write();
        let version = self.bump_version();
        data.insert(
            key.clone(),
            StoredBlob {
                value,
                version,
                expires_at: self.expiry(ttl),
            },
        );
        Ok(version)
    }

    async fn delete(&self, key: &BlobKey) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.data.write().clear();
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &BlobKey,
        expected_version: u64,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<u64> {
        let now = self.clock.now();
        let mut data = self.data.write();
        let current_version = data
            .get(key)
            .filter(|blob| blob.is_live(now))
            .map(|blob| blob.version)
            .unwrap_or(0);

        if current_version != expected_version {
            return Err(CacheError::VersionConflict {
                expected: expected_version,
                found: current_version,
            });
        }

        let version = self.bump_version();
        data.insert(
            key.clone(),
            StoredBlob {
                value,
                version,
                expires_at: self.expiry(ttl),
            },
        );
        Ok(version)
    }
}
