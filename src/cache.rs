//! EntryStore - hierarchical reads and writes over a flat blob backend.
//!
//! Structured values are flattened into one backend leaf per scalar; the key
//! map index records which leaves exist so reads, listings and deletes can
//! find them again. Each store owns its index and holds it locked for the
//! duration of an operation, so operations on one store never interleave.
//! Separate stores (or processes) sharing a backend only meet through the
//! persisted index; see [`KeyMap`] for the consistency this gives.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::backend::{BlobBackend, BlobKey};
use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::index::KeyMap;
use crate::meta::{Anonymous, AuthorSource, MetaRead, Metadata};
use crate::path::{PathResolver, ResolvedPath};
use crate::tree::{expand, flatten, validate_value, Branch, Node, Scalar};

/// A namespaced cache over a [`BlobBackend`].
pub struct EntryStore<B: BlobBackend> {
    backend: Arc<B>,
    config: CacheConfig,
    resolver: PathResolver,
    index: Mutex<KeyMap<B>>,
    clock: Arc<dyn Clock>,
    author: Arc<dyn AuthorSource>,
}

impl<B: BlobBackend> EntryStore<B> {
    /// Create a store. Touches neither the backend nor `config`'s validity;
    /// only [`open`](Self::open) runs [`CacheConfig::validate`].
    pub fn new(backend: Arc<B>, config: CacheConfig) -> Self {
        let resolver = PathResolver::new(&config);
        let index = Mutex::new(KeyMap::new(backend.clone(), &config));
        Self {
            backend,
            config,
            resolver,
            index,
            clock: Arc::new(SystemClock),
            author: Arc::new(Anonymous),
        }
    }

    /// Validate `config`, create a store and, if configured, sweep expired
    /// entries left behind by earlier processes.
    pub async fn open(backend: Arc<B>, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let store = Self::new(backend, config);
        if store.config.collect_on_open {
            let report = store.collect_garbage().await?;
            info!(
                scanned = report.scanned,
                collected = report.collected,
                "Startup garbage collection finished"
            );
        }
        Ok(store)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_author(mut self, author: Arc<dyn AuthorSource>) -> Self {
        self.author = author;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Canonical form of `path`.
    pub fn resolve(&self, path: &str) -> Result<ResolvedPath> {
        self.resolver.resolve(path)
    }

    /// Canonical metadata path for `path`.
    pub fn resolve_meta(&self, path: &str) -> Result<ResolvedPath> {
        self.resolver.resolve_meta(path)
    }

    fn delimiter(&self) -> char {
        self.resolver.delimiter()
    }

    fn blob_key(path: &ResolvedPath) -> BlobKey {
        BlobKey::derive(path.kind(), path.as_str())
    }

    /// Write `value` at `path`, recording the configured author.
    ///
    /// `ttl` falls back to the configured default.
    pub async fn write(
        &self,
        path: &str,
        value: impl Into<Node>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let author = self.author.author();
        self.write_as(path, value, ttl, &author).await
    }

    /// Write `value` at `path`, recording `author` in its metadata.
    ///
    /// A structured value replaces the scalar previously stored at `path`
    /// and is written as one leaf per scalar it contains.
    pub async fn write_as(
        &self,
        path: &str,
        value: impl Into<Node>,
        ttl: Option<Duration>,
        author: &str,
    ) -> Result<()> {
        let value: Node = value.into();
        validate_value(&value, self.delimiter())?;
        let path = self.resolver.resolve(path)?;
        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());

        let mut index = self.index.lock().await;
        index.reconcile(false).await?;

        match value {
            Node::Leaf(scalar) => {
                self.write_leaf(&mut index, &path, &scalar, ttl, author)
                    .await?;
            }
            Node::Branch(children) => {
                self.delete_leaf(&mut index, &path).await?;
                let leaves = flatten(&children, self.delimiter());
                if leaves.is_empty() {
                    index.persist().await?;
                }
                for (sub, scalar) in leaves {
                    self.write_leaf(&mut index, &path.join(&sub), &scalar, ttl, author)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Store one scalar and, for data paths, its metadata record.
    async fn write_leaf(
        &self,
        index: &mut KeyMap<B>,
        path: &ResolvedPath,
        scalar: &Scalar,
        ttl: Duration,
        author: &str,
    ) -> Result<()> {
        self.store_leaf(index, path, scalar, ttl).await?;

        if !self.config.metadata_enabled || path.is_meta() {
            return Ok(());
        }
        let meta_path = self.resolver.meta_of(path);
        let record = Metadata::new(
            path,
            &Self::blob_key(path),
            ttl,
            self.clock.unix_now(),
            author.to_string(),
        );
        self.backend.delete(&Self::blob_key(&meta_path)).await?;
        for (field, value) in flatten(&record.to_branch()?, self.delimiter()) {
            self.store_leaf(index, &meta_path.join(&field), &value, ttl)
                .await?;
        }
        Ok(())
    }

    async fn store_leaf(
        &self,
        index: &mut KeyMap<B>,
        path: &ResolvedPath,
        scalar: &Scalar,
        ttl: Duration,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(scalar)?;
        self.backend.set(&Self::blob_key(path), bytes, ttl).await?;
        index.add(path.as_str()).await
    }

    /// Read the value at `path`.
    ///
    /// Returns `None` if nothing is stored there. Structured values are
    /// reassembled from their leaves; leaves that have expired are left out.
    pub async fn read(&self, path: &str) -> Result<Option<Node>> {
        let path = self.resolver.resolve(path)?;
        let mut index = self.index.lock().await;
        index.reconcile(false).await?;
        self.read_resolved(&index, &path).await
    }

    /// Read the metadata record for `path`.
    pub async fn read_meta(&self, path: &str) -> Result<MetaRead> {
        if !self.config.metadata_enabled {
            return Ok(MetaRead::Disabled);
        }
        let meta_path = self.resolver.resolve_meta(path)?;
        let mut index = self.index.lock().await;
        index.reconcile(false).await?;
        Ok(match self.read_resolved(&index, &meta_path).await? {
            Some(node) => MetaRead::Present(node),
            None => MetaRead::Absent,
        })
    }

    async fn read_resolved(
        &self,
        index: &KeyMap<B>,
        path: &ResolvedPath,
    ) -> Result<Option<Node>> {
        let tree = match index.subtree(path) {
            Some(Node::Branch(tree)) => tree,
            _ => return Ok(self.fetch_leaf(path).await?.map(Node::Leaf)),
        };

        let mut found = BTreeMap::new();
        for sub in flatten(&tree, self.delimiter()).into_keys() {
            if let Some(scalar) = self.fetch_leaf(&path.join(&sub)).await? {
                found.insert(sub, scalar);
            }
        }
        if found.is_empty() {
            return Ok(None);
        }
        Ok(Some(Node::Branch(expand(found, self.delimiter()))))
    }

    async fn fetch_leaf(&self, path: &ResolvedPath) -> Result<Option<Scalar>> {
        self.backend.get_json(&Self::blob_key(path)).await
    }

    /// True if the index knows `path` or anything below it.
    pub async fn contains(&self, path: &str) -> Result<bool> {
        let path = self.resolver.resolve(path)?;
        let mut index = self.index.lock().await;
        index.reconcile(false).await?;
        Ok(index.subtree(&path).is_some())
    }

    /// Delete `path` and everything below it, with their metadata.
    ///
    /// Stops at the first backend failure; leaves deleted before it stay
    /// deleted and the index keeps listing the rest.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let path = self.resolver.resolve(path)?;
        let mut index = self.index.lock().await;
        index.reconcile(true).await?;

        let leaves = Self::leaves_at(&index, &path, self.delimiter());
        debug!(path = %path, leaves = leaves.len(), "Deleting subtree");
        for leaf in &leaves {
            self.delete_leaf(&mut index, leaf).await?;
        }
        index.persist().await
    }

    /// Alias for [`delete`](Self::delete).
    pub async fn destroy(&self, path: &str) -> Result<()> {
        self.delete(path).await
    }

    /// Every indexed leaf at or below `path`; `path` itself when the index
    /// has nothing below it.
    fn leaves_at(index: &KeyMap<B>, path: &ResolvedPath, delimiter: char) -> Vec<ResolvedPath> {
        match index.subtree(path) {
            Some(Node::Branch(tree)) => {
                let mut leaves: Vec<ResolvedPath> = flatten(&tree, delimiter)
                    .into_keys()
                    .map(|sub| path.join(&sub))
                    .collect();
                if index.contains(path.as_str()) {
                    leaves.push(path.clone());
                }
                leaves
            }
            _ => vec![path.clone()],
        }
    }

    /// Remove one leaf from the backend and the in-memory index, along with
    /// its metadata record.
    async fn delete_leaf(&self, index: &mut KeyMap<B>, leaf: &ResolvedPath) -> Result<()> {
        self.backend.delete(&Self::blob_key(leaf)).await?;
        index.forget(leaf.as_str());

        if !self.config.metadata_enabled || leaf.is_meta() {
            return Ok(());
        }
        let meta_path = self.resolver.meta_of(leaf);
        if index.subtree(&meta_path).is_none() {
            return Ok(());
        }
        // Record fields are single segments; deeper paths belong to children.
        let delimiter = self.delimiter();
        let fields: Vec<ResolvedPath> = Self::leaves_at(index, &meta_path, delimiter)
            .into_iter()
            .filter(|meta_leaf| {
                meta_path
                    .relative(meta_leaf.as_str())
                    .map_or(true, |field| !field.contains(delimiter))
            })
            .collect();
        for meta_leaf in fields {
            self.backend.delete(&Self::blob_key(&meta_leaf)).await?;
            index.forget(meta_leaf.as_str());
        }
        Ok(())
    }

    /// Preview the structure below `prefix` (default: the default app root).
    ///
    /// Values are placeholders; nothing is fetched from the backend.
    pub async fn list(&self, prefix: Option<&str>) -> Result<Branch> {
        let prefix = self
            .resolver
            .resolve(prefix.unwrap_or(&self.config.default_app_root))?;
        let mut index = self.index.lock().await;
        index.reconcile(false).await?;

        Ok(expand(
            index
                .paths_under(&prefix)
                .map(|sub| (sub.to_string(), Value::Null)),
            self.delimiter(),
        ))
    }

    /// Flush the whole backend and reset the index.
    pub async fn flush(&self) -> Result<()> {
        let mut index = self.index.lock().await;
        self.backend.flush().await?;
        index.clear();
        index.persist().await?;
        info!("Flushed cache");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::IndexWriteMode;
    use crate::error::CacheError;
    use crate::memory::MemoryBackend;
    use crate::backend::Blob;
    use crate::meta::FixedAuthor;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TTL: Option<Duration> = Some(Duration::from_secs(60));

    fn store() -> EntryStore<MemoryBackend> {
        EntryStore::new(Arc::new(MemoryBackend::new()), CacheConfig::default())
    }

    fn leaf(value: Value) -> Node {
        Node::Leaf(value)
    }

    /// Memory backend whose deletes start failing once a budget runs out.
    struct FlakyBackend {
        inner: MemoryBackend,
        deletes_left: AtomicUsize,
    }

    impl FlakyBackend {
        fn new() -> Self {
            Self {
                inner: MemoryBackend::new(),
                deletes_left: AtomicUsize::new(usize::MAX),
            }
        }

        fn allow_deletes(&self, n: usize) {
            self.deletes_left.store(n, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl BlobBackend for FlakyBackend {
        async fn get(&self, key: &BlobKey) -> Result<Option<Blob>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &BlobKey, value: Vec<u8>, ttl: Duration) -> Result<u64> {
            self.inner.set(key, value, ttl).await
        }

        async fn delete(&self, key: &BlobKey) -> Result<()> {
            let allowed = self
                .deletes_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !allowed {
                return Err(CacheError::BackendUnavailable("down".to_string()));
            }
            self.inner.delete(key).await
        }

        async fn flush(&self) -> Result<()> {
            self.inner.flush().await
        }
    }

    #[tokio::test]
    async fn test_write_and_read_scalar() {
        let store = store();

        store.write("greeting", "hello", TTL).await.unwrap();
        assert_eq!(
            store.read("greeting").await.unwrap(),
            Some(leaf(json!("hello")))
        );
        assert_eq!(
            store.read("global.app.greeting").await.unwrap(),
            Some(leaf(json!("hello")))
        );
    }

    #[tokio::test]
    async fn test_read_missing() {
        let store = store();
        assert!(store.read("nothing.here").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_structured() {
        let store = store();

        store.write("k", json!({"a": 1, "b": 2}), TTL).await.unwrap();

        let value = store.read("k").await.unwrap().unwrap();
        assert_eq!(value.to_json(), json!({"a": 1, "b": 2}));
        assert_eq!(store.read("k.a").await.unwrap(), Some(leaf(json!(1))));
        assert_eq!(store.read("k.b").await.unwrap(), Some(leaf(json!(2))));
    }

    #[tokio::test]
    async fn test_sparse_keys_preserved() {
        let store = store();
        let mut branch = Branch::new();
        for key in ["0", "2", "5"] {
            branch.insert(key.to_string(), Node::from(format!("v{}", key)));
        }

        store.write("sparse", branch.clone(), TTL).await.unwrap();
        assert_eq!(
            store.read("sparse").await.unwrap(),
            Some(Node::Branch(branch))
        );
    }

    #[tokio::test]
    async fn test_structured_overwrites_scalar() {
        let store = store();

        store.write("slot", "scalar", TTL).await.unwrap();
        store.write("slot", json!({"inner": true}), TTL).await.unwrap();

        let value = store.read("slot").await.unwrap().unwrap();
        assert_eq!(value.to_json(), json!({"inner": true}));

        let index = store.index.lock().await;
        assert!(!index.contains("global.app.slot"));
        assert!(!index.contains("meta.global.app.slot.key"));
    }

    #[tokio::test]
    async fn test_structured_rewrite_keeps_child_metadata() {
        let store = store();

        store.write("doc", json!({"old": 1}), TTL).await.unwrap();
        store.write("doc", json!({"new": 2}), TTL).await.unwrap();

        assert!(store.read_meta("doc.old").await.unwrap().record().is_some());
        assert!(store.read_meta("doc.new").await.unwrap().record().is_some());
    }

    #[tokio::test]
    async fn test_metadata_written() {
        let clock = ManualClock::new();
        let store = store()
            .with_clock(Arc::new(clock.clone()))
            .with_author(Arc::new(FixedAuthor("ops@example.com".to_string())));

        store
            .write("m", "v", Some(Duration::from_secs(42)))
            .await
            .unwrap();

        let record = store.read_meta("m").await.unwrap().record().unwrap();
        assert_eq!(record.duration, 42);
        assert_eq!(record.key, "global.app.m");
        assert_eq!(record.expires - record.created, 42);
        assert_eq!(record.created, clock.unix_now());
        assert_eq!(record.author, "ops@example.com");
        assert_eq!(
            record.key_encoded,
            BlobKey::derive(crate::path::EntryKind::Data, "global.app.m").as_str()
        );
    }

    #[tokio::test]
    async fn test_write_as_overrides_author() {
        let store = store();
        store.write_as("w", json!(7), TTL, "someone").await.unwrap();

        let record = store.read_meta("w").await.unwrap().record().unwrap();
        assert_eq!(record.author, "someone");
    }

    #[tokio::test]
    async fn test_no_meta_of_meta() {
        let store = store();
        store.write("x", "v", TTL).await.unwrap();

        let index = store.index.lock().await;
        assert!(index.contains("meta.global.app.x.expires"));
        assert!(index.paths().all(|p| !p.starts_with("meta.meta.")));
    }

    #[tokio::test]
    async fn test_metadata_disabled() {
        let config = CacheConfig::default().with_metadata(false);
        let store = EntryStore::new(Arc::new(MemoryBackend::new()), config);

        store.write("x", "v", TTL).await.unwrap();
        assert_eq!(store.read_meta("x").await.unwrap(), MetaRead::Disabled);
        assert_eq!(store.index.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_value_rejected_before_mutation() {
        let store = store();

        let result = store.write("bad", json!({"a.b": 1}), TTL).await;
        assert!(matches!(result, Err(CacheError::InvalidValue(_))));
        assert!(store.backend().is_empty());
    }

    #[tokio::test]
    async fn test_huge_ttl_does_not_expire() {
        let store = store();
        let forever = Some(Duration::from_secs(u64::MAX));

        store.write("x", "v", forever).await.unwrap();
        assert_eq!(store.read("x").await.unwrap(), Some(leaf(json!("v"))));

        let record = store.read_meta("x").await.unwrap().record().unwrap();
        assert_eq!(record.expires, u64::MAX);
        assert_eq!(store.collect_garbage().await.unwrap().collected, 0);
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let config = CacheConfig::default().with_default_app_root("meta");
        let result = EntryStore::open(Arc::new(MemoryBackend::new()), config).await;
        assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_invalid_path() {
        let store = store();
        assert!(matches!(
            store.write("a..b", "v", TTL).await,
            Err(CacheError::InvalidPath(_))
        ));
        assert!(store.read("").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_structured() {
        let store = store();
        store
            .write("tree", json!({"a": 1, "b": {"c": 2}}), TTL)
            .await
            .unwrap();
        store.write("other", "kept", TTL).await.unwrap();

        store.delete("tree").await.unwrap();

        for path in ["tree", "tree.a", "tree.b.c"] {
            assert!(store.read(path).await.unwrap().is_none(), "{} survived", path);
        }
        assert_eq!(store.read_meta("tree.a").await.unwrap(), MetaRead::Absent);
        assert_eq!(store.read_meta("tree.b.c").await.unwrap(), MetaRead::Absent);
        assert_eq!(store.read("other").await.unwrap(), Some(leaf(json!("kept"))));
        assert!(store.read_meta("other").await.unwrap().record().is_some());
    }

    #[tokio::test]
    async fn test_delete_scalar_clears_index() {
        let store = store();
        store.write("s", "v", TTL).await.unwrap();

        store.destroy("s").await.unwrap();

        assert!(!store.contains("s").await.unwrap());
        let index = store.index.lock().await;
        assert!(index.paths().all(|p| !p.contains("app.s")));
    }

    #[tokio::test]
    async fn test_delete_stops_at_backend_failure() {
        let backend = Arc::new(FlakyBackend::new());
        let config = CacheConfig::default().with_metadata(false);
        let store = EntryStore::new(backend.clone(), config.clone());
        store
            .write("t", json!({"a": 1, "b": 2, "c": 3}), TTL)
            .await
            .unwrap();

        backend.allow_deletes(2);
        let result = store.delete("t").await;
        assert!(matches!(result, Err(CacheError::BackendUnavailable(_))));

        // The leaf that failed is still stored and still indexed.
        assert_eq!(store.read("t.c").await.unwrap(), Some(leaf(json!(3))));
        assert!(store.contains("t.c").await.unwrap());
        assert!(store.read("t.a").await.unwrap().is_none());

        // Nothing was persisted, so other stores still see every leaf.
        let other = EntryStore::new(backend, config);
        for path in ["t.a", "t.b", "t.c"] {
            assert!(other.contains(path).await.unwrap(), "{} dropped", path);
        }
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let store = store();
        store.delete("never.written").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_persists_for_other_stores() {
        let backend = Arc::new(MemoryBackend::new());
        let first = EntryStore::new(backend.clone(), CacheConfig::default());
        first.write("shared", json!({"a": 1}), TTL).await.unwrap();
        first.delete("shared").await.unwrap();

        let second = EntryStore::new(backend, CacheConfig::default());
        assert!(!second.contains("shared").await.unwrap());
    }

    #[tokio::test]
    async fn test_list() {
        let store = store();
        store.write("k.a", json!(1), TTL).await.unwrap();
        store.write("k.b.c", json!(2), TTL).await.unwrap();

        let tree = store.list(Some("k")).await.unwrap();
        assert_eq!(
            Node::Branch(tree).to_json(),
            json!({"a": null, "b": {"c": null}})
        );

        let app = store.list(None).await.unwrap();
        assert!(app.contains_key("k"));
    }

    #[tokio::test]
    async fn test_flush() {
        let store = store();
        store.write("a", json!(1), TTL).await.unwrap();

        store.flush().await.unwrap();

        assert!(store.read("a").await.unwrap().is_none());
        assert!(store.list(None).await.unwrap().is_empty());
        assert!(store.index.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_stores_share_index_through_backend() {
        let backend = Arc::new(MemoryBackend::new());
        let writer = EntryStore::new(backend.clone(), CacheConfig::default());
        writer.write("cfg", json!({"x": 1, "y": 2}), TTL).await.unwrap();

        let reader = EntryStore::new(backend, CacheConfig::default());
        let value = reader.read("cfg").await.unwrap().unwrap();
        assert_eq!(value.to_json(), json!({"x": 1, "y": 2}));
    }

    #[tokio::test]
    async fn test_compare_and_swap_mode() {
        let backend = Arc::new(MemoryBackend::new());
        let config = CacheConfig::default().with_index_write(IndexWriteMode::CompareAndSwap);
        let first = EntryStore::new(backend.clone(), config.clone());
        let second = EntryStore::new(backend.clone(), config.clone());

        first.write("one", json!(1), TTL).await.unwrap();
        second.write("two", json!(2), TTL).await.unwrap();
        first.write("three", json!(3), TTL).await.unwrap();

        let check = EntryStore::new(backend, config);
        for path in ["one", "two", "three"] {
            assert!(check.contains(path).await.unwrap(), "{} missing", path);
        }
    }
}
