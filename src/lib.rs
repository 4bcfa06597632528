//! # univrs-cache
//!
//! Hierarchical namespace cache for the Univrs ecosystem.
//!
//! Flat TTL blob stores (memcached-style: get/set/delete/flush by opaque key)
//! cannot list keys or hold nested values. This crate layers a dotted-path
//! namespace on top of one, providing:
//!
//! - **Nested values**: structured values are flattened into one backend leaf
//!   per scalar and reassembled on read
//! - **Browsing**: a persisted key map index records every written path
//! - **Recursive delete**: whole subtrees, metadata included
//! - **Metadata**: creation time, TTL and author stored beside every leaf
//! - **Garbage collection**: entries whose metadata is missing or expired
//!
//! ## Backends
//!
//! - [`MemoryBackend`]: In-memory store (testing and development)
//! - [`SqliteBackend`]: Embedded SQLite database with per-row expiry
//!
//! Any other store plugs in by implementing [`BlobBackend`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use univrs_cache::{CacheConfig, EntryStore, MemoryBackend};
//!
//! #[tokio::main]
//! async fn main() -> univrs_cache::Result<()> {
//!     let config = CacheConfig::default().with_app_roots(["billing"]);
//!     let store = EntryStore::open(Arc::new(MemoryBackend::new()), config).await?;
//!
//!     // `rand.x` lands at `global.app.rand.x`
//!     store.write("rand.x", "hello", Some(Duration::from_secs(10))).await?;
//!
//!     if let Some(value) = store.read("rand.x").await? {
//!         println!("Value: {}", value.to_json());
//!     }
//!
//!     if let Some(meta) = store.read_meta("rand.x").await?.record() {
//!         println!("Expires at: {}", meta.expires);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Structured Values
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use univrs_cache::{CacheConfig, EntryStore, MemoryBackend};
//!
//! #[tokio::main]
//! async fn main() -> univrs_cache::Result<()> {
//!     let store = EntryStore::new(Arc::new(MemoryBackend::new()), CacheConfig::default());
//!
//!     store
//!         .write("billing.limits", json!({"cpu": 2, "tiers": {"0": "free", "5": "pro"}}), None)
//!         .await?;
//!
//!     // Structure preview without fetching values
//!     let tree = store.list(Some("billing")).await?;
//!     println!("{:?}", tree.keys().collect::<Vec<_>>());
//!
//!     // Removes every leaf under the path along with its metadata
//!     store.delete("billing.limits").await?;
//!
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod gc;
pub mod index;
pub mod memory;
pub mod meta;
pub mod path;
pub mod sqlite;
pub mod tree;

// Re-export main types
pub use backend::{Blob, BlobBackend, BlobKey};
pub use cache::EntryStore;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, IndexWriteMode};
pub use error::{CacheError, Result};
pub use gc::GcReport;
pub use index::KeyMap;
pub use memory::MemoryBackend;
pub use meta::{Anonymous, AuthorSource, FixedAuthor, MetaRead, Metadata};
pub use path::{EntryKind, PathResolver, ResolvedPath};
pub use sqlite::SqliteBackend;
pub use tree::{expand, flatten, merge, Branch, Node, Scalar};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::backend::BlobBackend;
    pub use crate::cache::EntryStore;
    pub use crate::config::CacheConfig;
    pub use crate::error::{CacheError, Result};
    pub use crate::memory::MemoryBackend;
    pub use crate::meta::MetaRead;
    pub use crate::sqlite::SqliteBackend;
    pub use crate::tree::Node;
}
