//! Per-leaf metadata records.
//!
//! Every data leaf written while metadata is enabled gets a sibling record in
//! the meta namespace (`meta.<canonical path>`), itself stored as a small
//! structured value: one backend leaf per field.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backend::BlobKey;
use crate::error::Result;
use crate::path::ResolvedPath;
use crate::tree::{Branch, Node};

/// Bookkeeping for one data leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// TTL in seconds.
    pub duration: u64,
    /// Canonical path of the data leaf.
    pub key: String,
    /// Backend key the data leaf is stored under.
    #[serde(rename = "keyEncoded")]
    pub key_encoded: String,
    /// Unix seconds at write time.
    pub created: u64,
    /// Unix seconds after which the leaf is garbage.
    pub expires: u64,
    /// Who wrote the leaf. Empty when unknown.
    pub author: String,
}

impl Metadata {
    pub fn new(
        path: &ResolvedPath,
        key: &BlobKey,
        ttl: Duration,
        now_unix: u64,
        author: String,
    ) -> Self {
        Self {
            duration: ttl.as_secs(),
            key: path.as_str().to_string(),
            key_encoded: key.as_str().to_string(),
            created: now_unix,
            expires: now_unix.saturating_add(ttl.as_secs()),
            author,
        }
    }

    /// True once `now_unix` is past the expiry time. A zero duration never
    /// expires.
    pub fn is_expired(&self, now_unix: u64) -> bool {
        self.duration != 0 && self.expires < now_unix
    }

    /// The record as a structured value ready to be flattened.
    pub fn to_branch(&self) -> Result<Branch> {
        match Node::from(serde_json::to_value(self)?) {
            Node::Branch(children) => Ok(children),
            Node::Leaf(_) => Ok(Branch::new()),
        }
    }

    /// Parse a record read back from the store.
    pub fn from_node(node: &Node) -> Result<Self> {
        Ok(serde_json::from_value(node.to_json())?)
    }
}

/// Outcome of a metadata read.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaRead {
    /// Metadata is turned off for this store.
    Disabled,
    /// No record exists.
    Absent,
    Present(Node),
}

impl MetaRead {
    /// The typed record, if one is present and well formed.
    ///
    /// A record missing fields (partially expired, or written by hand) reads
    /// as `None`.
    pub fn record(&self) -> Option<Metadata> {
        match self {
            MetaRead::Present(node) => Metadata::from_node(node).ok(),
            MetaRead::Disabled | MetaRead::Absent => None,
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, MetaRead::Disabled)
    }
}

/// Supplies the author recorded in metadata.
pub trait AuthorSource: Send + Sync {
    fn author(&self) -> String;
}

/// Records no author.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

impl AuthorSource for Anonymous {
    fn author(&self) -> String {
        String::new()
    }
}

/// Records the same author for every write.
#[derive(Debug, Clone)]
pub struct FixedAuthor(pub String);

impl AuthorSource for FixedAuthor {
    fn author(&self) -> String {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::path::{EntryKind, PathResolver};
    use crate::tree::flatten;

    fn sample() -> Metadata {
        let resolver = PathResolver::new(&CacheConfig::default());
        let path = resolver.resolve("rand.x").unwrap();
        let key = BlobKey::derive(EntryKind::Data, path.as_str());
        Metadata::new(&path, &key, Duration::from_secs(10), 1_000, "ops@example.com".into())
    }

    #[test]
    fn test_new_record() {
        let meta = sample();
        assert_eq!(meta.key, "global.app.rand.x");
        assert_eq!(meta.duration, 10);
        assert_eq!(meta.expires - meta.created, 10);
        assert_eq!(meta.key_encoded.len(), 64);
    }

    #[test]
    fn test_expiry() {
        let meta = sample();
        assert!(!meta.is_expired(1_010));
        assert!(meta.is_expired(1_011));

        let forever = Metadata {
            duration: 0,
            expires: 1_000,
            ..meta
        };
        assert!(!forever.is_expired(u64::MAX));
    }

    #[test]
    fn test_huge_ttl_saturates() {
        let resolver = PathResolver::new(&CacheConfig::default());
        let path = resolver.resolve("far").unwrap();
        let key = BlobKey::derive(EntryKind::Data, path.as_str());
        let meta = Metadata::new(&path, &key, Duration::MAX, 1_000, "a".into());

        assert_eq!(meta.expires, u64::MAX);
        assert!(!meta.is_expired(u64::MAX));
    }

    #[test]
    fn test_branch_round_trip() {
        let meta = sample();
        let branch = meta.to_branch().unwrap();

        let fields: Vec<String> = flatten(&branch, '.').into_keys().collect();
        assert_eq!(
            fields,
            vec!["author", "created", "duration", "expires", "key", "keyEncoded"]
        );
        assert_eq!(Metadata::from_node(&Node::Branch(branch)).unwrap(), meta);
    }

    #[test]
    fn test_partial_record_is_none() {
        let mut branch = sample().to_branch().unwrap();
        branch.remove("expires");
        assert!(MetaRead::Present(Node::Branch(branch)).record().is_none());
        assert!(MetaRead::Absent.record().is_none());
        assert!(MetaRead::Disabled.is_disabled());
    }

    #[test]
    fn test_author_sources() {
        assert_eq!(Anonymous.author(), "");
        assert_eq!(FixedAuthor("a@b".to_string()).author(), "a@b");
    }
}
