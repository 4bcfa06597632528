//! Path canonicalization.
//!
//! A canonical path always starts with the global root or the meta root:
//!
//! - `rand.x` (no legal root) becomes `global.app.rand.x`
//! - `billing.x` (an application root) becomes `global.billing.x`
//! - `global.x` and `meta.global.x` are already canonical
//!
//! Namespace membership is decided by comparing whole segments, so a path
//! like `metadata.x` is never mistaken for a meta path.

use std::collections::BTreeSet;
use std::fmt;

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};

/// What a canonical path addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryKind {
    /// User data under the global root.
    Data,
    /// Metadata record under the meta root.
    Meta,
    /// The persisted key map index.
    IndexRoot,
}

impl EntryKind {
    /// Stable tag mixed into backend keys.
    pub fn tag(&self) -> &'static str {
        match self {
            EntryKind::Data => "data",
            EntryKind::Meta => "meta",
            EntryKind::IndexRoot => "index",
        }
    }
}

/// A fully-qualified path beginning with a legal root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResolvedPath {
    path: String,
    kind: EntryKind,
    delimiter: char,
}

impl ResolvedPath {
    pub fn as_str(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn is_meta(&self) -> bool {
        self.kind == EntryKind::Meta
    }

    pub fn segments(&self) -> Vec<&str> {
        self.path.split(self.delimiter).collect()
    }

    /// First segment.
    pub fn root(&self) -> &str {
        self.path.split(self.delimiter).next().unwrap_or("")
    }

    /// Append a relative sub-path. The result stays in the same namespace.
    pub fn join(&self, relative: &str) -> ResolvedPath {
        ResolvedPath {
            path: format!("{}{}{}", self.path, self.delimiter, relative),
            kind: self.kind,
            delimiter: self.delimiter,
        }
    }

    /// True if `other` equals this path or is below it on a segment boundary.
    pub fn contains(&self, other: &str) -> bool {
        other == self.path || self.relative(other).is_some()
    }

    /// Strip this path and the following delimiter from a descendant path.
    pub fn relative<'a>(&self, descendant: &'a str) -> Option<&'a str> {
        descendant
            .strip_prefix(self.path.as_str())?
            .strip_prefix(self.delimiter)
    }
}

impl fmt::Display for ResolvedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl AsRef<str> for ResolvedPath {
    fn as_ref(&self) -> &str {
        &self.path
    }
}

/// Canonicalizes caller paths against the configured roots.
#[derive(Debug, Clone)]
pub struct PathResolver {
    delimiter: char,
    global_root: String,
    meta_root: String,
    default_app_root: String,
    app_roots: BTreeSet<String>,
}

impl PathResolver {
    pub fn new(config: &CacheConfig) -> Self {
        let mut app_roots: BTreeSet<String> = config.app_roots.iter().cloned().collect();
        app_roots.insert(config.default_app_root.clone());
        Self {
            delimiter: config.delimiter,
            global_root: config.global_root.clone(),
            meta_root: config.meta_root.clone(),
            default_app_root: config.default_app_root.clone(),
            app_roots,
        }
    }

    pub fn delimiter(&self) -> char {
        self.delimiter
    }

    /// Canonicalize `path`. Idempotent.
    pub fn resolve(&self, path: &str) -> Result<ResolvedPath> {
        self.validate(path)?;
        let first = self.first_segment(path);

        let mut resolved = path.to_string();
        if !self.is_reserved(first) && !self.app_roots.contains(first) {
            resolved = format!("{}{}{}", self.default_app_root, self.delimiter, resolved);
        }
        if !self.is_reserved(self.first_segment(&resolved)) {
            resolved = format!("{}{}{}", self.global_root, self.delimiter, resolved);
        }

        let kind = if self.first_segment(&resolved) == self.meta_root {
            EntryKind::Meta
        } else {
            EntryKind::Data
        };
        Ok(ResolvedPath {
            path: resolved,
            kind,
            delimiter: self.delimiter,
        })
    }

    /// Canonical metadata path for `path`. Meta paths map to themselves.
    pub fn resolve_meta(&self, path: &str) -> Result<ResolvedPath> {
        let resolved = self.resolve(path)?;
        Ok(self.meta_of(&resolved))
    }

    /// Metadata path for an already-resolved path.
    pub fn meta_of(&self, path: &ResolvedPath) -> ResolvedPath {
        if path.is_meta() {
            return path.clone();
        }
        ResolvedPath {
            path: format!("{}{}{}", self.meta_root, self.delimiter, path.path),
            kind: EntryKind::Meta,
            delimiter: self.delimiter,
        }
    }

    fn is_reserved(&self, segment: &str) -> bool {
        segment == self.global_root || segment == self.meta_root
    }

    fn first_segment<'a>(&self, path: &'a str) -> &'a str {
        path.split(self.delimiter).next().unwrap_or(path)
    }

    fn validate(&self, path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(CacheError::InvalidPath("path cannot be empty".to_string()));
        }
        if path.split(self.delimiter).any(str::is_empty) {
            return Err(CacheError::InvalidPath(format!(
                "path '{}' has an empty segment",
                path
            )));
        }
        Ok(())
    }
}
