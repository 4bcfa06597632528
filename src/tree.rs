//! Nested values and the flatten/expand transforms.
//!
//! A [`Node`] is either a scalar leaf or a branch of named children. Branch
//! keys are opaque strings: sequences are stored with their index as the key
//! (`"0"`, `"1"`, ...) and keys are never renumbered, so a sparse sequence
//! keeps its gaps through every flatten/expand/merge.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{CacheError, Result};

/// A terminal value. Stored in the backend as one opaque blob.
pub type Scalar = Value;

/// Named children of a structured value.
pub type Branch = BTreeMap<String, Node>;

/// A cache value: a single scalar or a nested structure.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Leaf(Scalar),
    Branch(Branch),
}

impl Node {
    /// Placeholder leaf used by index trees and browsing previews.
    pub fn placeholder() -> Self {
        Node::Leaf(Value::Null)
    }

    pub fn is_branch(&self) -> bool {
        matches!(self, Node::Branch(_))
    }

    pub fn as_leaf(&self) -> Option<&Scalar> {
        match self {
            Node::Leaf(value) => Some(value),
            Node::Branch(_) => None,
        }
    }

    pub fn as_branch(&self) -> Option<&Branch> {
        match self {
            Node::Branch(children) => Some(children),
            Node::Leaf(_) => None,
        }
    }

    /// Follow `segments` down from this node.
    pub fn get_path<S: AsRef<str>>(&self, segments: &[S]) -> Option<&Node> {
        let mut node = self;
        for segment in segments {
            node = node.as_branch()?.get(segment.as_ref())?;
        }
        Some(node)
    }

    /// Convert to JSON. Branches become objects.
    pub fn to_json(&self) -> Value {
        match self {
            Node::Leaf(value) => value.clone(),
            Node::Branch(children) => Value::Object(
                children
                    .iter()
                    .map(|(key, child)| (key.clone(), child.to_json()))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }
}

impl From<Value> for Node {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => {
                Node::Branch(map.into_iter().map(|(k, v)| (k, Node::from(v))).collect())
            }
            Value::Array(items) => Node::Branch(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| (i.to_string(), Node::from(v)))
                    .collect(),
            ),
            scalar => Node::Leaf(scalar),
        }
    }
}

impl From<Branch> for Node {
    fn from(children: Branch) -> Self {
        Node::Branch(children)
    }
}

impl From<&str> for Node {
    fn from(value: &str) -> Self {
        Node::Leaf(Value::String(value.to_string()))
    }
}

impl From<String> for Node {
    fn from(value: String) -> Self {
        Node::Leaf(Value::String(value))
    }
}

impl From<i64> for Node {
    fn from(value: i64) -> Self {
        Node::Leaf(Value::from(value))
    }
}

impl From<bool> for Node {
    fn from(value: bool) -> Self {
        Node::Leaf(Value::Bool(value))
    }
}

/// Reject branch keys that can't survive a flatten/expand round trip.
pub fn validate_value(node: &Node, delimiter: char) -> Result<()> {
    if let Node::Branch(children) = node {
        for (key, child) in children {
            if key.is_empty() {
                return Err(CacheError::InvalidValue(
                    "structured value has an empty key".to_string(),
                ));
            }
            if key.contains(delimiter) {
                return Err(CacheError::InvalidValue(format!(
                    "key '{}' contains the path delimiter '{}'",
                    key, delimiter
                )));
            }
            validate_value(child, delimiter)?;
        }
    }
    Ok(())
}

/// Flatten a branch into `dotted.subpath -> scalar`, depth first.
pub fn flatten(children: &Branch, delimiter: char) -> BTreeMap<String, Scalar> {
    let mut out = BTreeMap::new();
    flatten_into(children, None, delimiter, &mut out);
    out
}

fn flatten_into(
    children: &Branch,
    prefix: Option<&str>,
    delimiter: char,
    out: &mut BTreeMap<String, Scalar>,
) {
    for (key, child) in children {
        let path = match prefix {
            Some(prefix) => format!("{}{}{}", prefix, delimiter, key),
            None => key.clone(),
        };
        match child {
            Node::Leaf(value) => {
                out.insert(path, value.clone());
            }
            Node::Branch(grandchildren) => {
                flatten_into(grandchildren, Some(&path), delimiter, out);
            }
        }
    }
}

/// Inverse of [`flatten`]: build one single-branch chain per entry and merge
/// them all together.
pub fn expand<I>(flat: I, delimiter: char) -> Branch
where
    I: IntoIterator<Item = (String, Scalar)>,
{
    let mut result = Branch::new();
    for (path, value) in flat {
        let mut node = Node::Leaf(value);
        for segment in path.rsplit(delimiter) {
            let mut parent = Branch::new();
            parent.insert(segment.to_string(), node);
            node = Node::Branch(parent);
        }
        if let Node::Branch(chain) = node {
            result = merge(result, chain);
        }
    }
    result
}

/// Recursive merge. Where both sides hold a branch under the same key the
/// branches merge; otherwise `overlay` wins. Keys match by identity only.
pub fn merge(mut base: Branch, overlay: Branch) -> Branch {
    for (key, incoming) in overlay {
        let merged = match (base.remove(&key), incoming) {
            (Some(Node::Branch(existing)), Node::Branch(incoming)) => {
                Node::Branch(merge(existing, incoming))
            }
            (_, incoming) => incoming,
        };
        base.insert(key, merged);
    }
    base
}
