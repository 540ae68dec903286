#![forbid(unsafe_code)]

//! Identifiers and bookkeeping shared by every layer of the transport.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of hex characters kept from the SHA-256 digest.
pub const OBJECT_ID_LEN: usize = 32;

/// Content identifier of a record: truncated lowercase hex SHA-256 of its canonical bytes.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    /// Wraps an identifier received from a store or the wire.
    ///
    /// Ids are opaque outside of [`content_hash`]; the only requirement is that they
    /// can travel inside the line-delimited wire format.
    pub fn parse(raw: &str) -> Result<Self, InvalidObjectId> {
        if raw.is_empty() {
            return Err(InvalidObjectId::Empty);
        }
        if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(InvalidObjectId::Whitespace(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the identifier, returning the owned string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ObjectId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Rejection reasons for [`ObjectId::parse`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidObjectId {
    /// The identifier was empty.
    #[error("object id is empty")]
    Empty,
    /// The identifier contained whitespace or control characters.
    #[error("object id '{0}' contains whitespace or control characters")]
    Whitespace(String),
}

/// Hashes canonical record bytes into an [`ObjectId`].
pub fn content_hash(canonical: &[u8]) -> ObjectId {
    let digest = Sha256::digest(canonical);
    let mut encoded = hex::encode(digest);
    encoded.truncate(OBJECT_ID_LEN);
    ObjectId(encoded)
}

/// Depth map from every record reachable through detach points to its
/// smallest distance from the owning record.
///
/// Ordered by id so that its JSON rendering is stable.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Closure {
    depths: BTreeMap<ObjectId, u32>,
}

impl Closure {
    /// Creates an empty closure.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `id` at `depth`, keeping the shallowest depth seen so far.
    pub fn insert(&mut self, id: ObjectId, depth: u32) {
        self.depths
            .entry(id)
            .and_modify(|current| *current = (*current).min(depth))
            .or_insert(depth);
    }

    /// Adds a detached child at depth 1 together with its own closure one level deeper.
    pub fn add_child(&mut self, child: &ObjectId, child_closure: &Closure) {
        self.insert(child.clone(), 1);
        for (id, depth) in child_closure.iter() {
            self.insert(id.clone(), depth.saturating_add(1));
        }
    }

    /// Merges the closure of an inline (non-detached) nested node at unchanged depth.
    pub fn merge_inline(&mut self, nested: &Closure) {
        for (id, depth) in nested.iter() {
            self.insert(id.clone(), *depth);
        }
    }

    /// Depth recorded for `id`, if reachable.
    pub fn depth(&self, id: &str) -> Option<u32> {
        self.depths.get(id).copied()
    }

    /// Ids referenced directly by the owning record.
    pub fn direct_children(&self) -> impl Iterator<Item = &ObjectId> + '_ {
        self.depths
            .iter()
            .filter(|(_, depth)| **depth == 1)
            .map(|(id, _)| id)
    }

    /// Iterates `(id, depth)` pairs in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&ObjectId, &u32)> + '_ {
        self.depths.iter()
    }

    /// Iterates the ids in the closure.
    pub fn ids(&self) -> impl Iterator<Item = &ObjectId> + '_ {
        self.depths.keys()
    }

    /// Number of records reachable from the owner.
    pub fn len(&self) -> usize {
        self.depths.len()
    }

    /// Whether nothing is reachable from the owner.
    pub fn is_empty(&self) -> bool {
        self.depths.is_empty()
    }

    /// Renders the closure as the JSON object stored under `__closure`.
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .depths
            .iter()
            .map(|(id, depth)| (id.to_string(), serde_json::Value::from(*depth)))
            .collect();
        serde_json::Value::Object(map)
    }
}

impl FromIterator<(ObjectId, u32)> for Closure {
    fn from_iter<T: IntoIterator<Item = (ObjectId, u32)>>(iter: T) -> Self {
        let mut closure = Closure::new();
        for (id, depth) in iter {
            closure.insert(id, depth);
        }
        closure
    }
}
