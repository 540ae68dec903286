//! Stored record layout and the helpers shared by writer, reader and verifier.

use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use crate::types::{content_hash, Closure, ObjectId};

/// Content id key.
pub const KEY_ID: &str = "id";
/// Type discriminator key.
pub const KEY_SPECKLE_TYPE: &str = "speckle_type";
/// Application id key.
pub const KEY_APPLICATION_ID: &str = "applicationId";
/// Closure table key.
pub const KEY_CLOSURE: &str = "__closure";
/// Target id key of a reference.
pub const KEY_REFERENCED_ID: &str = "referencedId";
/// Legacy child counter some producers add; never hashed, dropped on read.
pub const KEY_TOTAL_CHILDREN: &str = "totalChildrenCount";
/// Discriminator of a reference placeholder.
pub const REFERENCE_TYPE: &str = "reference";

/// The unit of storage and transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Record {
    /// Content id.
    pub id: ObjectId,
    /// Stored JSON, id and closure included.
    pub json: String,
    /// `false` for records already known to be durable in the local cache.
    pub needs_storage: bool,
    /// Closure of the record, kept alongside for the pipelines.
    #[serde(skip)]
    pub closure: Closure,
}

impl Record {
    /// Size of the stored form in bytes.
    pub fn len(&self) -> usize {
        self.json.len()
    }

    /// True for an empty JSON body.
    pub fn is_empty(&self) -> bool {
        self.json.is_empty()
    }
}

/// Placeholder written wherever a detached node was.
pub fn reference_json(id: &ObjectId, closure: &Closure) -> JsonValue {
    let mut map = Map::new();
    map.insert(KEY_SPECKLE_TYPE.to_string(), JsonValue::from(REFERENCE_TYPE));
    map.insert(KEY_REFERENCED_ID.to_string(), JsonValue::from(id.as_str()));
    if !closure.is_empty() {
        map.insert(KEY_CLOSURE.to_string(), closure.to_json());
    }
    JsonValue::Object(map)
}

/// Re-derives the content id of a stored record.
///
/// Drops the top-level `id`, `__closure` and `totalChildrenCount` keys and
/// hashes the compact rendering of what is left, keeping key order.
pub fn recompute_id(json: &str) -> Result<ObjectId, serde_json::Error> {
    let mut parsed: Map<String, JsonValue> = serde_json::from_str(json)?;
    parsed.shift_remove(KEY_ID);
    parsed.shift_remove(KEY_CLOSURE);
    parsed.shift_remove(KEY_TOTAL_CHILDREN);
    let canonical = serde_json::to_vec(&parsed)?;
    Ok(content_hash(&canonical))
}
