//! Nodes into content-addressed records.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Number, Value as JsonValue};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use super::gather::gather;
use super::record::{
    reference_json, Record, KEY_APPLICATION_ID, KEY_CLOSURE, KEY_ID, KEY_SPECKLE_TYPE,
};
use crate::model::{instance_key, DataChunk, Node, NodeRef, PropertyAttributes, Value};
use crate::types::{content_hash, Closure, ObjectId};

/// Why a node could not be serialized.
#[derive(Debug, Error)]
pub enum SerializeError {
    /// A property value has no JSON representation.
    #[error("cannot serialize property '{property}' of '{speckle_type}': {reason}")]
    Property {
        speckle_type: String,
        property: String,
        reason: String,
    },
    /// The run was cancelled between nodes.
    #[error("serialization cancelled")]
    Cancelled,
    /// JSON encoding failed.
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Outcome of serializing one detached node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedEntry {
    /// Content id of the node.
    pub id: ObjectId,
    /// Detached descendants with their depth.
    pub closure: Arc<Closure>,
}

/// Detached nodes already serialized during a run, keyed by instance identity.
///
/// Shared by the workers of one send run. Each entry holds its node, so an
/// address stays unique for as long as the cache lives.
#[derive(Debug, Default)]
pub struct SerializedCache {
    entries: DashMap<usize, (NodeRef, SerializedEntry)>,
}

impl SerializedCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for `node`, when it was serialized during this run.
    pub fn get(&self, node: &NodeRef) -> Option<SerializedEntry> {
        self.entries
            .get(&instance_key(node))
            .map(|entry| entry.value().1.clone())
    }

    /// Remembers `node` and its entry.
    pub fn insert(&self, node: &NodeRef, entry: SerializedEntry) {
        self.entries
            .insert(instance_key(node), (Arc::clone(node), entry));
    }

    /// Number of nodes serialized.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing was serialized.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of [`ObjectSerializer::serialize_node`].
#[derive(Clone, Debug)]
pub struct SerializedNode {
    /// Content id of the node.
    pub id: ObjectId,
    /// Detached descendants with their depth.
    pub closure: Arc<Closure>,
    /// Records produced by this call, children before parents. Empty when
    /// the node had already been serialized.
    pub records: Vec<Record>,
}

struct NodeOutput {
    id: ObjectId,
    closure: Closure,
    fields: Map<String, JsonValue>,
}

/// Turns nodes into content-addressed records.
///
/// Detached children are emitted before the records that reference them, so
/// the root record is always last.
pub struct ObjectSerializer<'a> {
    shared: Option<&'a SerializedCache>,
    cancel: Option<CancellationToken>,
    memo: HashMap<usize, (NodeRef, SerializedEntry)>,
    open: HashSet<usize>,
    emitted: HashSet<ObjectId>,
    records: Vec<Record>,
}

impl Default for ObjectSerializer<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> ObjectSerializer<'a> {
    /// A serializer with no shared cache or cancellation.
    pub fn new() -> Self {
        Self {
            shared: None,
            cancel: None,
            memo: HashMap::new(),
            open: HashSet::new(),
            emitted: HashSet::new(),
            records: Vec::new(),
        }
    }

    /// Reuses (and fills) a cache shared with other serializers of the same run.
    pub fn with_shared_cache(mut self, shared: &'a SerializedCache) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Aborts between nodes once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Treats the nodes behind `keys` as ancestors still being written, so
    /// references to them come out as null. Lets a node be serialized on its
    /// own with the same cycle cuts a walk from the root would make.
    pub(crate) fn assume_open(mut self, keys: impl IntoIterator<Item = usize>) -> Self {
        self.open.extend(keys);
        self
    }

    /// Serializes `root` and every detached node under it.
    pub fn serialize(&mut self, root: &NodeRef) -> Result<Vec<Record>, SerializeError> {
        Ok(self.serialize_node(root)?.records)
    }

    /// Serializes `node` as a detached record.
    ///
    /// Nothing is returned on failure; records already produced for siblings
    /// are discarded and the serializer should not be reused.
    pub fn serialize_node(&mut self, node: &NodeRef) -> Result<SerializedNode, SerializeError> {
        let mark = self.records.len();
        match self.detach_node(node) {
            Ok(Some(entry)) => Ok(SerializedNode {
                id: entry.id,
                closure: entry.closure,
                records: self.records.split_off(mark),
            }),
            Ok(None) => Err(SerializeError::Property {
                speckle_type: node.speckle_type().to_string(),
                property: KEY_ID.to_string(),
                reason: "node is already being serialized".to_string(),
            }),
            Err(err) => {
                self.records.truncate(mark);
                Err(err)
            }
        }
    }

    fn known(&self, node: &NodeRef) -> Option<SerializedEntry> {
        self.memo
            .get(&instance_key(node))
            .map(|(_, entry)| entry.clone())
            .or_else(|| self.shared.and_then(|shared| shared.get(node)))
    }

    /// Returns `None` when the node is already open (a reference cycle).
    fn detach_node(&mut self, node: &NodeRef) -> Result<Option<SerializedEntry>, SerializeError> {
        if let Some(entry) = self.known(node) {
            return Ok(Some(entry));
        }
        let Some(output) = self.write_node(node)? else {
            return Ok(None);
        };

        let NodeOutput {
            id,
            closure,
            mut fields,
        } = output;
        fields.insert(KEY_ID.to_string(), JsonValue::from(id.as_str()));
        if !closure.is_empty() {
            fields.insert(KEY_CLOSURE.to_string(), closure.to_json());
        }
        let json = serde_json::to_string(&JsonValue::Object(fields))?;
        let entry = SerializedEntry {
            id: id.clone(),
            closure: Arc::new(closure.clone()),
        };

        self.memo
            .insert(instance_key(node), (Arc::clone(node), entry.clone()));
        if let Some(shared) = self.shared {
            shared.insert(node, entry.clone());
        }
        if self.emitted.insert(id.clone()) {
            trace!(%id, speckle_type = node.speckle_type(), bytes = json.len(), "record emitted");
            self.records.push(Record {
                id,
                json,
                needs_storage: true,
                closure,
            });
        }
        Ok(Some(entry))
    }

    /// Writes the canonical fields of `node` and assigns its content id.
    fn write_node(&mut self, node: &NodeRef) -> Result<Option<NodeOutput>, SerializeError> {
        if self
            .cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            return Err(SerializeError::Cancelled);
        }
        let key = instance_key(node);
        if !self.open.insert(key) {
            warn!(
                speckle_type = node.speckle_type(),
                "reference cycle detected; writing null in place of the repeated node"
            );
            return Ok(None);
        }
        let result = self.write_fields(node.as_ref());
        self.open.remove(&key);
        let (fields, closure) = result?;

        let canonical = serde_json::to_vec(&fields)?;
        let id = content_hash(&canonical);
        node.core().assign_id(id.clone());
        Ok(Some(NodeOutput {
            id,
            closure,
            fields,
        }))
    }

    fn write_fields(
        &mut self,
        node: &dyn Node,
    ) -> Result<(Map<String, JsonValue>, Closure), SerializeError> {
        let mut fields = Map::new();
        let mut closure = Closure::new();
        for property in gather(node) {
            let attributes = property.attributes;
            if attributes.ignore_if_null && property.value.is_null() {
                continue;
            }
            let json = self
                .write_property(&property.value, attributes, &mut closure)
                .map_err(|err| match err {
                    PropertyFailure::Unsupported(reason) => SerializeError::Property {
                        speckle_type: node.speckle_type().to_string(),
                        property: property.name.clone(),
                        reason,
                    },
                    PropertyFailure::Nested(inner) => inner,
                })?;
            fields.insert(property.name, json);
        }
        if let Some(application_id) = node.core().application_id() {
            fields.insert(
                KEY_APPLICATION_ID.to_string(),
                JsonValue::from(application_id),
            );
        }
        fields.insert(
            KEY_SPECKLE_TYPE.to_string(),
            JsonValue::from(node.speckle_type()),
        );
        Ok((fields, closure))
    }

    fn write_property(
        &mut self,
        value: &Value,
        attributes: PropertyAttributes,
        closure: &mut Closure,
    ) -> Result<JsonValue, PropertyFailure> {
        match value {
            Value::List(items) if attributes.chunkable => {
                self.write_chunks(items, attributes.chunk_size, closure)
            }
            _ => self.write_value(value, attributes.detachable, closure),
        }
    }

    fn write_chunks(
        &mut self,
        items: &[Value],
        chunk_size: usize,
        closure: &mut Closure,
    ) -> Result<JsonValue, PropertyFailure> {
        let mut references = Vec::with_capacity(items.len().div_ceil(chunk_size.max(1)));
        for slice in items.chunks(chunk_size.max(1)) {
            let chunk: NodeRef = Arc::new(DataChunk {
                data: slice.to_vec(),
                ..Default::default()
            });
            references.push(self.write_detached(&chunk, closure)?);
        }
        Ok(JsonValue::Array(references))
    }

    fn write_value(
        &mut self,
        value: &Value,
        detach: bool,
        closure: &mut Closure,
    ) -> Result<JsonValue, PropertyFailure> {
        Ok(match value {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::from(*i),
            Value::Float(f) => match Number::from_f64(*f) {
                Some(number) => JsonValue::Number(number),
                None => {
                    return Err(PropertyFailure::Unsupported(format!(
                        "non-finite float {f}"
                    )))
                }
            },
            Value::String(s) => JsonValue::String(s.clone()),
            Value::List(items) => JsonValue::Array(
                items
                    .iter()
                    .map(|item| self.write_value(item, detach, closure))
                    .collect::<Result<Vec<_>, PropertyFailure>>()?,
            ),
            Value::Map(map) => {
                let mut out = Map::new();
                for (key, item) in map {
                    out.insert(key.clone(), self.write_value(item, detach, closure)?);
                }
                JsonValue::Object(out)
            }
            Value::Object(node) if detach => self.write_detached(node, closure)?,
            Value::Object(node) => self.write_inline(node, closure)?,
        })
    }

    fn write_detached(
        &mut self,
        node: &NodeRef,
        closure: &mut Closure,
    ) -> Result<JsonValue, PropertyFailure> {
        match self.detach_node(node).map_err(PropertyFailure::Nested)? {
            Some(entry) => {
                closure.add_child(&entry.id, &entry.closure);
                Ok(reference_json(&entry.id, &entry.closure))
            }
            None => Ok(JsonValue::Null),
        }
    }

    fn write_inline(
        &mut self,
        node: &NodeRef,
        closure: &mut Closure,
    ) -> Result<JsonValue, PropertyFailure> {
        match self.write_node(node).map_err(PropertyFailure::Nested)? {
            Some(output) => {
                closure.merge_inline(&output.closure);
                let mut fields = output.fields;
                fields.insert(KEY_ID.to_string(), JsonValue::from(output.id.as_str()));
                Ok(JsonValue::Object(fields))
            }
            None => Ok(JsonValue::Null),
        }
    }
}

enum PropertyFailure {
    Unsupported(String),
    Nested(SerializeError),
}

impl SerializeError {
    /// True for [`SerializeError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SerializeError::Cancelled)
    }
}
