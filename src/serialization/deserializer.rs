//! Records back into nodes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

use indexmap::IndexMap;
use serde::de::{self, DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use super::record::{
    KEY_APPLICATION_ID, KEY_CLOSURE, KEY_ID, KEY_REFERENCED_ID, KEY_SPECKLE_TYPE,
    KEY_TOTAL_CHILDREN, REFERENCE_TYPE,
};
use crate::error::TransportError;
use crate::model::{FieldError, NodeRef, TypeRegistry, Value, DATA_CHUNK_TYPE};
use crate::types::{Closure, ObjectId};

/// Why a record could not be read.
#[derive(Debug, Error)]
pub enum DeserializeError {
    /// The record is not valid JSON.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    /// The record lacks its type discriminator.
    #[error("record has no speckle_type")]
    MissingType,
    /// The record is structurally wrong.
    #[error("{0}")]
    Invalid(String),
    /// The registry has no factory for the type.
    #[error("unknown type '{0}'")]
    UnknownType(String),
    /// A reference points at an unavailable record.
    #[error("referenced object {0} could not be resolved")]
    MissingReference(ObjectId),
    /// A typed field rejected its value.
    #[error("field '{field}' of '{speckle_type}': {source}")]
    Field {
        speckle_type: String,
        field: String,
        #[source]
        source: FieldError,
    },
    /// The resolver itself failed (storage, cancellation, nested record).
    #[error("{0}")]
    Resolver(Box<TransportError>),
}

/// Looks up nodes referenced from the record being read.
pub trait ReferenceResolver {
    /// `Ok(None)` means the target is unavailable.
    fn resolve(&self, id: &ObjectId) -> Result<Option<NodeRef>, TransportError>;
}

impl ReferenceResolver for HashMap<ObjectId, NodeRef> {
    fn resolve(&self, id: &ObjectId) -> Result<Option<NodeRef>, TransportError> {
        Ok(self.get(id).cloned())
    }
}

/// Behaviour switches for [`ObjectDeserializer`].
#[derive(Clone, Debug, Default)]
pub struct DeserializeOptions {
    /// Unresolvable references read as null and mistyped fields land in the
    /// dynamic map, each with a warning, instead of failing the record.
    pub skip_invalid: bool,
}

impl DeserializeOptions {
    /// Strict options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets [`DeserializeOptions::skip_invalid`].
    pub fn skip_invalid(mut self, enabled: bool) -> Self {
        self.skip_invalid = enabled;
        self
    }
}

/// Rebuilds typed nodes from stored records.
pub struct ObjectDeserializer<'a> {
    registry: &'a TypeRegistry,
    resolver: &'a dyn ReferenceResolver,
    options: DeserializeOptions,
}

impl<'a> ObjectDeserializer<'a> {
    /// A deserializer creating nodes from `registry` and resolving references through `resolver`.
    pub fn new(
        registry: &'a TypeRegistry,
        resolver: &'a dyn ReferenceResolver,
        options: DeserializeOptions,
    ) -> Self {
        Self {
            registry,
            resolver,
            options,
        }
    }

    /// Reads one record into a node.
    pub fn deserialize(&self, json: &str) -> crate::Result<NodeRef> {
        self.read(json).map_err(TransportError::from)
    }

    /// Like [`deserialize`](Self::deserialize), naming `id` in malformed-input errors.
    pub fn deserialize_object(&self, id: &ObjectId, json: &str) -> crate::Result<NodeRef> {
        self.read(json).map_err(|err| match TransportError::from(err) {
            TransportError::Malformed { message, .. } => TransportError::Malformed {
                id: Some(id.clone()),
                message,
            },
            other => other,
        })
    }

    fn read(&self, json: &str) -> Result<NodeRef, DeserializeError> {
        let context = Context {
            registry: self.registry,
            resolver: self.resolver,
            options: &self.options,
            failure: RefCell::new(None),
        };
        let mut stream = serde_json::Deserializer::from_str(json);
        let parsed = ValueSeed { ctx: &context }
            .deserialize(&mut stream)
            .and_then(|value| stream.end().map(|()| value));
        let value = match parsed {
            Ok(value) => value,
            Err(err) => return Err(context.failure.take().unwrap_or(DeserializeError::Json(err))),
        };
        match value {
            Value::Object(node) => Ok(node),
            Value::Map(_) => Err(DeserializeError::MissingType),
            other => Err(DeserializeError::Invalid(format!(
                "record root is {}, expected an object",
                other.kind()
            ))),
        }
    }
}

/// Reads only the `__closure` of a record.
pub fn peek_closure(json: &str) -> Result<Closure, DeserializeError> {
    #[derive(Deserialize)]
    struct ClosureOnly {
        #[serde(rename = "__closure", default)]
        closure: Option<Closure>,
    }
    let parsed: ClosureOnly = serde_json::from_str(json)?;
    Ok(parsed.closure.unwrap_or_default())
}

struct Context<'a> {
    registry: &'a TypeRegistry,
    resolver: &'a dyn ReferenceResolver,
    options: &'a DeserializeOptions,
    failure: RefCell<Option<DeserializeError>>,
}

impl Context<'_> {
    /// Keeps the typed error and hands serde a message-only copy.
    fn fail<E: de::Error>(&self, err: DeserializeError) -> E {
        let message = err.to_string();
        self.failure.borrow_mut().get_or_insert(err);
        E::custom(message)
    }

    fn finish_object(&self, mut entries: IndexMap<String, Value>) -> Result<Value, DeserializeError> {
        let speckle_type = match entries.get(KEY_SPECKLE_TYPE) {
            None => return Ok(Value::Map(entries)),
            Some(Value::String(name)) => name.clone(),
            Some(other) => {
                return Err(DeserializeError::Invalid(format!(
                    "speckle_type must be a string, found {}",
                    other.kind()
                )))
            }
        };
        if speckle_type == REFERENCE_TYPE {
            return self.resolve_reference(&entries);
        }

        let mut node = self
            .registry
            .instantiate(&speckle_type)
            .ok_or_else(|| DeserializeError::UnknownType(speckle_type.clone()))?;
        let stored_id = match entries.shift_remove(KEY_ID) {
            Some(Value::String(raw)) => Some(
                ObjectId::parse(&raw).map_err(|err| DeserializeError::Invalid(err.to_string()))?,
            ),
            _ => None,
        };
        let application_id = match entries.shift_remove(KEY_APPLICATION_ID) {
            Some(Value::String(app_id)) => Some(app_id),
            _ => None,
        };
        entries.shift_remove(KEY_SPECKLE_TYPE);
        entries.shift_remove(KEY_TOTAL_CHILDREN);

        let fields = node.fields();
        for (name, value) in entries {
            match fields.iter().find(|field| field.name == name.as_str()) {
                Some(field) if field.attributes.ignore_if_null && value.is_null() => {}
                Some(_) => {
                    let fallback = self.options.skip_invalid.then(|| value.clone());
                    if let Err(source) = node.set_field(&name, value) {
                        let Some(value) = fallback else {
                            return Err(DeserializeError::Field {
                                speckle_type,
                                field: name,
                                source,
                            });
                        };
                        warn!(%speckle_type, field = %name, error = %source, "mistyped field kept as dynamic property");
                        node.core_mut().set(name, value);
                    }
                }
                None => node.core_mut().set(name, value),
            }
        }
        node.core_mut().set_application_id(application_id);
        node.on_deserialized();
        if let Some(id) = stored_id {
            node.core().assign_id(id);
        }
        Ok(Value::Object(NodeRef::from(node)))
    }

    fn resolve_reference(&self, entries: &IndexMap<String, Value>) -> Result<Value, DeserializeError> {
        let raw = entries
            .get(KEY_REFERENCED_ID)
            .and_then(Value::as_str)
            .ok_or_else(|| DeserializeError::Invalid("reference without referencedId".into()))?;
        let id = ObjectId::parse(raw).map_err(|err| DeserializeError::Invalid(err.to_string()))?;
        match self.resolver.resolve(&id) {
            Ok(Some(node)) => Ok(Value::Object(node)),
            Ok(None) if self.options.skip_invalid => {
                warn!(%id, "skipping unresolvable reference");
                Ok(Value::Null)
            }
            Ok(None) => Err(DeserializeError::MissingReference(id)),
            Err(err) => Err(DeserializeError::Resolver(Box::new(err))),
        }
    }
}

#[derive(Clone, Copy)]
struct ValueSeed<'c, 'a> {
    ctx: &'c Context<'a>,
}

impl<'de> DeserializeSeed<'de> for ValueSeed<'_, '_> {
    type Value = Value;

    fn deserialize<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for ValueSeed<'_, '_> {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a record value")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
        match i64::try_from(v) {
            Ok(i) => Ok(Value::Int(i)),
            Err(_) => {
                // lossy on purpose: values above i64::MAX are read as floats
                debug!(value = v, "integer exceeds i64, reading as float");
                Ok(Value::Float(v as f64))
            }
        }
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Value, E> {
        Ok(Value::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Value, E> {
        Ok(Value::String(v))
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element_seed(self)? {
            match item {
                Value::Object(node) if node.speckle_type() == DATA_CHUNK_TYPE => {
                    match node.get_field("data") {
                        Some(Value::List(data)) => items.extend(data),
                        _ => items.push(Value::Object(node)),
                    }
                }
                other => items.push(other),
            }
        }
        Ok(Value::List(items))
    }

    fn visit_map<A>(self, mut map: A) -> Result<Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut entries = IndexMap::new();
        while let Some(key) = map.next_key::<String>()? {
            if key == KEY_CLOSURE {
                map.next_value::<IgnoredAny>()?;
                continue;
            }
            let value = map.next_value_seed(self)?;
            entries.insert(key, value);
        }
        self.ctx
            .finish_object(entries)
            .map_err(|err| self.ctx.fail(err))
    }
}
