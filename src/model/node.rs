use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;

use super::attributes::FieldDescriptor;
use super::value::{FieldError, Value};
use crate::types::ObjectId;

/// Shared handle to a graph node. Instance identity is the pointer.
pub type NodeRef = Arc<dyn Node>;

/// A polymorphic graph vertex.
///
/// Typed fields are described by the static [`FieldDescriptor`] table returned
/// from [`Node::fields`]; everything else lives in the ordered dynamic map of
/// [`NodeCore`]. Implementations are normally generated by
/// [`graph_object!`](crate::graph_object).
pub trait Node: Send + Sync + fmt::Debug + 'static {
    /// Type discriminator written as `speckle_type`.
    fn speckle_type(&self) -> &str;

    /// Identity fields and dynamic properties.
    fn core(&self) -> &NodeCore;

    /// Mutable access to the core.
    fn core_mut(&mut self) -> &mut NodeCore;

    /// Typed fields in declaration order.
    fn fields(&self) -> &'static [FieldDescriptor];

    /// Reads a typed field; `None` when the type has no such field.
    fn get_field(&self, name: &str) -> Option<Value>;

    /// Writes a typed field. Returns `Ok(false)` when the type has no such field.
    fn set_field(&mut self, name: &str, value: Value) -> Result<bool, FieldError>;

    /// Called once after the deserializer has assigned every field.
    fn on_deserialized(&mut self) {}

    /// For downcasting to the concrete type.
    fn as_any(&self) -> &dyn Any;

    /// Owned form of [`Node::as_any`].
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A node type known at compile time.
pub trait NodeType: Node + Default + Sized {
    const SPECKLE_TYPE: &'static str;
    const FIELDS: &'static [FieldDescriptor];
}

/// State every node carries besides its typed fields.
#[derive(Debug, Default, Clone)]
pub struct NodeCore {
    application_id: Option<String>,
    id: OnceLock<ObjectId>,
    dynamic: IndexMap<String, Value>,
}

impl NodeCore {
    /// Empty core without ids or dynamic properties.
    pub fn new() -> Self {
        Self::default()
    }

    /// Caller-assigned correlation id.
    pub fn application_id(&self) -> Option<&str> {
        self.application_id.as_deref()
    }

    /// Sets the application id and forgets the content id.
    pub fn set_application_id(&mut self, application_id: Option<String>) {
        self.application_id = application_id;
        self.clear_id();
    }

    /// Content id, once the serializer or deserializer has assigned it.
    pub fn id(&self) -> Option<&ObjectId> {
        self.id.get()
    }

    /// Stores the content id. The first write wins; later calls return the stored id.
    pub fn assign_id(&self, id: ObjectId) -> &ObjectId {
        self.id.get_or_init(|| id)
    }

    /// Forgets the content id after a mutation.
    pub fn clear_id(&mut self) {
        self.id = OnceLock::new();
    }

    /// Dynamic properties in insertion order.
    pub fn dynamic(&self) -> &IndexMap<String, Value> {
        &self.dynamic
    }

    /// Dynamic property `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.dynamic.get(name)
    }

    /// Sets a dynamic property, keeping its original position when it already exists.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.dynamic.insert(name.into(), value.into());
        self.clear_id();
    }

    /// Removes dynamic property `name`, forgetting the content id when it existed.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let removed = self.dynamic.shift_remove(name);
        if removed.is_some() {
            self.clear_id();
        }
        removed
    }
}

/// Identity key of a node instance.
pub fn instance_key(node: &NodeRef) -> usize {
    Arc::as_ptr(node) as *const () as usize
}

/// Field-wise equality: same type, application id, typed fields and dynamic map.
///
/// Content ids are ignored. Follows nested nodes recursively, so it must not
/// be used on graphs containing cycles.
pub fn nodes_equal(a: &dyn Node, b: &dyn Node) -> bool {
    if a.speckle_type() != b.speckle_type()
        || a.core().application_id() != b.core().application_id()
    {
        return false;
    }
    let typed_equal = a
        .fields()
        .iter()
        .all(|field| a.get_field(field.name) == b.get_field(field.name));
    typed_equal && a.core().dynamic() == b.core().dynamic()
}
