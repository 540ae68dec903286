use std::any::Any;
use std::sync::Arc;

use super::attributes::FieldDescriptor;
use super::node::{Node, NodeCore};
use super::value::{FieldError, Value};

/// Type name of the builtin chunk record.
pub const DATA_CHUNK_TYPE: &str = "Speckle.Core.Models.DataChunk";

crate::graph_object! {
    /// One slice of a chunked list property, stored as its own record.
    pub struct DataChunk as "Speckle.Core.Models.DataChunk" {
        /// The items of this slice.
        pub data: Vec<Value>,
    }
}

/// A node whose type is only known at runtime.
///
/// Every property lives in the dynamic map, so the node re-serializes to the
/// record it was read from. Used when the registry falls back for unknown types.
#[derive(Debug, Clone)]
pub struct DynamicNode {
    speckle_type: String,
    core: NodeCore,
}

impl DynamicNode {
    /// An empty node of type `speckle_type`.
    pub fn new(speckle_type: impl Into<String>) -> Self {
        Self {
            speckle_type: speckle_type.into(),
            core: NodeCore::new(),
        }
    }
}

impl Node for DynamicNode {
    fn speckle_type(&self) -> &str {
        &self.speckle_type
    }

    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn fields(&self) -> &'static [FieldDescriptor] {
        &[]
    }

    fn get_field(&self, _name: &str) -> Option<Value> {
        None
    }

    fn set_field(&mut self, _name: &str, _value: Value) -> Result<bool, FieldError> {
        Ok(false)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
