//! Node model: the trait every graph vertex implements, property values,
//! per-property attributes and the type registry used on the receive side.

mod arena;
mod attributes;
mod builtin;
mod macros;
mod node;
mod registry;
mod value;

pub use arena::{ArenaIndex, NodeArena};
pub use attributes::{
    is_skipped_name, FieldDescriptor, PropertyAttributes, DEFAULT_CHUNK_SIZE, DETACH_PREFIX,
    RESERVED_PREFIX,
};
pub use builtin::{DataChunk, DynamicNode, DATA_CHUNK_TYPE};
pub use node::{instance_key, nodes_equal, Node, NodeCore, NodeRef, NodeType};
pub use registry::{PostReceiveHook, TypeRegistry, TYPE_CHAIN_SEPARATOR};
pub use value::{FieldError, FieldValue, Value};
