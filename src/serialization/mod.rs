//! Conversion between node graphs and content-addressed records.
//!
//! [`gather`] lists what a node serializes, [`detachable_children`] lists the
//! nodes that become records of their own, [`ObjectSerializer`] produces the
//! records and [`ObjectDeserializer`] reads them back.

mod children;
pub mod deserializer;
mod gather;
pub mod record;
pub mod serializer;

pub use children::detachable_children;
pub use deserializer::{
    peek_closure, DeserializeError, DeserializeOptions, ObjectDeserializer, ReferenceResolver,
};
pub use gather::{gather, GatheredProperty};
pub use record::{recompute_id, reference_json, Record};
pub use serializer::{
    ObjectSerializer, SerializeError, SerializedCache, SerializedEntry, SerializedNode,
};
