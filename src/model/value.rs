use std::sync::Arc;

use indexmap::IndexMap;
use thiserror::Error;

use super::node::{Node, NodeRef, NodeType};

/// A property value carried by a node.
///
/// `Object` holds another node by shared reference; two `Object` values are
/// equal when the nodes they point at are field-wise equal, not when they are
/// the same instance.
#[derive(Clone, Debug, Default)]
pub enum Value {
    /// Absent or JSON `null`.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer that fits in 64 bits.
    Int(i64),
    /// Any other number.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered list.
    List(Vec<Value>),
    /// Nested map kept inline.
    Map(IndexMap<String, Value>),
    /// Another node.
    Object(NodeRef),
}

impl Value {
    /// True for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
        }
    }

    /// The boolean, if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The integer, if this is an `Int`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view of `Int` and `Float`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// The string, if this is a `String`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// The items, if this is a `List`.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// The entries, if this is a `Map`.
    pub fn as_map(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// The node, if this is an `Object`.
    pub fn as_node(&self) -> Option<&NodeRef> {
        match self {
            Value::Object(node) => Some(node),
            _ => None,
        }
    }

    /// Downcasts an `Object` value to a concrete node type.
    pub fn downcast<T: NodeType>(&self) -> Option<Arc<T>> {
        self.as_node().and_then(|node| node.clone().into_any().downcast::<T>().ok())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => {
                Arc::ptr_eq(a, b) || super::node::nodes_equal(a.as_ref(), b.as_ref())
            }
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(value: IndexMap<String, Value>) -> Self {
        Value::Map(value)
    }
}

impl From<NodeRef> for Value {
    fn from(value: NodeRef) -> Self {
        Value::Object(value)
    }
}

/// A typed field value that does not fit the field's declared type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected {expected}, found {found}")]
pub struct FieldError {
    /// Type the field declares.
    pub expected: &'static str,
    /// Kind of the value offered.
    pub found: &'static str,
}

impl FieldError {
    /// Error for `found` offered where `expected` was declared.
    pub fn new(expected: &'static str, found: &Value) -> Self {
        Self {
            expected,
            found: found.kind(),
        }
    }
}

/// Conversion between a typed field and [`Value`].
pub trait FieldValue: Sized {
    /// Converts the field into a [`Value`].
    fn to_value(&self) -> Value;
    /// Reads the field back from a [`Value`].
    fn from_value(value: Value) -> Result<Self, FieldError>;
}

impl FieldValue for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }

    fn from_value(value: Value) -> Result<Self, FieldError> {
        Ok(value)
    }
}

impl FieldValue for bool {
    fn to_value(&self) -> Value {
        Value::Bool(*self)
    }

    fn from_value(value: Value) -> Result<Self, FieldError> {
        value.as_bool().ok_or_else(|| FieldError::new("bool", &value))
    }
}

impl FieldValue for i64 {
    fn to_value(&self) -> Value {
        Value::Int(*self)
    }

    fn from_value(value: Value) -> Result<Self, FieldError> {
        match value {
            Value::Int(i) => Ok(i),
            // integral floats written by other producers
            Value::Float(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
                Ok(f as i64)
            }
            other => Err(FieldError::new("int", &other)),
        }
    }
}

impl FieldValue for i32 {
    fn to_value(&self) -> Value {
        Value::Int(i64::from(*self))
    }

    fn from_value(value: Value) -> Result<Self, FieldError> {
        let found = value.kind();
        let wide = i64::from_value(value)?;
        i32::try_from(wide).map_err(|_| FieldError {
            expected: "32-bit int",
            found,
        })
    }
}

impl FieldValue for f64 {
    fn to_value(&self) -> Value {
        Value::Float(*self)
    }

    fn from_value(value: Value) -> Result<Self, FieldError> {
        value.as_f64().ok_or_else(|| FieldError::new("float", &value))
    }
}

impl FieldValue for String {
    fn to_value(&self) -> Value {
        Value::String(self.clone())
    }

    fn from_value(value: Value) -> Result<Self, FieldError> {
        match value {
            Value::String(s) => Ok(s),
            other => Err(FieldError::new("string", &other)),
        }
    }
}

impl FieldValue for NodeRef {
    fn to_value(&self) -> Value {
        Value::Object(self.clone())
    }

    fn from_value(value: Value) -> Result<Self, FieldError> {
        match value {
            Value::Object(node) => Ok(node),
            other => Err(FieldError::new("object", &other)),
        }
    }
}

impl<T: NodeType> FieldValue for Arc<T> {
    fn to_value(&self) -> Value {
        let node: NodeRef = self.clone();
        Value::Object(node)
    }

    fn from_value(value: Value) -> Result<Self, FieldError> {
        match value {
            Value::Object(node) => node.into_any().downcast::<T>().map_err(|_| FieldError {
                expected: T::SPECKLE_TYPE,
                found: "object of another type",
            }),
            other => Err(FieldError::new(T::SPECKLE_TYPE, &other)),
        }
    }
}

impl<T: FieldValue> FieldValue for Option<T> {
    fn to_value(&self) -> Value {
        match self {
            Some(inner) => inner.to_value(),
            None => Value::Null,
        }
    }

    fn from_value(value: Value) -> Result<Self, FieldError> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FieldValue> FieldValue for Vec<T> {
    fn to_value(&self) -> Value {
        Value::List(self.iter().map(FieldValue::to_value).collect())
    }

    fn from_value(value: Value) -> Result<Self, FieldError> {
        match value {
            Value::List(items) => items.into_iter().map(T::from_value).collect(),
            other => Err(FieldError::new("list", &other)),
        }
    }
}

impl FieldValue for IndexMap<String, Value> {
    fn to_value(&self) -> Value {
        Value::Map(self.clone())
    }

    fn from_value(value: Value) -> Result<Self, FieldError> {
        match value {
            Value::Map(map) => Ok(map),
            other => Err(FieldError::new("map", &other)),
        }
    }
}
