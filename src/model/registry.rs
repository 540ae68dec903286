use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::arena::{ArenaIndex, NodeArena};
use super::builtin::{DataChunk, DynamicNode};
use super::node::{Node, NodeType};

/// Separator between the segments of an inheritance-chain type name.
pub const TYPE_CHAIN_SEPARATOR: char = ':';

type Factory = Arc<dyn Fn(&str) -> Box<dyn Node> + Send + Sync>;

/// Hook run over the reconstructed graph once every record is materialized.
pub type PostReceiveHook =
    Arc<dyn Fn(&mut NodeArena, ArenaIndex) -> Result<(), String> + Send + Sync>;

/// Maps type discriminators to constructors.
#[derive(Clone)]
pub struct TypeRegistry {
    factories: HashMap<String, Factory>,
    hooks: HashMap<String, Vec<PostReceiveHook>>,
    dynamic_fallback: bool,
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        f.debug_struct("TypeRegistry")
            .field("types", &types)
            .field("hooked_types", &self.hooks.len())
            .field("dynamic_fallback", &self.dynamic_fallback)
            .finish()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Registry holding only the builtin [`DataChunk`] type.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
            hooks: HashMap::new(),
            dynamic_fallback: false,
        };
        registry.register::<DataChunk>();
        registry
    }

    /// Builds unknown types as [`DynamicNode`] instead of failing.
    pub fn with_dynamic_fallback(mut self, enabled: bool) -> Self {
        self.dynamic_fallback = enabled;
        self
    }

    /// Registers `T` under its [`NodeType::SPECKLE_TYPE`].
    pub fn register<T: NodeType>(&mut self) -> &mut Self {
        let factory: Factory = Arc::new(|_: &str| -> Box<dyn Node> { Box::new(T::default()) });
        self.factories.insert(T::SPECKLE_TYPE.to_string(), factory);
        self
    }

    /// Registers a type name that is materialized as a [`DynamicNode`].
    pub fn register_dynamic(&mut self, speckle_type: impl Into<String>) -> &mut Self {
        let factory: Factory =
            Arc::new(|name: &str| -> Box<dyn Node> { Box::new(DynamicNode::new(name)) });
        self.factories.insert(speckle_type.into(), factory);
        self
    }

    /// Adds a post-receive hook for every node whose type is `speckle_type`.
    pub fn on_received<F>(&mut self, speckle_type: impl Into<String>, hook: F) -> &mut Self
    where
        F: Fn(&mut NodeArena, ArenaIndex) -> Result<(), String> + Send + Sync + 'static,
    {
        self.hooks
            .entry(speckle_type.into())
            .or_default()
            .push(Arc::new(hook));
        self
    }

    /// True when `speckle_type` has a factory.
    pub fn contains(&self, speckle_type: &str) -> bool {
        self.factories.contains_key(speckle_type)
    }

    /// Hooks registered for a type.
    pub fn hooks_for(&self, speckle_type: &str) -> &[PostReceiveHook] {
        self.hooks
            .get(speckle_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// True when any post-receive hook is registered.
    pub fn has_hooks(&self) -> bool {
        !self.hooks.is_empty()
    }

    /// Creates an empty instance for `speckle_type`.
    ///
    /// Tries the exact name first, then each segment of a `:` separated
    /// inheritance chain from the most to the least specific. Returns `None`
    /// when nothing matches and dynamic fallback is off.
    pub fn instantiate(&self, speckle_type: &str) -> Option<Box<dyn Node>> {
        if let Some(factory) = self.factories.get(speckle_type) {
            return Some(factory(speckle_type));
        }
        for segment in speckle_type.rsplit(TYPE_CHAIN_SEPARATOR) {
            if let Some(factory) = self.factories.get(segment) {
                debug!(
                    speckle_type,
                    resolved = segment,
                    "type resolved through inheritance chain"
                );
                return Some(factory(speckle_type));
            }
        }
        if self.dynamic_fallback {
            debug!(speckle_type, "materializing unregistered type dynamically");
            return Some(Box::new(DynamicNode::new(speckle_type)));
        }
        None
    }
}
