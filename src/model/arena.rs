//! Flat index over a reconstructed graph, used for the post-receive pass.

use std::collections::{HashMap, HashSet};

use super::node::{instance_key, NodeRef};
use super::value::Value;
use crate::types::ObjectId;

/// Position of a node inside a [`NodeArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaIndex(usize);

impl ArenaIndex {
    /// Position as a plain integer.
    pub fn get(self) -> usize {
        self.0
    }
}

/// Every node reachable from a root, addressed by index.
///
/// Parent links and named relations are stored here as indices instead of
/// being written into the (immutable) nodes themselves.
#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: Vec<NodeRef>,
    parents: Vec<Vec<ArenaIndex>>,
    children: Vec<Vec<ArenaIndex>>,
    by_instance: HashMap<usize, ArenaIndex>,
    by_id: HashMap<ObjectId, ArenaIndex>,
    by_application_id: HashMap<String, ArenaIndex>,
    relations: HashMap<(ArenaIndex, String), ArenaIndex>,
}

impl NodeArena {
    /// Indexes `root` and every node reachable through its property values.
    ///
    /// Nodes are numbered in discovery order; the root is always index 0.
    /// Shared instances are indexed once and collect one parent link per owner.
    pub fn build(root: &NodeRef) -> Self {
        let mut arena = NodeArena::default();
        let root_index = arena.push(root);
        let mut stack = vec![(root.clone(), root_index)];
        let mut expanded = HashSet::new();
        while let Some((node, index)) = stack.pop() {
            if !expanded.insert(index) {
                continue;
            }
            let mut found = Vec::new();
            for field in node.fields() {
                if let Some(value) = node.get_field(field.name) {
                    collect_nodes(&value, &mut found);
                }
            }
            for value in node.core().dynamic().values() {
                collect_nodes(value, &mut found);
            }
            let indexed: Vec<(NodeRef, ArenaIndex)> = found
                .into_iter()
                .map(|child| {
                    let child_index = arena.push(&child);
                    arena.link(index, child_index);
                    (child, child_index)
                })
                .collect();
            stack.extend(indexed.into_iter().rev());
        }
        arena
    }

    fn push(&mut self, node: &NodeRef) -> ArenaIndex {
        let key = instance_key(node);
        if let Some(existing) = self.by_instance.get(&key) {
            return *existing;
        }
        let index = ArenaIndex(self.nodes.len());
        self.nodes.push(node.clone());
        self.parents.push(Vec::new());
        self.children.push(Vec::new());
        self.by_instance.insert(key, index);
        if let Some(id) = node.core().id() {
            self.by_id.entry(id.clone()).or_insert(index);
        }
        if let Some(app_id) = node.core().application_id() {
            self.by_application_id
                .entry(app_id.to_string())
                .or_insert(index);
        }
        index
    }

    fn link(&mut self, parent: ArenaIndex, child: ArenaIndex) {
        if !self.children[parent.0].contains(&child) {
            self.children[parent.0].push(child);
            self.parents[child.0].push(parent);
        }
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the arena holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The node the arena was built from.
    pub fn root(&self) -> Option<&NodeRef> {
        self.nodes.first()
    }

    /// Node at `index`.
    pub fn get(&self, index: ArenaIndex) -> Option<&NodeRef> {
        self.nodes.get(index.0)
    }

    /// Index of `node`, by instance.
    pub fn index_of(&self, node: &NodeRef) -> Option<ArenaIndex> {
        self.by_instance.get(&instance_key(node)).copied()
    }

    /// Index of the node with content id `id`.
    pub fn by_id(&self, id: &str) -> Option<ArenaIndex> {
        self.by_id.get(id).copied()
    }

    /// Index of the first node carrying `application_id`.
    pub fn by_application_id(&self, application_id: &str) -> Option<ArenaIndex> {
        self.by_application_id.get(application_id).copied()
    }

    /// Owners of the node, in discovery order.
    pub fn parents(&self, index: ArenaIndex) -> &[ArenaIndex] {
        self.parents.get(index.0).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Indices of the nodes `index` references directly.
    pub fn children(&self, index: ArenaIndex) -> &[ArenaIndex] {
        self.children.get(index.0).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Records a named back-reference, replacing an earlier one with the same name.
    pub fn relate(&mut self, from: ArenaIndex, name: impl Into<String>, to: ArenaIndex) {
        self.relations.insert((from, name.into()), to);
    }

    /// Target of the named relation set by a hook.
    pub fn related(&self, from: ArenaIndex, name: &str) -> Option<ArenaIndex> {
        self.relations.get(&(from, name.to_string())).copied()
    }

    /// Every index, in build order.
    pub fn indices(&self) -> impl Iterator<Item = ArenaIndex> {
        (0..self.nodes.len()).map(ArenaIndex)
    }

    /// Every node with its index, in build order.
    pub fn iter(&self) -> impl Iterator<Item = (ArenaIndex, &NodeRef)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (ArenaIndex(i), node))
    }
}

fn collect_nodes(value: &Value, out: &mut Vec<NodeRef>) {
    match value {
        Value::Object(node) => out.push(node.clone()),
        Value::List(items) => items.iter().for_each(|item| collect_nodes(item, out)),
        Value::Map(map) => map.values().for_each(|item| collect_nodes(item, out)),
        _ => {}
    }
}
