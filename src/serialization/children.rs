use std::collections::HashSet;

use super::gather::gather;
use crate::model::{instance_key, Node, NodeRef, Value};

/// Nodes reachable from the detachable properties of `node`.
///
/// Walks through lists and maps but not into nested nodes, so only the
/// children that become their own record under this node are returned.
/// Chunked properties are skipped; their chunk records are made up by the
/// serializer. Each instance appears once, in gather order.
pub fn detachable_children(node: &dyn Node) -> Vec<NodeRef> {
    let mut seen = HashSet::new();
    let mut children = Vec::new();
    for property in gather(node) {
        let attributes = property.attributes;
        if !attributes.detachable || attributes.chunkable {
            continue;
        }
        collect(&property.value, &mut seen, &mut children);
    }
    children
}

fn collect(value: &Value, seen: &mut HashSet<usize>, out: &mut Vec<NodeRef>) {
    match value {
        Value::Object(node) => {
            if seen.insert(instance_key(node)) {
                out.push(node.clone());
            }
        }
        Value::List(items) => items.iter().for_each(|item| collect(item, seen, out)),
        Value::Map(map) => map.values().for_each(|item| collect(item, seen, out)),
        _ => {}
    }
}
