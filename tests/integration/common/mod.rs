#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sombra_transport::cache::{CacheOptions, LocalCache, SqliteCache};
use sombra_transport::graph_object;
use parking_lot::Mutex;
use sombra_transport::model::{
    FieldDescriptor, FieldError, Node, NodeCore, NodeRef, PropertyAttributes, TypeRegistry, Value,
};
use sombra_transport::pipeline::PipelineOptions;
use sombra_transport::serialization::{ObjectSerializer, Record};
use sombra_transport::ObjectId;
use tempfile::TempDir;

graph_object! {
    pub struct B as "B" {
        pub value: f64,
    }
}

graph_object! {
    pub struct A as "A" {
        pub name: String,
        pub child: Option<Arc<B>> => [detach],
    }
}

graph_object! {
    pub struct Leaf as "Tests.Leaf" {
        pub value: i64,
        pub label: Option<String> => [ignore_null],
    }
}

graph_object! {
    pub struct Branch as "Tests.Branch" {
        pub name: String,
        pub left: Option<NodeRef> => [detach],
        pub right: Option<NodeRef> => [detach],
        pub items: Vec<NodeRef> => [detach],
        pub samples: Vec<f64> => [chunked(4)],
    }
}

/// Node whose detached links can be rewired after construction, so tests can
/// build reference cycles.
#[derive(Debug, Default)]
pub struct Linked {
    pub core: NodeCore,
    pub label: String,
    pub links: Mutex<Vec<NodeRef>>,
}

const LINKED_FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("label", PropertyAttributes::INLINE),
    FieldDescriptor::new("links", PropertyAttributes::INLINE.detach()),
];

impl Linked {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            ..Default::default()
        })
    }

    pub fn link(&self, target: &Arc<Linked>) {
        let target: NodeRef = target.clone();
        self.links.lock().push(target);
    }

    /// Drops every link so a cyclic graph can be freed.
    pub fn unlink(&self) {
        self.links.lock().clear();
    }
}

impl Node for Linked {
    fn speckle_type(&self) -> &str {
        "Tests.Linked"
    }

    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    fn fields(&self) -> &'static [FieldDescriptor] {
        LINKED_FIELDS
    }

    fn get_field(&self, name: &str) -> Option<Value> {
        match name {
            "label" => Some(Value::from(self.label.as_str())),
            "links" => Some(Value::List(
                self.links.lock().iter().cloned().map(Value::Object).collect(),
            )),
            _ => None,
        }
    }

    fn set_field(&mut self, _: &str, _: Value) -> Result<bool, FieldError> {
        Ok(false)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

pub fn registry() -> TypeRegistry {
    let mut registry = TypeRegistry::new();
    registry
        .register::<A>()
        .register::<B>()
        .register::<Leaf>()
        .register::<Branch>();
    registry
}

/// The two-record scenario: `A { name: "root", child: B { value: 2.0 } }`.
pub fn scenario() -> NodeRef {
    Arc::new(A {
        name: "root".into(),
        child: Some(Arc::new(B {
            value: 2.0,
            ..Default::default()
        })),
        ..Default::default()
    })
}

pub fn leaf(value: i64) -> NodeRef {
    Arc::new(Leaf {
        value,
        ..Default::default()
    })
}

/// A tree of `fanout` branches that all share one leaf, plus chunked samples.
pub fn shared_leaf_graph(fanout: usize) -> (NodeRef, NodeRef) {
    let shared = leaf(42);
    let items = (0..fanout)
        .map(|i| -> NodeRef {
            Arc::new(Branch {
                name: format!("branch-{i}"),
                left: Some(Arc::clone(&shared)),
                right: Some(leaf(i as i64)),
                ..Default::default()
            })
        })
        .collect();
    let root: NodeRef = Arc::new(Branch {
        name: "root".into(),
        left: Some(Arc::clone(&shared)),
        items,
        samples: (0..10).map(f64::from).collect(),
        ..Default::default()
    });
    (root, shared)
}

/// Small pools and batches so a handful of records crosses several batches.
pub fn small_options() -> PipelineOptions {
    PipelineOptions::new()
        .workers(2)
        .queue_capacity(4)
        .cache_chunk(3)
        .upload_batch(2, 64 * 1024)
        .download_batch(3)
}

pub fn records_of(root: &NodeRef) -> Vec<Record> {
    ObjectSerializer::new()
        .serialize(root)
        .expect("serialize graph")
}

pub fn root_id(root: &NodeRef) -> ObjectId {
    records_of(root)
        .last()
        .map(|record| record.id.clone())
        .expect("root record")
}

pub fn temp_cache(name: &str) -> (TempDir, PathBuf, Arc<SqliteCache>) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join(format!("{name}.db"));
    let cache = Arc::new(open_sqlite(&path));
    (dir, path, cache)
}

pub fn open_sqlite(path: &Path) -> SqliteCache {
    SqliteCache::open(path, CacheOptions::default()).expect("open sqlite cache")
}

/// Writes every record of `root` into `cache` and returns the root id.
pub fn seed(cache: &dyn LocalCache, root: &NodeRef) -> ObjectId {
    let records = records_of(root);
    let items: Vec<(ObjectId, String)> = records
        .iter()
        .map(|record| (record.id.clone(), record.json.clone()))
        .collect();
    cache.put_batch(&items).expect("seed cache");
    records
        .last()
        .map(|record| record.id.clone())
        .expect("root record")
}
