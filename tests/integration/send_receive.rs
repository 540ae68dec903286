#![allow(missing_docs)]

mod common;

use std::sync::Arc;

use common::{Branch, Leaf, Linked, A};
use sombra_transport::cache::{LocalCache, MemoryCache};
use sombra_transport::model::{nodes_equal, Node, NodeRef};
use sombra_transport::pipeline::{
    CounterProgress, PipelineOptions, ProgressStage, ReceivePipeline, RunState, SendPipeline,
};
use sombra_transport::remote::{MemoryRemote, RemoteObjectManager};
use sombra_transport::serialization::DeserializeOptions;
use sombra_transport::{content_hash, TransportError};
use tokio_util::sync::CancellationToken;

fn downcast<T: 'static>(node: &NodeRef) -> &T {
    node.as_any().downcast_ref::<T>().expect("node type")
}

#[test]
fn scenario_produces_the_documented_records() {
    let records = common::records_of(&common::scenario());
    assert_eq!(records.len(), 2);

    let b_id = content_hash(br#"{"value":2.0,"speckle_type":"B"}"#);
    assert_eq!(records[0].id, b_id);
    assert_eq!(
        records[0].json,
        format!(r#"{{"value":2.0,"speckle_type":"B","id":"{b_id}"}}"#)
    );

    let a_canonical = format!(
        r#"{{"name":"root","child":{{"speckle_type":"reference","referencedId":"{b_id}"}},"speckle_type":"A"}}"#
    );
    let a_id = content_hash(a_canonical.as_bytes());
    assert_eq!(records[1].id, a_id);
    assert_eq!(
        records[1].json,
        format!(
            r#"{{"name":"root","child":{{"speckle_type":"reference","referencedId":"{b_id}"}},"speckle_type":"A","id":"{a_id}","__closure":{{"{b_id}":1}}}}"#
        )
    );
    assert_eq!(a_id.as_str().len(), 32);
}

#[tokio::test]
async fn scenario_travels_through_remote() {
    let remote = Arc::new(MemoryRemote::new());
    let sender_cache = Arc::new(MemoryCache::new());
    let sender = SendPipeline::new(sender_cache.clone(), remote.clone(), common::small_options())
        .expect("send pipeline");
    let report = sender
        .send(&common::scenario(), CancellationToken::new())
        .await
        .expect("send");
    assert_eq!(report.records, 2);
    assert_eq!(report.uploaded_objects, 2);
    assert_eq!(report.cache_written, 2);
    assert_eq!(remote.len(), 2);
    assert_eq!(sender.state(), RunState::Completed);

    let receiver_cache = Arc::new(MemoryCache::new());
    let receiver = ReceivePipeline::new(
        receiver_cache.clone(),
        remote.clone(),
        Arc::new(common::registry()),
        common::small_options(),
    )
    .expect("receive pipeline");
    let received = receiver
        .receive(&report.root_id, CancellationToken::new())
        .await
        .expect("receive");

    let a = downcast::<A>(&received.root);
    assert_eq!(a.name, "root");
    let child = a.child.as_ref().expect("child");
    assert_eq!(child.value, 2.0);
    assert_eq!(a.core.id(), Some(&report.root_id));
    assert_eq!(received.report.closure_size, 1);
    assert_eq!(received.report.downloaded_objects, 1);
    assert_eq!(received.report.deserialized, 2);
    assert_eq!(receiver_cache.len().expect("len"), 2);
    assert_eq!(remote.stats().single_downloads, 1);
    assert_eq!(receiver.state(), RunState::Completed);
}

#[tokio::test]
async fn shared_graph_round_trips_field_wise() {
    let (root, _) = common::shared_leaf_graph(12);
    let cache = Arc::new(MemoryCache::new());
    let sender = SendPipeline::local(cache.clone(), common::small_options()).expect("pipeline");
    let report = sender
        .send(&root, CancellationToken::new())
        .await
        .expect("send");
    assert_eq!(report.root_id, common::root_id(&root));
    assert_eq!(
        cache.len().expect("len"),
        common::records_of(&root).len() as u64
    );

    let receiver = ReceivePipeline::local(
        cache.clone(),
        Arc::new(common::registry()),
        common::small_options(),
    )
    .expect("pipeline");
    let received = receiver
        .receive(&report.root_id, CancellationToken::new())
        .await
        .expect("receive");

    assert!(nodes_equal(root.as_ref(), received.root.as_ref()));
    let branch = downcast::<Branch>(&received.root);
    assert_eq!(branch.items.len(), 12);
    assert_eq!(branch.samples, (0..10).map(f64::from).collect::<Vec<_>>());
    assert_eq!(received.report.downloaded_objects, 0);
}

/// Sends `root` through a cache-only pipeline and checks every record the
/// plain serializer produces landed in the cache unchanged.
async fn assert_pipeline_matches_serializer(root: &NodeRef) {
    let expected = common::records_of(root);
    let cache = Arc::new(MemoryCache::new());
    let sender = SendPipeline::local(cache.clone(), common::small_options().workers(4))
        .expect("pipeline");
    let report = sender
        .send(root, CancellationToken::new())
        .await
        .expect("send");

    assert_eq!(report.root_id, expected.last().expect("root record").id);
    assert_eq!(report.records, expected.len() as u64);
    assert_eq!(cache.len().expect("len"), expected.len() as u64);
    for record in &expected {
        assert_eq!(
            cache.get(&record.id).expect("get").as_deref(),
            Some(record.json.as_str())
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pipeline_ids_match_the_serializer() {
    let (root, _) = common::shared_leaf_graph(9);
    assert_pipeline_matches_serializer(&root).await;

    let long: NodeRef = Arc::new(Branch {
        name: "samples".into(),
        samples: (0..401).map(f64::from).collect(),
        left: Some(common::leaf(1)),
        ..Default::default()
    });
    // 101 distinct chunks, the leaf and the branch itself
    assert_eq!(common::records_of(&long).len(), 103);
    assert_pipeline_matches_serializer(&long).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pipeline_cuts_cycles_where_the_serializer_does() {
    let root = Linked::new("root");
    let a = Linked::new("a");
    let b = Linked::new("b");
    root.link(&a);
    root.link(&b);
    a.link(&b);
    b.link(&a);
    b.link(&b);

    let as_node: NodeRef = root.clone();
    assert_pipeline_matches_serializer(&as_node).await;

    a.unlink();
    b.unlink();
}

#[tokio::test]
async fn compressed_downloads_decode() {
    let (root, _) = common::shared_leaf_graph(5);
    let remote = Arc::new(MemoryRemote::new().with_compressed_downloads(true));
    let sender = SendPipeline::new(
        Arc::new(MemoryCache::new()),
        remote.clone(),
        common::small_options().compress(true),
    )
    .expect("pipeline");
    let sent = sender
        .send(&root, CancellationToken::new())
        .await
        .expect("send");

    let progress = Arc::new(CounterProgress::new());
    let receiver = ReceivePipeline::new(
        Arc::new(MemoryCache::new()),
        remote.clone(),
        Arc::new(common::registry()),
        common::small_options().progress(progress.clone()),
    )
    .expect("pipeline");
    let received = receiver
        .receive(&sent.root_id, CancellationToken::new())
        .await
        .expect("receive");

    assert!(nodes_equal(root.as_ref(), received.root.as_ref()));
    assert_eq!(
        received.report.downloaded_objects,
        received.report.closure_size
    );
    assert!(received.report.download_batches >= 2);
    assert!(progress.get(ProgressStage::DownloadBytes) > 0);
    assert_eq!(
        progress.get(ProgressStage::Deserialize),
        received.report.deserialized
    );
}

#[tokio::test]
async fn send_reports_progress_per_stage() {
    let (root, _) = common::shared_leaf_graph(4);
    let progress = Arc::new(CounterProgress::new());
    let remote = Arc::new(MemoryRemote::new());
    let sender = SendPipeline::new(
        Arc::new(MemoryCache::new()),
        remote.clone(),
        common::small_options().progress(progress.clone()),
    )
    .expect("pipeline");
    let report = sender
        .send(&root, CancellationToken::new())
        .await
        .expect("send");

    assert!(progress.get(ProgressStage::Serialize) > 0);
    assert!(progress.get(ProgressStage::CacheCheck) > 0);
    assert_eq!(progress.get(ProgressStage::CacheWrite), report.cache_written);
    assert_eq!(progress.get(ProgressStage::UploadBytes), report.uploaded_bytes);
    assert_eq!(remote.stats().uploaded_objects, report.uploaded_objects);
}

#[tokio::test]
async fn hooks_link_leaves_to_their_owner() {
    let (root, _) = common::shared_leaf_graph(3);
    let cache = Arc::new(MemoryCache::new());
    let id = common::seed(cache.as_ref(), &root);

    let mut registry = common::registry();
    registry.on_received("Tests.Leaf", |arena, index| {
        let owner = arena
            .parents(index)
            .first()
            .copied()
            .ok_or_else(|| "leaf without owner".to_string())?;
        arena.relate(index, "owner", owner);
        Ok(())
    });
    let receiver = ReceivePipeline::local(cache, Arc::new(registry), PipelineOptions::new())
        .expect("pipeline");
    let received = receiver
        .receive(&id, CancellationToken::new())
        .await
        .expect("receive");

    // One shared leaf plus one private leaf per branch.
    assert_eq!(received.report.hooks_run, 4);
    let leaves: Vec<_> = received
        .arena
        .iter()
        .filter(|(_, node)| node.as_any().is::<Leaf>())
        .map(|(index, _)| index)
        .collect();
    assert_eq!(leaves.len(), 4);
    for index in leaves {
        let owner = received.arena.related(index, "owner").expect("owner");
        let owner_node = received.arena.get(owner).expect("owner node");
        assert!(owner_node.as_any().is::<Branch>());
    }
}

#[tokio::test]
async fn failing_hook_fails_the_run() {
    let cache = Arc::new(MemoryCache::new());
    let id = common::seed(cache.as_ref(), &common::scenario());
    let mut registry = common::registry();
    registry.on_received("B", |_, _| Err("rejected".to_string()));
    let receiver =
        ReceivePipeline::local(cache, Arc::new(registry), PipelineOptions::new()).expect("pipeline");

    let err = receiver
        .receive(&id, CancellationToken::new())
        .await
        .expect_err("hook failure");
    assert!(matches!(err, TransportError::Hook { ref speckle_type, .. } if speckle_type == "B"));
    assert_eq!(receiver.state(), RunState::Failed);
}

#[tokio::test]
async fn missing_reference_is_a_partial_graph() {
    let records = common::records_of(&common::scenario());
    let cache = Arc::new(MemoryCache::new());
    let root = records.last().expect("root");
    cache.put(&root.id, &root.json).expect("put root");

    let strict = ReceivePipeline::local(
        cache.clone(),
        Arc::new(common::registry()),
        PipelineOptions::new(),
    )
    .expect("pipeline");
    let err = strict
        .receive(&root.id, CancellationToken::new())
        .await
        .expect_err("partial graph");
    assert!(matches!(err, TransportError::PartialGraph(ref id) if *id == records[0].id));

    let lenient = ReceivePipeline::local(
        cache,
        Arc::new(common::registry()),
        PipelineOptions::new().deserialize(DeserializeOptions::new().skip_invalid(true)),
    )
    .expect("pipeline");
    let received = lenient
        .receive(&root.id, CancellationToken::new())
        .await
        .expect("lenient receive");
    let a = downcast::<A>(&received.root);
    assert_eq!(a.name, "root");
    assert!(a.child.is_none());
}

#[tokio::test]
async fn unknown_root_is_reported_missing() {
    let remote = Arc::new(MemoryRemote::new());
    let receiver = ReceivePipeline::new(
        Arc::new(MemoryCache::new()),
        remote.clone(),
        Arc::new(common::registry()),
        PipelineOptions::new(),
    )
    .expect("pipeline");
    let absent = content_hash(b"nothing here");
    let err = receiver
        .receive(&absent, CancellationToken::new())
        .await
        .expect_err("missing root");
    assert!(matches!(err, TransportError::PartialGraph(ref id) if *id == absent));
    assert!(remote
        .download_single(&absent)
        .await
        .expect("download")
        .is_none());
}

#[tokio::test]
async fn unregistered_type_is_rejected_unless_dynamic() {
    let cache = Arc::new(MemoryCache::new());
    let id = common::seed(cache.as_ref(), &common::scenario());

    let mut narrow = sombra_transport::model::TypeRegistry::new();
    narrow.register::<A>();
    let receiver =
        ReceivePipeline::local(cache.clone(), Arc::new(narrow), PipelineOptions::new())
            .expect("pipeline");
    let err = receiver
        .receive(&id, CancellationToken::new())
        .await
        .expect_err("unknown type");
    assert!(matches!(err, TransportError::UnknownType(ref name) if name == "B"));

    let dynamic = sombra_transport::model::TypeRegistry::new().with_dynamic_fallback(true);
    let receiver = ReceivePipeline::local(cache, Arc::new(dynamic), PipelineOptions::new())
        .expect("pipeline");
    let received = receiver
        .receive(&id, CancellationToken::new())
        .await
        .expect("dynamic receive");
    assert_eq!(received.root.speckle_type(), "A");
    let child = received
        .root
        .core()
        .get("child")
        .cloned()
        .expect("child value");
    match child {
        sombra_transport::model::Value::Object(node) => {
            assert_eq!(node.speckle_type(), "B");
            assert_eq!(
                node.core().get("value").and_then(|v| v.as_f64()),
                Some(2.0)
            );
        }
        other => panic!("expected object, found {other:?}"),
    }
}
