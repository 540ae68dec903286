#![allow(missing_docs)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::Branch;
use parking_lot::Mutex;
use sombra_transport::cache::{LocalCache, MemoryCache};
use sombra_transport::model::{nodes_equal, Node, NodeRef};
use sombra_transport::pipeline::{
    ProgressEvent, ProgressReporter, ProgressStage, ReceivePipeline, RunState,
};
use sombra_transport::remote::MemoryRemote;
use sombra_transport::{content_hash, ObjectId, TransportError};
use tokio_util::sync::CancellationToken;

fn branch(node: &NodeRef) -> &Branch {
    node.as_any().downcast_ref::<Branch>().expect("branch")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_reference_is_reconstructed_once() {
    let fanout = 32;
    let (root, _) = common::shared_leaf_graph(fanout);
    let unique_records = common::records_of(&root).len() as u64;
    let cache = Arc::new(MemoryCache::new());
    let id = common::seed(cache.as_ref(), &root);

    let receiver = ReceivePipeline::local(
        cache,
        Arc::new(common::registry()),
        common::small_options().workers(4),
    )
    .expect("pipeline");
    let received = receiver
        .receive(&id, CancellationToken::new())
        .await
        .expect("receive");

    assert_eq!(received.report.deserialized, unique_records);
    let rebuilt = branch(&received.root);
    let shared = rebuilt.left.as_ref().expect("shared leaf");
    assert_eq!(rebuilt.items.len(), fanout);
    for item in &rebuilt.items {
        let left = branch(item).left.as_ref().expect("left");
        assert!(Arc::ptr_eq(left, shared));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_closure_id_is_downloaded_once() {
    let (root, _) = common::shared_leaf_graph(16);
    let remote = Arc::new(MemoryRemote::new());
    let records = common::records_of(&root);
    for record in &records {
        remote.insert(record.id.clone(), record.json.clone());
    }
    let root_id = records.last().map(|r| r.id.clone()).expect("root");

    let receiver = ReceivePipeline::new(
        Arc::new(MemoryCache::new()),
        remote.clone(),
        Arc::new(common::registry()),
        common::small_options(),
    )
    .expect("pipeline");
    let received = receiver
        .receive(&root_id, CancellationToken::new())
        .await
        .expect("receive");

    let stats = remote.stats();
    assert_eq!(received.report.closure_size, records.len() as u64 - 1);
    assert_eq!(stats.downloaded_objects, received.report.closure_size);
    assert_eq!(stats.single_downloads, 1);
    assert_eq!(
        stats.download_calls,
        received.report.closure_size.div_ceil(3)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn independent_pipelines_receive_concurrently() {
    let (root, _) = common::shared_leaf_graph(8);
    let cache = Arc::new(MemoryCache::new());
    let id = common::seed(cache.as_ref(), &root);
    let registry = Arc::new(common::registry());

    let runs = (0..8).map(|_| {
        let cache = cache.clone();
        let registry = registry.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let receiver = ReceivePipeline::local(cache, registry, common::small_options())
                .expect("pipeline");
            receiver.receive(&id, CancellationToken::new()).await
        })
    });
    let outcomes = futures::future::join_all(runs).await;

    let roots: Vec<NodeRef> = outcomes
        .into_iter()
        .map(|joined| joined.expect("join").expect("receive").root)
        .collect();
    for pair in roots.windows(2) {
        assert!(sombra_transport::model::nodes_equal(
            pair[0].as_ref(),
            pair[1].as_ref()
        ));
        assert!(!Arc::ptr_eq(&pair[0], &pair[1]));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overlapping_run_on_one_pipeline_is_busy() {
    let (root, _) = common::shared_leaf_graph(4);
    let remote = Arc::new(MemoryRemote::new().with_latency(Duration::from_millis(50)));
    for record in common::records_of(&root) {
        remote.insert(record.id, record.json);
    }
    let root_id = common::root_id(&root);

    let receiver = Arc::new(
        ReceivePipeline::new(
            Arc::new(MemoryCache::new()),
            remote,
            Arc::new(common::registry()),
            common::small_options(),
        )
        .expect("pipeline"),
    );
    let first = {
        let receiver = receiver.clone();
        let root_id = root_id.clone();
        tokio::spawn(async move { receiver.receive(&root_id, CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let second = receiver.receive(&root_id, CancellationToken::new()).await;
    assert!(matches!(second, Err(TransportError::Busy(_))));

    let received = first.await.expect("join").expect("first run");
    assert_eq!(received.root.speckle_type(), "Tests.Branch");
    assert_eq!(receiver.state(), RunState::Completed);

    // A finished run frees the pipeline for the next one.
    receiver
        .receive(&root_id, CancellationToken::new())
        .await
        .expect("follow-up run");
}

/// Stages in the order they reported.
#[derive(Default)]
struct StageLog(Mutex<Vec<ProgressStage>>);

impl ProgressReporter for StageLog {
    fn report(&self, event: ProgressEvent) {
        self.0.lock().push(event.stage);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconstruction_overlaps_the_download() {
    let (root, _) = common::shared_leaf_graph(12);
    let remote = Arc::new(MemoryRemote::new().with_latency(Duration::from_millis(20)));
    let records = common::records_of(&root);
    for record in &records {
        remote.insert(record.id.clone(), record.json.clone());
    }

    let log = Arc::new(StageLog::default());
    let receiver = ReceivePipeline::new(
        Arc::new(MemoryCache::new()),
        remote.clone(),
        Arc::new(common::registry()),
        common::small_options()
            .download_concurrency(1)
            .progress(log.clone()),
    )
    .expect("pipeline");
    let received = receiver
        .receive(&common::root_id(&root), CancellationToken::new())
        .await
        .expect("receive");

    assert!(nodes_equal(root.as_ref(), received.root.as_ref()));
    assert_eq!(received.report.deserialized, records.len() as u64);
    assert_eq!(
        remote.stats().download_calls,
        received.report.closure_size.div_ceil(3)
    );

    let stages = log.0.lock();
    let first_built = stages
        .iter()
        .position(|stage| *stage == ProgressStage::Deserialize)
        .expect("deserialize events");
    let last_download = stages
        .iter()
        .rposition(|stage| *stage == ProgressStage::DownloadBytes)
        .expect("download events");
    assert!(first_built < last_download);
}

fn forged(id: &ObjectId, children: &[&ObjectId]) -> String {
    let closure = children
        .iter()
        .map(|child| format!(r#""{child}":1"#))
        .collect::<Vec<_>>()
        .join(",");
    format!(r#"{{"value":1,"speckle_type":"Tests.Leaf","id":"{id}","__closure":{{{closure}}}}}"#)
}

/// `r` lists `a` and `b`; `a` and `b` list each other.
fn sibling_loop() -> (ObjectId, Vec<(ObjectId, String)>) {
    let r = content_hash(b"forged root");
    let a = content_hash(b"forged a");
    let b = content_hash(b"forged b");
    let records = vec![
        (r.clone(), forged(&r, &[&a, &b])),
        (a.clone(), forged(&a, &[&b])),
        (b.clone(), forged(&b, &[&a])),
    ];
    (r, records)
}

async fn assert_rejected(receiver: &ReceivePipeline, root: &ObjectId) {
    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        receiver.receive(root, CancellationToken::new()),
    )
    .await
    .expect("receive must not hang on a closure loop");
    assert!(
        matches!(outcome, Err(TransportError::Malformed { .. })),
        "unexpected outcome: {outcome:?}"
    );
    assert_eq!(receiver.state(), RunState::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn closure_loops_are_rejected() {
    let (root, records) = sibling_loop();

    let cache = Arc::new(MemoryCache::new());
    cache.put_batch(&records).expect("seed");
    let local = ReceivePipeline::local(cache, Arc::new(common::registry()), common::small_options())
        .expect("pipeline");
    assert_rejected(&local, &root).await;

    let remote = Arc::new(MemoryRemote::new().with_latency(Duration::from_millis(5)));
    for (id, json) in records {
        remote.insert(id, json);
    }
    let fetching = ReceivePipeline::new(
        Arc::new(MemoryCache::new()),
        remote,
        Arc::new(common::registry()),
        common::small_options(),
    )
    .expect("pipeline");
    assert_rejected(&fetching, &root).await;

    let self_loop = content_hash(b"forged self");
    let cache = Arc::new(MemoryCache::new());
    cache
        .put(&self_loop, &forged(&self_loop, &[&self_loop]))
        .expect("seed");
    let local = ReceivePipeline::local(cache, Arc::new(common::registry()), common::small_options())
        .expect("pipeline");
    assert_rejected(&local, &self_loop).await;
}
