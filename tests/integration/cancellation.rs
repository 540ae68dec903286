#![allow(missing_docs)]

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use sombra_transport::admin::{verify_cache, VerifyLevel};
use sombra_transport::cache::{LocalCache, MemoryCache};
use sombra_transport::pipeline::{ReceivePipeline, RunState, SendPipeline};
use sombra_transport::remote::MemoryRemote;
use sombra_transport::TransportError;
use tokio_util::sync::CancellationToken;

fn cancel_after(delay: Duration) -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        trigger.cancel();
    });
    cancel
}

fn assert_cache_valid(cache: &dyn LocalCache) {
    let report = verify_cache(cache, VerifyLevel::Fast).expect("verify");
    assert!(report.success, "findings: {:?}", report.findings);
    assert_eq!(report.counts.hash_mismatches, 0);
    assert_eq!(report.counts.malformed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_send_stops_promptly_with_valid_cache() {
    let (root, _) = common::shared_leaf_graph(40);
    let total = common::records_of(&root).len() as u64;
    let cache = Arc::new(MemoryCache::new());
    let remote = Arc::new(MemoryRemote::new().with_latency(Duration::from_millis(100)));
    let pipeline = SendPipeline::new(cache.clone(), remote.clone(), common::small_options())
        .expect("pipeline");

    let started = Instant::now();
    let err = pipeline
        .send(&root, cancel_after(Duration::from_millis(150)))
        .await
        .expect_err("cancelled send");

    assert!(err.is_cancelled(), "unexpected error: {err}");
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(pipeline.state(), RunState::Canceled);
    assert!(cache.len().expect("len") < total);
    assert_cache_valid(cache.as_ref());
}

#[tokio::test]
async fn pre_cancelled_send_writes_nothing() {
    let cache = Arc::new(MemoryCache::new());
    let pipeline = SendPipeline::local(cache.clone(), common::small_options()).expect("pipeline");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = pipeline
        .send(&common::scenario(), cancel)
        .await
        .expect_err("cancelled");
    assert!(err.is_cancelled());
    assert_eq!(cache.writes(), 0);
    assert_eq!(pipeline.state(), RunState::Canceled);
}

#[tokio::test]
async fn pipeline_runs_again_after_cancellation() {
    let cache = Arc::new(MemoryCache::new());
    let pipeline = SendPipeline::local(cache.clone(), common::small_options()).expect("pipeline");
    let cancel = CancellationToken::new();
    cancel.cancel();
    let _ = pipeline.send(&common::scenario(), cancel).await;

    let report = pipeline
        .send(&common::scenario(), CancellationToken::new())
        .await
        .expect("second run");
    assert_eq!(report.cache_written, 2);
    assert_eq!(pipeline.state(), RunState::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_receive_leaves_only_whole_records() {
    let (root, _) = common::shared_leaf_graph(30);
    let remote = Arc::new(MemoryRemote::new().with_latency(Duration::from_millis(100)));
    for record in common::records_of(&root) {
        remote.insert(record.id, record.json);
    }
    let cache = Arc::new(MemoryCache::new());
    let receiver = ReceivePipeline::new(
        cache.clone(),
        remote,
        Arc::new(common::registry()),
        common::small_options(),
    )
    .expect("pipeline");

    let err = receiver
        .receive(
            &common::root_id(&root),
            cancel_after(Duration::from_millis(250)),
        )
        .await
        .expect_err("cancelled receive");

    assert!(err.is_cancelled(), "unexpected error: {err}");
    assert_eq!(receiver.state(), RunState::Canceled);
    assert_cache_valid(cache.as_ref());
}

#[tokio::test]
async fn failing_remote_is_a_storage_error() {
    let remote = Arc::new(MemoryRemote::new());
    remote.set_failing(true);
    let pipeline = SendPipeline::new(
        Arc::new(MemoryCache::new()),
        remote,
        common::small_options(),
    )
    .expect("pipeline");

    let err = pipeline
        .send(&common::scenario(), CancellationToken::new())
        .await
        .expect_err("remote failure");
    assert!(!err.is_cancelled());
    assert!(
        matches!(err, TransportError::Storage { ref context, .. } if context.starts_with("upload batch")),
        "unexpected error: {err}"
    );
    assert_eq!(pipeline.state(), RunState::Failed);
}

#[tokio::test]
async fn failing_cache_is_a_storage_error() {
    let cache = Arc::new(MemoryCache::new());
    cache.set_failing(true);
    let pipeline = SendPipeline::local(cache.clone(), common::small_options()).expect("pipeline");

    let err = pipeline
        .send(&common::scenario(), CancellationToken::new())
        .await
        .expect_err("cache failure");
    assert!(
        matches!(err, TransportError::Storage { ref context, .. } if context.starts_with("cache write")),
        "unexpected error: {err}"
    );
    assert_eq!(pipeline.state(), RunState::Failed);
    assert_eq!(cache.len().expect("len"), 0);
}
