#![allow(missing_docs)]

mod common;

use std::sync::Arc;

use common::Branch;
use sombra_transport::cache::{LocalCache, MemoryCache};
use sombra_transport::model::NodeRef;
use sombra_transport::pipeline::{SendPipeline, SendReport};
use sombra_transport::remote::MemoryRemote;
use tokio_util::sync::CancellationToken;

async fn send(pipeline: &SendPipeline, root: &NodeRef) -> SendReport {
    pipeline
        .send(root, CancellationToken::new())
        .await
        .expect("send")
}

#[tokio::test]
async fn second_send_writes_and_uploads_nothing() {
    let (root, _) = common::shared_leaf_graph(6);
    let cache = Arc::new(MemoryCache::new());
    let remote = Arc::new(MemoryRemote::new());
    let pipeline = SendPipeline::new(cache.clone(), remote.clone(), common::small_options())
        .expect("pipeline");

    let first = send(&pipeline, &root).await;
    let writes = cache.writes();
    let remote_stats = remote.stats();
    assert_eq!(writes, first.cache_written);
    assert_eq!(remote_stats.uploaded_objects, first.uploaded_objects);

    let second = send(&pipeline, &root).await;
    assert_eq!(second.root_id, first.root_id);
    assert_eq!(second.cache_written, 0);
    assert_eq!(second.uploaded_objects, 0);
    assert_eq!(second.cache_hits, second.records - second.duplicates);
    assert_eq!(cache.writes(), writes);
    assert_eq!(remote.stats().upload_calls, remote_stats.upload_calls);
}

#[tokio::test]
async fn equal_graphs_built_separately_share_ids() {
    let cache = Arc::new(MemoryCache::new());
    let pipeline = SendPipeline::local(cache.clone(), common::small_options()).expect("pipeline");

    let (first_root, _) = common::shared_leaf_graph(4);
    let first = send(&pipeline, &first_root).await;
    let (second_root, _) = common::shared_leaf_graph(4);
    let second = send(&pipeline, &second_root).await;

    assert_eq!(first.root_id, second.root_id);
    assert_eq!(second.cache_written, 0);
    assert_eq!(cache.len().expect("len"), first.cache_written);
}

#[tokio::test]
async fn identical_content_is_stored_once() {
    let twins: NodeRef = Arc::new(Branch {
        name: "twins".into(),
        left: Some(common::leaf(7)),
        right: Some(common::leaf(7)),
        items: vec![common::leaf(7), common::leaf(8)],
        ..Default::default()
    });
    let cache = Arc::new(MemoryCache::new());
    let pipeline = SendPipeline::local(cache.clone(), common::small_options()).expect("pipeline");

    let report = send(&pipeline, &twins).await;
    // Four distinct leaf instances, two distinct contents, plus the root.
    assert_eq!(report.records, 5);
    assert_eq!(report.duplicates, 2);
    assert_eq!(report.cache_written, 3);
    assert_eq!(cache.writes(), 3);
}

#[tokio::test]
async fn records_already_remote_are_not_uploaded() {
    let (root, _) = common::shared_leaf_graph(5);
    let remote = Arc::new(MemoryRemote::new());
    for record in common::records_of(&root) {
        remote.insert(record.id, record.json);
    }
    let before = remote.stats();

    let cache = Arc::new(MemoryCache::new());
    let pipeline = SendPipeline::new(cache.clone(), remote.clone(), common::small_options())
        .expect("pipeline");
    let report = send(&pipeline, &root).await;

    assert_eq!(report.uploaded_objects, 0);
    assert_eq!(report.upload_batches, 0);
    assert_eq!(report.remote_hits, report.records - report.duplicates);
    assert_eq!(remote.stats().upload_calls, before.upload_calls);
    // The cache still receives every record.
    assert_eq!(cache.writes(), report.remote_hits);
}

#[tokio::test]
async fn skip_cache_read_still_leaves_store_unchanged() {
    let (root, _) = common::shared_leaf_graph(3);
    let cache = Arc::new(MemoryCache::new());
    let remote = Arc::new(MemoryRemote::new());
    let pipeline = SendPipeline::new(
        cache.clone(),
        remote.clone(),
        common::small_options().skip_cache_read(true),
    )
    .expect("pipeline");

    let first = send(&pipeline, &root).await;
    let second = send(&pipeline, &root).await;

    assert_eq!(second.root_id, first.root_id);
    assert_eq!(second.cache_hits, 0);
    assert_eq!(second.uploaded_objects, 0);
    assert_eq!(second.remote_hits, first.uploaded_objects);
    assert_eq!(second.cache_written, 0);
    assert_eq!(cache.writes(), first.cache_written);
}
