#![allow(missing_docs)]

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rusqlite::Connection;
use sombra_transport::admin::{
    open_cache, stats, verify, AdminError, AdminOpenOptions, VerifyLevel,
};
use sombra_transport::cache::{CacheError, CacheOptions, CacheScan, LocalCache, SqliteCache};
use sombra_transport::model::nodes_equal;
use sombra_transport::pipeline::{ReceivePipeline, SendPipeline};
use sombra_transport::{content_hash, ObjectId};
use tokio_util::sync::CancellationToken;

fn record(n: usize) -> (ObjectId, String) {
    let json = format!(r#"{{"n":{n},"speckle_type":"Tests.Row"}}"#);
    (content_hash(json.as_bytes()), json)
}

#[tokio::test]
async fn graph_survives_reopen() {
    let (dir, path, cache) = common::temp_cache("reopen");
    let (root, _) = common::shared_leaf_graph(6);
    let sender = SendPipeline::local(cache.clone(), common::small_options()).expect("pipeline");
    let report = sender
        .send(&root, CancellationToken::new())
        .await
        .expect("send");
    drop(sender);
    drop(cache);

    let reopened = Arc::new(common::open_sqlite(&path));
    assert_eq!(reopened.len().expect("len"), report.cache_written);
    let receiver = ReceivePipeline::local(
        reopened,
        Arc::new(common::registry()),
        common::small_options(),
    )
    .expect("pipeline");
    let received = receiver
        .receive(&report.root_id, CancellationToken::new())
        .await
        .expect("receive");
    assert!(nodes_equal(root.as_ref(), received.root.as_ref()));
    drop(dir);
}

#[test]
fn scan_returns_every_record_in_id_order() {
    let (_dir, _path, cache) = common::temp_cache("scan");
    let mut items: Vec<(ObjectId, String)> = (0..1200).map(record).collect();
    assert_eq!(cache.put_batch(&items).expect("batch"), 1200);
    items.sort();

    let scanned: Vec<(ObjectId, String)> = cache
        .enumerate()
        .collect::<Result<_, _>>()
        .expect("scan");
    assert_eq!(scanned, items);

    let paged: Vec<ObjectId> = CacheScan::with_page_size(cache.as_ref(), 7)
        .map(|entry| entry.expect("entry").0)
        .collect();
    assert_eq!(paged.len(), 1200);
    assert!(paged.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn has_many_spans_lookup_chunks() {
    let (_dir, _path, cache) = common::temp_cache("lookup");
    let items: Vec<(ObjectId, String)> = (0..1500).map(record).collect();
    cache.put_batch(&items).expect("batch");

    let mut lookup: Vec<ObjectId> = items.iter().map(|(id, _)| id.clone()).collect();
    lookup.push(content_hash(b"absent"));
    let present = cache.has_many(&lookup).expect("has_many");
    assert_eq!(present.len(), 1500);
    assert!(!present.contains(&content_hash(b"absent")));
}

#[test]
fn readers_proceed_while_writer_commits() {
    let (_dir, _path, cache) = common::temp_cache("concurrent");
    let seed: Vec<(ObjectId, String)> = (0..100).map(record).collect();
    cache.put_batch(&seed).expect("seed");

    let writer = {
        let cache = cache.clone();
        thread::spawn(move || {
            for start in (100..1100).step_by(100) {
                let batch: Vec<(ObjectId, String)> = (start..start + 100).map(record).collect();
                cache.put_batch(&batch).expect("write batch");
            }
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let cache = cache.clone();
            let ids: Vec<ObjectId> = seed.iter().map(|(id, _)| id.clone()).collect();
            thread::spawn(move || {
                for _ in 0..20 {
                    assert_eq!(cache.has_many(&ids).expect("read").len(), ids.len());
                }
            })
        })
        .collect();

    writer.join().expect("writer");
    for reader in readers {
        reader.join().expect("reader");
    }
    assert_eq!(cache.len().expect("len"), 1100);
}

#[test]
fn locked_database_reports_busy() {
    let (_dir, path, _) = common::temp_cache("busy");
    let cache = SqliteCache::open(
        &path,
        CacheOptions::default().busy_timeout(Duration::from_millis(50)),
    )
    .expect("open");

    let holder = Connection::open(&path).expect("raw connection");
    holder.execute_batch("BEGIN IMMEDIATE").expect("take write lock");

    let (id, json) = record(1);
    let err = cache.put(&id, &json).expect_err("locked");
    assert!(err.is_busy(), "unexpected error: {err}");
    assert!(matches!(err, CacheError::Busy { waited } if waited == Duration::from_millis(50)));

    holder.execute_batch("ROLLBACK").expect("release lock");
    cache.put(&id, &json).expect("put after release");
    assert!(cache.has(&id).expect("has"));
}

#[test]
fn failed_batch_leaves_earlier_batches() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let path = dir.path().join("rollback.db");
    let cache = SqliteCache::open(
        &path,
        CacheOptions::default().busy_timeout(Duration::from_millis(20)),
    )
    .expect("open");
    let first: Vec<(ObjectId, String)> = (0..10).map(record).collect();
    cache.put_batch(&first).expect("first batch");

    let holder = Connection::open(&path).expect("raw connection");
    holder.execute_batch("BEGIN IMMEDIATE").expect("take write lock");
    let second: Vec<(ObjectId, String)> = (10..20).map(record).collect();
    let err = cache.put_batch(&second).expect_err("locked batch");
    assert!(err.is_busy(), "unexpected error: {err}");
    holder.execute_batch("ROLLBACK").expect("release lock");

    assert_eq!(cache.len().expect("len"), 10);
    let ids: Vec<ObjectId> = second.into_iter().map(|(id, _)| id).collect();
    assert!(cache.has_many(&ids).expect("has_many").is_empty());
}

#[test]
fn admin_reports_cover_the_file() {
    let (_dir, path, cache) = common::temp_cache("admin");
    let id = common::seed(cache.as_ref(), &common::scenario());
    drop(cache);

    let report = stats(&path, &AdminOpenOptions::default()).expect("stats");
    assert_eq!(report.cache.records, 2);
    assert_eq!(report.cache.types.get("A"), Some(&1));
    assert_eq!(report.cache.types.get("B"), Some(&1));
    assert!(report.filesystem.db_size_bytes > 0);

    let verified = verify(&path, &AdminOpenOptions::default(), VerifyLevel::Full).expect("verify");
    assert!(verified.success);
    assert_eq!(verified.counts.records_scanned, 2);
    assert_eq!(verified.counts.closure_ids, 1);
    assert_eq!(verified.counts.missing_closure_ids, 0);

    let cache = open_cache(&path, &AdminOpenOptions::default()).expect("open");
    assert!(cache.get(&id).expect("get").is_some());
}

#[test]
fn admin_refuses_missing_files() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let path = dir.path().join("absent.db");
    let err = stats(&path, &AdminOpenOptions::default()).expect_err("missing");
    assert!(matches!(err, AdminError::MissingCache(ref missing) if *missing == path));
    assert!(!path.exists());

    let created = open_cache(&path, &AdminOpenOptions::default().create_if_missing(true))
        .expect("create");
    assert!(created.is_empty().expect("empty"));
}
