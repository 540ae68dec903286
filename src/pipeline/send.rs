use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::options::PipelineOptions;
use super::pool::WorkerPool;
use super::progress::{ProgressEvent, ProgressReporter, ProgressStage};
use super::state::{RunGuard, RunState, RunStateCell};
use super::{cache_call, settle, until_cancelled};
use crate::cache::LocalCache;
use crate::error::{Result, TransportError};
use crate::model::{instance_key, NodeRef};
use crate::remote::{RemoteObjectManager, UploadBatcher};
use crate::serialization::{
    detachable_children, ObjectSerializer, Record, SerializeError, SerializedCache,
};
use crate::types::ObjectId;

/// Summary of a finished send run.
#[derive(Debug, Clone, Serialize)]
pub struct SendReport {
    /// Id of the root record.
    pub root_id: ObjectId,
    /// Records produced by the serializer, duplicates included.
    pub records: u64,
    /// Records dropped because an identical id was already in flight.
    pub duplicates: u64,
    /// Records the local cache already held.
    pub cache_hits: u64,
    /// Records the remote already held.
    pub remote_hits: u64,
    /// Records accepted by the remote.
    pub uploaded_objects: u64,
    /// Upload requests made.
    pub upload_batches: u64,
    /// Bytes sent to the remote, after compression.
    pub uploaded_bytes: u64,
    /// Records newly written to the local cache.
    pub cache_written: u64,
    /// Wall time of the run.
    pub elapsed_ms: u64,
}

#[derive(Debug, Default)]
struct SendCounters {
    records: AtomicU64,
    duplicates: AtomicU64,
    cache_hits: AtomicU64,
    remote_hits: AtomicU64,
    uploaded_objects: AtomicU64,
    upload_batches: AtomicU64,
    uploaded_bytes: AtomicU64,
    cache_written: AtomicU64,
}

impl SendCounters {
    fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    fn report(&self, root_id: ObjectId, started: Instant) -> SendReport {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        SendReport {
            root_id,
            records: load(&self.records),
            duplicates: load(&self.duplicates),
            cache_hits: load(&self.cache_hits),
            remote_hits: load(&self.remote_hits),
            uploaded_objects: load(&self.uploaded_objects),
            upload_batches: load(&self.upload_batches),
            uploaded_bytes: load(&self.uploaded_bytes),
            cache_written: load(&self.cache_written),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Everything a stage task needs besides its queues.
#[derive(Clone)]
struct StageContext {
    stop: CancellationToken,
    cache: Arc<dyn LocalCache>,
    progress: Arc<dyn ProgressReporter>,
    counters: Arc<SendCounters>,
    options: PipelineOptions,
}

impl StageContext {
    fn progress(&self, stage: ProgressStage, count: u64) {
        if count > 0 {
            self.progress.report(ProgressEvent::new(stage, count));
        }
    }

    async fn forward(&self, tx: &mpsc::Sender<Record>, record: Record) -> Result<()> {
        // A closed queue means the next stage stopped and fired the token.
        until_cancelled(&self.stop, tx.send(record))
            .await?
            .map_err(|_| TransportError::Cancelled)
    }
}

/// Moves a node graph into the local cache and the remote store.
pub struct SendPipeline {
    cache: Arc<dyn LocalCache>,
    remote: Option<Arc<dyn RemoteObjectManager>>,
    options: PipelineOptions,
    pool: Arc<WorkerPool>,
    state: RunStateCell,
}

impl std::fmt::Debug for SendPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendPipeline")
            .field("options", &self.options)
            .field("has_remote", &self.remote.is_some())
            .field("state", &self.state.get())
            .finish()
    }
}

impl SendPipeline {
    /// A pipeline that uploads new records to `remote` as well as caching them.
    pub fn new(
        cache: Arc<dyn LocalCache>,
        remote: Arc<dyn RemoteObjectManager>,
        options: PipelineOptions,
    ) -> Result<Self> {
        Self::build(cache, Some(remote), options)
    }

    /// A pipeline that only writes to the local cache.
    pub fn local(cache: Arc<dyn LocalCache>, options: PipelineOptions) -> Result<Self> {
        Self::build(cache, None, options.skip_remote(true))
    }

    fn build(
        cache: Arc<dyn LocalCache>,
        remote: Option<Arc<dyn RemoteObjectManager>>,
        options: PipelineOptions,
    ) -> Result<Self> {
        let pool = Arc::new(WorkerPool::new(options.workers)?);
        Ok(Self {
            cache,
            remote,
            options,
            pool,
            state: RunStateCell::new(),
        })
    }

    /// State of the current or last run.
    pub fn state(&self) -> RunState {
        self.state.get()
    }

    /// Options the pipeline was built with.
    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Serializes `root` and stores every record it produces.
    ///
    /// Returns once the root record has passed every stage. Firing `cancel`
    /// stops all stages and yields [`TransportError::Cancelled`].
    pub async fn send(&self, root: &NodeRef, cancel: CancellationToken) -> Result<SendReport> {
        let run = self.state.begin("send", RunState::Traversing)?;
        let started = Instant::now();
        let result = self.run(root, &cancel, &run, started).await;
        match &result {
            Ok(report) => info!(
                root = %report.root_id,
                records = report.records,
                uploaded = report.uploaded_objects,
                cache_hits = report.cache_hits,
                elapsed_ms = report.elapsed_ms,
                "send completed"
            ),
            Err(err) if err.is_cancelled() => info!("send cancelled"),
            Err(err) => warn!(error = %err, "send failed"),
        }
        run.finish(&result);
        result
    }

    async fn run(
        &self,
        root: &NodeRef,
        cancel: &CancellationToken,
        run: &RunGuard<'_>,
        started: Instant,
    ) -> Result<SendReport> {
        let stop = cancel.child_token();
        let ctx = StageContext {
            stop: stop.clone(),
            cache: Arc::clone(&self.cache),
            progress: Arc::clone(&self.options.progress),
            counters: Arc::new(SendCounters::default()),
            options: self.options.clone(),
        };
        let capacity = self.options.queue_capacity.max(1);

        let (record_tx, record_rx) = mpsc::channel(capacity);
        let (filtered_tx, filtered_rx) = mpsc::channel(capacity);
        let filter = spawn_stage(&ctx, filter_stage(ctx.clone(), record_rx, filtered_tx));
        let mut downstream = Vec::new();
        match self.remote.as_ref().filter(|_| !self.options.skip_remote) {
            Some(remote) => {
                let (stored_tx, stored_rx) = mpsc::channel(capacity);
                downstream.push(spawn_stage(
                    &ctx,
                    upload_stage(ctx.clone(), Arc::clone(remote), filtered_rx, stored_tx),
                ));
                downstream.push(spawn_stage(&ctx, write_stage(ctx.clone(), stored_rx)));
            }
            None => downstream.push(spawn_stage(&ctx, write_stage(ctx.clone(), filtered_rx))),
        }

        let traversal = self.traverse(root, record_tx, &ctx).await;
        if traversal.is_err() {
            stop.cancel();
        }
        run.advance(RunState::DrainingCache);
        let mut outcomes = vec![join_stage(filter).await];
        run.advance(RunState::DrainingRemote);
        for stage in downstream {
            outcomes.push(join_stage(stage).await);
        }
        let (traversed, root_id) = match traversal {
            Ok(id) => (Ok(()), Some(id)),
            Err(err) => (Err(err), None),
        };
        outcomes.insert(0, traversed);
        settle(cancel, outcomes)?;
        let root_id =
            root_id.ok_or_else(|| TransportError::Internal("traversal produced no root".into()))?;

        let check = root_id.clone();
        let stored = cache_call(&self.cache, &stop, "root confirmation", move |cache| {
            cache.has(&check)
        })
        .await?;
        if !stored {
            return Err(TransportError::Internal(format!(
                "root record {root_id} never reached the cache"
            )));
        }
        Ok(ctx.counters.report(root_id, started))
    }

    /// Serializes the graph level by level, leaves first, and feeds the
    /// records to the cache filter. Returns the root id.
    async fn traverse(
        &self,
        root: &NodeRef,
        tx: mpsc::Sender<Record>,
        ctx: &StageContext,
    ) -> Result<ObjectId> {
        let planned = Arc::clone(root);
        let levels = self.pool.run(move || plan_levels(&planned)).await?;
        let total: usize = levels.iter().map(Vec::len).sum();
        debug!(nodes = total, levels = levels.len(), "traversal planned");

        let shared = Arc::new(SerializedCache::new());
        for level in levels {
            if ctx.stop.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            let cache = Arc::clone(&shared);
            let token = ctx.stop.clone();
            let serialized = self
                .pool
                .run(move || {
                    level
                        .par_iter()
                        .map(|planned| {
                            ObjectSerializer::new()
                                .with_shared_cache(&cache)
                                .with_cancellation(token.clone())
                                .assume_open(planned.back_edges.iter().copied())
                                .serialize_node(&planned.node)
                        })
                        .collect::<std::result::Result<Vec<_>, SerializeError>>()
                })
                .await??;
            ctx.progress.report(
                ProgressEvent::new(ProgressStage::Serialize, serialized.len() as u64)
                    .with_total(total as u64),
            );
            for node in serialized {
                for record in node.records {
                    SendCounters::add(&ctx.counters.records, 1);
                    ctx.forward(&tx, record).await?;
                }
            }
        }
        shared
            .get(root)
            .map(|entry| entry.id)
            .ok_or_else(|| TransportError::Internal("root was not serialized".into()))
    }
}

fn spawn_stage<F>(ctx: &StageContext, stage: F) -> JoinHandle<Result<()>>
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let stop = ctx.stop.clone();
    tokio::spawn(async move {
        let outcome = stage.await;
        if outcome.is_err() {
            stop.cancel();
        }
        outcome
    })
}

async fn join_stage(handle: JoinHandle<Result<()>>) -> Result<()> {
    handle
        .await
        .map_err(|err| TransportError::Internal(format!("stage task failed: {err}")))?
}

/// Drops ids already seen in this run and records the local cache holds.
async fn filter_stage(
    ctx: StageContext,
    mut rx: mpsc::Receiver<Record>,
    tx: mpsc::Sender<Record>,
) -> Result<()> {
    let chunk = ctx.options.cache_chunk.max(1);
    let mut seen = HashSet::new();
    let mut buffer = Vec::with_capacity(chunk);
    loop {
        let received = until_cancelled(&ctx.stop, rx.recv_many(&mut buffer, chunk)).await?;
        if received == 0 {
            break;
        }
        let fresh: Vec<Record> = buffer
            .drain(..)
            .filter(|record| seen.insert(record.id.clone()))
            .collect();
        SendCounters::add(&ctx.counters.duplicates, (received - fresh.len()) as u64);
        if fresh.is_empty() {
            continue;
        }

        let hits = if ctx.options.skip_cache_read {
            HashSet::new()
        } else {
            let ids: Vec<ObjectId> = fresh.iter().map(|record| record.id.clone()).collect();
            cache_call(&ctx.cache, &ctx.stop, "cache lookup", move |cache| {
                cache.has_many(&ids)
            })
            .await?
        };
        ctx.progress(ProgressStage::CacheCheck, fresh.len() as u64);
        SendCounters::add(&ctx.counters.cache_hits, hits.len() as u64);
        for record in fresh {
            if !hits.contains(&record.id) {
                ctx.forward(&tx, record).await?;
            }
        }
    }
    Ok(())
}

/// Batches records, uploads the ones the remote lacks and passes every
/// record on to the cache writer afterwards.
async fn upload_stage(
    ctx: StageContext,
    remote: Arc<dyn RemoteObjectManager>,
    mut rx: mpsc::Receiver<Record>,
    tx: mpsc::Sender<Record>,
) -> Result<()> {
    let mut batcher = UploadBatcher::new(
        ctx.options.upload_batch_items,
        ctx.options.upload_batch_bytes,
    );
    let mut buffer = Vec::new();
    loop {
        let received = until_cancelled(
            &ctx.stop,
            rx.recv_many(&mut buffer, ctx.options.upload_batch_items.max(1)),
        )
        .await?;
        if received == 0 {
            break;
        }
        for record in buffer.drain(..) {
            if let Some(batch) = batcher.push(record) {
                upload_batch(&ctx, remote.as_ref(), batch, &tx).await?;
            }
        }
    }
    if let Some(batch) = batcher.flush() {
        upload_batch(&ctx, remote.as_ref(), batch, &tx).await?;
    }
    Ok(())
}

async fn upload_batch(
    ctx: &StageContext,
    remote: &dyn RemoteObjectManager,
    batch: Vec<Record>,
    tx: &mpsc::Sender<Record>,
) -> Result<()> {
    let ids: Vec<ObjectId> = batch.iter().map(|record| record.id.clone()).collect();
    let context = match ids.first() {
        Some(first) => format!("upload batch of {} starting at {first}", ids.len()),
        None => return Ok(()),
    };
    let present: HashMap<ObjectId, bool> = until_cancelled(&ctx.stop, remote.has_objects(&ids))
        .await?
        .map_err(|err| TransportError::remote(context.clone(), err))?;
    let (known, missing): (Vec<Record>, Vec<Record>) = batch
        .into_iter()
        .partition(|record| present.get(&record.id).copied().unwrap_or(false));
    SendCounters::add(&ctx.counters.remote_hits, known.len() as u64);

    if !missing.is_empty() {
        until_cancelled(
            &ctx.stop,
            remote.upload_objects(&missing, ctx.options.compress),
        )
        .await?
        .map_err(|err| TransportError::remote(context, err))?;
        let bytes: u64 = missing.iter().map(|record| record.len() as u64).sum();
        SendCounters::add(&ctx.counters.upload_batches, 1);
        SendCounters::add(&ctx.counters.uploaded_objects, missing.len() as u64);
        SendCounters::add(&ctx.counters.uploaded_bytes, bytes);
        ctx.progress(ProgressStage::UploadBytes, bytes);
        debug!(
            uploaded = missing.len(),
            already_remote = known.len(),
            bytes,
            "upload batch sent"
        );
    }

    for record in missing.into_iter().chain(known) {
        ctx.forward(tx, record).await?;
    }
    Ok(())
}

/// Writes records to the local cache, one transaction per chunk.
async fn write_stage(ctx: StageContext, mut rx: mpsc::Receiver<Record>) -> Result<()> {
    let chunk = ctx.options.cache_chunk.max(1);
    let mut buffer = Vec::with_capacity(chunk);
    loop {
        let received = until_cancelled(&ctx.stop, rx.recv_many(&mut buffer, chunk)).await?;
        if received == 0 {
            break;
        }
        let items: Vec<(ObjectId, String)> = buffer
            .drain(..)
            .filter(|record| record.needs_storage)
            .map(|record| (record.id, record.json))
            .collect();
        if items.is_empty() {
            continue;
        }
        let count = items.len();
        let context = format!("cache write of {count} records starting at {}", items[0].0);
        let inserted = cache_call(&ctx.cache, &ctx.stop, &context, move |cache| {
            cache.put_batch(&items)
        })
        .await?;
        SendCounters::add(&ctx.counters.cache_written, inserted as u64);
        ctx.progress(ProgressStage::CacheWrite, count as u64);
    }
    Ok(())
}

/// A node scheduled for serialization, with the ancestors it points back at.
struct PlannedNode {
    node: NodeRef,
    /// Instance keys of the open ancestors this node references. A depth-first
    /// serializer writes those references as null.
    back_edges: Vec<usize>,
}

/// Groups the detached nodes under `root` by height: every node sits in a
/// later level than all of its detachable children, and `root` is alone in
/// the last level. The walk visits children in serializer order, so a
/// reference cycle is cut at the same edge a single depth-first serializer
/// would cut it.
fn plan_levels(root: &NodeRef) -> Vec<Vec<PlannedNode>> {
    struct Frame {
        node: NodeRef,
        children: Vec<NodeRef>,
        next: usize,
        height: usize,
        back_edges: Vec<usize>,
    }

    let frame = |node: &NodeRef| Frame {
        node: Arc::clone(node),
        children: detachable_children(node.as_ref()),
        next: 0,
        height: 0,
        back_edges: Vec::new(),
    };

    let mut heights: HashMap<usize, usize> = HashMap::new();
    let mut open: HashSet<usize> = HashSet::from([instance_key(root)]);
    let mut levels: Vec<Vec<PlannedNode>> = Vec::new();
    let mut stack = vec![frame(root)];

    while let Some(top) = stack.last_mut() {
        if top.next < top.children.len() {
            let child = Arc::clone(&top.children[top.next]);
            top.next += 1;
            let key = instance_key(&child);
            if let Some(height) = heights.get(&key) {
                top.height = top.height.max(height + 1);
            } else if open.insert(key) {
                stack.push(frame(&child));
            } else if key != instance_key(&top.node) && !top.back_edges.contains(&key) {
                top.back_edges.push(key);
            }
            continue;
        }
        let Some(done) = stack.pop() else { break };
        let key = instance_key(&done.node);
        open.remove(&key);
        heights.insert(key, done.height);
        if levels.len() <= done.height {
            levels.resize_with(done.height + 1, Vec::new);
        }
        if let Some(parent) = stack.last_mut() {
            parent.height = parent.height.max(done.height + 1);
        }
        levels[done.height].push(PlannedNode {
            node: done.node,
            back_edges: done.back_edges,
        });
    }
    levels
}
