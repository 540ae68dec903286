use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::future::{self, BoxFuture};
use futures::{stream, FutureExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::options::PipelineOptions;
use super::pool::WorkerPool;
use super::progress::{ProgressEvent, ProgressStage};
use super::state::{RunGuard, RunState, RunStateCell};
use super::{cache_call, until_cancelled};
use crate::cache::LocalCache;
use crate::error::{Result, TransportError};
use crate::model::{ArenaIndex, NodeArena, NodeRef, TypeRegistry};
use crate::remote::RemoteObjectManager;
use crate::serialization::{peek_closure, ObjectDeserializer};
use crate::types::ObjectId;

/// Summary of a finished receive run.
#[derive(Debug, Clone, Serialize)]
pub struct ReceiveReport {
    /// Id the run started from.
    pub root_id: ObjectId,
    /// Ids in the root's closure.
    pub closure_size: u64,
    /// Closure ids the local cache already held.
    pub cache_hits: u64,
    /// Records fetched from the remote.
    pub downloaded_objects: u64,
    /// Download requests made.
    pub download_batches: u64,
    /// Bytes fetched from the remote.
    pub downloaded_bytes: u64,
    /// Records turned into nodes; each id counts once.
    pub deserialized: u64,
    /// Post-receive hooks run over the arena.
    pub hooks_run: u64,
    /// Wall time of the run.
    pub elapsed_ms: u64,
}

/// A reconstructed graph.
#[derive(Debug)]
pub struct Received {
    /// The reconstructed root node.
    pub root: NodeRef,
    /// Every reconstructed node by index, id and application id.
    pub arena: NodeArena,
    /// Counters for the run.
    pub report: ReceiveReport,
}

/// Rebuilds node graphs from the local cache, fetching what is missing from
/// the remote first.
pub struct ReceivePipeline {
    cache: Arc<dyn LocalCache>,
    remote: Option<Arc<dyn RemoteObjectManager>>,
    registry: Arc<TypeRegistry>,
    options: PipelineOptions,
    pool: Arc<WorkerPool>,
    state: RunStateCell,
}

impl std::fmt::Debug for ReceivePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivePipeline")
            .field("options", &self.options)
            .field("has_remote", &self.remote.is_some())
            .field("state", &self.state.get())
            .finish()
    }
}

impl ReceivePipeline {
    /// A pipeline that downloads what the cache lacks from `remote`.
    pub fn new(
        cache: Arc<dyn LocalCache>,
        remote: Arc<dyn RemoteObjectManager>,
        registry: Arc<TypeRegistry>,
        options: PipelineOptions,
    ) -> Result<Self> {
        Self::build(cache, Some(remote), registry, options)
    }

    /// A pipeline that reads only from the local cache.
    pub fn local(
        cache: Arc<dyn LocalCache>,
        registry: Arc<TypeRegistry>,
        options: PipelineOptions,
    ) -> Result<Self> {
        Self::build(cache, None, registry, options)
    }

    fn build(
        cache: Arc<dyn LocalCache>,
        remote: Option<Arc<dyn RemoteObjectManager>>,
        registry: Arc<TypeRegistry>,
        options: PipelineOptions,
    ) -> Result<Self> {
        let pool = Arc::new(WorkerPool::new(options.workers)?);
        Ok(Self {
            cache,
            remote,
            registry,
            options,
            pool,
            state: RunStateCell::new(),
        })
    }

    /// State of the current or last run.
    pub fn state(&self) -> RunState {
        self.state.get()
    }

    fn remote(&self) -> Option<&Arc<dyn RemoteObjectManager>> {
        self.remote.as_ref().filter(|_| !self.options.skip_remote)
    }

    /// Reconstructs the graph rooted at `root_id`.
    pub async fn receive(&self, root_id: &ObjectId, cancel: CancellationToken) -> Result<Received> {
        let run = self.state.begin("receive", RunState::DrainingCache)?;
        let started = Instant::now();
        let result = self.run(root_id, &cancel, &run, started).await;
        match &result {
            Ok(received) => info!(
                root = %root_id,
                nodes = received.arena.len(),
                downloaded = received.report.downloaded_objects,
                elapsed_ms = received.report.elapsed_ms,
                "receive completed"
            ),
            Err(err) if err.is_cancelled() => info!(root = %root_id, "receive cancelled"),
            Err(err) => warn!(root = %root_id, error = %err, "receive failed"),
        }
        run.finish(&result);
        result
    }

    async fn run(
        &self,
        root_id: &ObjectId,
        cancel: &CancellationToken,
        run: &RunGuard<'_>,
        started: Instant,
    ) -> Result<Received> {
        let stop = cancel.child_token();
        let progress = &self.options.progress;

        let lookup = root_id.clone();
        let cached = cache_call(&self.cache, &stop, "root lookup", move |cache| {
            cache.get(&lookup)
        })
        .await?;
        let root_json = match cached {
            Some(json) => json,
            None => self.fetch_root(root_id, &stop).await?,
        };
        let closure = peek_closure(&root_json)
            .map_err(|err| TransportError::malformed(Some(root_id), err.to_string()))?;
        let ids: Vec<ObjectId> = closure.ids().cloned().collect();

        let mut missing = Vec::new();
        for chunk in ids.chunks(self.options.cache_chunk.max(1)) {
            let lookup = chunk.to_vec();
            let present = cache_call(&self.cache, &stop, "closure lookup", move |cache| {
                cache.has_many(&lookup)
            })
            .await?;
            missing.extend(chunk.iter().filter(|id| !present.contains(*id)).cloned());
        }
        progress.report(
            ProgressEvent::new(ProgressStage::CacheCheck, ids.len() as u64)
                .with_total(ids.len() as u64),
        );
        debug!(
            root = %root_id,
            closure = ids.len(),
            missing = missing.len(),
            "closure checked against cache"
        );

        run.advance(RunState::DrainingRemote);
        let remote = self.remote();
        let expected = match remote {
            Some(_) => missing.iter().cloned().collect(),
            None => {
                if !missing.is_empty() {
                    debug!(
                        missing = missing.len(),
                        "no remote configured; missing ids resolve as absent"
                    );
                }
                HashSet::new()
            }
        };
        let resolver = Arc::new(Resolver {
            slots: DashMap::new(),
            arrivals: Arrivals::new(expected),
            cache: Arc::clone(&self.cache),
            registry: Arc::clone(&self.registry),
            pool: Arc::clone(&self.pool),
            options: self.options.clone(),
            stop: stop.clone(),
            deserialized: AtomicU64::new(0),
        });
        resolver.arrivals.deliver(root_id.clone(), root_json);

        let transfer = async {
            let tally = match remote {
                Some(remote) if !missing.is_empty() => {
                    self.download(remote.as_ref(), &missing, &resolver.arrivals, &stop)
                        .await
                }
                _ => Ok(DownloadTally::default()),
            };
            resolver.arrivals.finish();
            if tally.is_ok() {
                run.advance(RunState::Reconstructing);
            }
            tally
        };
        let (download, root) = tokio::try_join!(transfer, resolver.resolve(root_id.clone()))?;

        let mut arena = NodeArena::build(&root);
        let hooks_run = run_hooks(&self.registry, &mut arena)?;

        let report = ReceiveReport {
            root_id: root_id.clone(),
            closure_size: ids.len() as u64,
            cache_hits: (ids.len() - missing.len()) as u64,
            downloaded_objects: download.objects,
            download_batches: download.batches,
            downloaded_bytes: download.bytes,
            deserialized: resolver.deserialized.load(Ordering::Relaxed),
            hooks_run,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        Ok(Received {
            root,
            arena,
            report,
        })
    }

    async fn fetch_root(&self, root_id: &ObjectId, stop: &CancellationToken) -> Result<String> {
        let remote = self
            .remote()
            .ok_or_else(|| TransportError::PartialGraph(root_id.clone()))?;
        let json = until_cancelled(stop, remote.download_single(root_id))
            .await?
            .map_err(|err| TransportError::remote(format!("download of root {root_id}"), err))?
            .ok_or_else(|| TransportError::PartialGraph(root_id.clone()))?;
        let (id, stored) = (root_id.clone(), json.clone());
        cache_call(&self.cache, stop, "root write", move |cache| {
            cache.put(&id, &stored)
        })
        .await?;
        self.options.progress.report(ProgressEvent::new(
            ProgressStage::DownloadBytes,
            json.len() as u64,
        ));
        Ok(json)
    }

    /// Downloads `missing` in batches, keeping up to `download_concurrency`
    /// requests in flight. Records reach `arrivals` as they stream in, so
    /// reconstruction overlaps the transfer.
    async fn download(
        &self,
        remote: &dyn RemoteObjectManager,
        missing: &[ObjectId],
        arrivals: &Arrivals,
        stop: &CancellationToken,
    ) -> Result<DownloadTally> {
        let requests: Vec<_> = missing
            .chunks(self.options.download_batch.max(1))
            .map(|batch| self.download_batch(remote, batch, arrivals, stop))
            .collect();
        let mut batches =
            stream::iter(requests).buffer_unordered(self.options.download_concurrency.max(1));
        let mut tally = DownloadTally::default();
        while let Some(batch) = batches.next().await {
            tally.add(batch?);
        }
        Ok(tally)
    }

    /// One download request. The batch is written to the cache in a single
    /// transaction once its stream ends.
    async fn download_batch(
        &self,
        remote: &dyn RemoteObjectManager,
        batch: &[ObjectId],
        arrivals: &Arrivals,
        stop: &CancellationToken,
    ) -> Result<DownloadTally> {
        let context = format!("download batch of {} starting at {}", batch.len(), batch[0]);
        let mut stream = until_cancelled(stop, remote.download_objects(batch))
            .await?
            .map_err(|err| TransportError::remote(context.clone(), err))?;
        let mut items = Vec::with_capacity(batch.len());
        let mut bytes = 0;
        while let Some(item) = until_cancelled(stop, stream.next()).await? {
            let (id, json) = item.map_err(|err| TransportError::remote(context.clone(), err))?;
            bytes += json.len() as u64;
            self.options.progress.report(ProgressEvent::new(
                ProgressStage::DownloadBytes,
                json.len() as u64,
            ));
            arrivals.deliver(id.clone(), json.clone());
            items.push((id, json));
        }
        let count = items.len();
        if count > 0 {
            cache_call(&self.cache, stop, &context, move |cache| cache.put_batch(&items)).await?;
            self.options
                .progress
                .report(ProgressEvent::new(ProgressStage::CacheWrite, count as u64));
        }
        debug!(requested = batch.len(), received = count, "download batch stored");
        Ok(DownloadTally {
            objects: count as u64,
            batches: 1,
            bytes,
        })
    }
}

#[derive(Debug, Default)]
struct DownloadTally {
    objects: u64,
    batches: u64,
    bytes: u64,
}

impl DownloadTally {
    fn add(&mut self, other: DownloadTally) {
        self.objects += other.objects;
        self.batches += other.batches;
        self.bytes += other.bytes;
    }
}

/// Records fetched during a run, waiting for the reconstruction that needs
/// them. Ids listed as expected are still being downloaded until `finish`.
struct Arrivals {
    records: DashMap<ObjectId, String>,
    expected: HashSet<ObjectId>,
    finished: AtomicBool,
    notify: Notify,
}

impl Arrivals {
    fn new(expected: HashSet<ObjectId>) -> Self {
        Self {
            records: DashMap::new(),
            expected,
            finished: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn deliver(&self, id: ObjectId, json: String) {
        self.records.insert(id, json);
        self.notify.notify_waiters();
    }

    fn finish(&self) {
        self.finished.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Hands over the record for `id`, waiting while its download may still
    /// deliver it. `None` sends the caller to the cache.
    async fn take(&self, id: &ObjectId, stop: &CancellationToken) -> Result<Option<String>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let finished = self.finished.load(Ordering::Acquire);
            if let Some((_, json)) = self.records.remove(id) {
                return Ok(Some(json));
            }
            if finished || !self.expected.contains(id) {
                return Ok(None);
            }
            until_cancelled(stop, notified.as_mut()).await?;
        }
    }
}

/// A record as read for reconstruction.
struct Fetched {
    /// Taken by the deserializer, and put back if it fails.
    json: Mutex<Option<String>>,
    children: Vec<ObjectId>,
    closure_len: usize,
}

/// Per-id state: the record, then the node built from it.
#[derive(Default)]
struct Slot {
    record: OnceCell<Arc<Fetched>>,
    node: OnceCell<NodeRef>,
}

/// Reconstructs each id at most once, however many parents reference it.
///
/// A parent only waits on a child whose closure is smaller than its own. A
/// well-formed closure holds each child plus that child's closure, so the
/// rule never rejects real graphs, and it leaves looping closures nothing to
/// wait on.
struct Resolver {
    slots: DashMap<ObjectId, Arc<Slot>>,
    arrivals: Arrivals,
    cache: Arc<dyn LocalCache>,
    registry: Arc<TypeRegistry>,
    pool: Arc<WorkerPool>,
    options: PipelineOptions,
    stop: CancellationToken,
    deserialized: AtomicU64,
}

impl Resolver {
    fn slot(&self, id: &ObjectId) -> Arc<Slot> {
        Arc::clone(self.slots.entry(id.clone()).or_default().value())
    }

    /// The node for `id`, reconstructing it unless another caller already
    /// did or is doing so.
    fn resolve(self: &Arc<Self>, id: ObjectId) -> BoxFuture<'static, Result<NodeRef>> {
        let this = Arc::clone(self);
        async move {
            let slot = this.slot(&id);
            slot.node
                .get_or_try_init(|| this.reconstruct(&id, &slot))
                .await
                .cloned()
        }
        .boxed()
    }

    /// Reads the record for `id` once and peeks its closure.
    async fn fetch(&self, id: &ObjectId, slot: &Slot) -> Result<Arc<Fetched>> {
        slot.record
            .get_or_try_init(|| async {
                let json = self.record(id).await?;
                let closure = peek_closure(&json)
                    .map_err(|err| TransportError::malformed(Some(id), err.to_string()))?;
                Ok::<_, TransportError>(Arc::new(Fetched {
                    children: closure.direct_children().cloned().collect(),
                    closure_len: closure.len(),
                    json: Mutex::new(Some(json)),
                }))
            })
            .await
            .cloned()
    }

    async fn record(&self, id: &ObjectId) -> Result<String> {
        if let Some(json) = self.arrivals.take(id, &self.stop).await? {
            return Ok(json);
        }
        let lookup = id.clone();
        cache_call(&self.cache, &self.stop, "record lookup", move |cache| {
            cache.get(&lookup)
        })
        .await?
        .ok_or_else(|| TransportError::PartialGraph(id.clone()))
    }

    /// Checks `child` against its parent's closure size, then resolves it.
    async fn resolve_child(
        self: &Arc<Self>,
        parent: &ObjectId,
        parent_len: usize,
        child: ObjectId,
    ) -> Result<NodeRef> {
        let slot = self.slot(&child);
        let fetched = self.fetch(&child, &slot).await?;
        if fetched.closure_len >= parent_len {
            return Err(TransportError::malformed(
                Some(parent),
                format!(
                    "child {child} lists {} closure ids, the parent only {parent_len}",
                    fetched.closure_len
                ),
            ));
        }
        self.resolve(child).await
    }

    async fn reconstruct(self: &Arc<Self>, id: &ObjectId, slot: &Slot) -> Result<NodeRef> {
        if self.stop.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        let fetched = self.fetch(id, slot).await?;
        let closure_len = fetched.closure_len;

        let pending = fetched.children.iter().map(|child| {
            let child = child.clone();
            async move {
                let outcome = self.resolve_child(id, closure_len, child.clone()).await;
                (child, outcome)
            }
        });
        let mut resolved = HashMap::new();
        for (child, outcome) in future::join_all(pending).await {
            match outcome {
                Ok(node) => {
                    resolved.insert(child, node);
                }
                Err(TransportError::PartialGraph(absent)) if self.options.deserialize.skip_invalid => {
                    warn!(parent = %id, missing = %absent, "skipping unresolvable reference");
                }
                Err(err) => return Err(err),
            }
        }

        let json = fetched
            .json
            .lock()
            .take()
            .ok_or_else(|| TransportError::Internal(format!("record {id} taken twice")))?;
        let registry = Arc::clone(&self.registry);
        let options = self.options.deserialize.clone();
        let record_id = id.clone();
        let (json, built) = self
            .pool
            .run(move || {
                let built = ObjectDeserializer::new(&registry, &resolved, options)
                    .deserialize_object(&record_id, &json);
                (json, built)
            })
            .await?;
        let node = match built {
            Ok(node) => node,
            Err(err) => {
                *fetched.json.lock() = Some(json);
                return Err(err);
            }
        };
        self.deserialized.fetch_add(1, Ordering::Relaxed);
        self.options
            .progress
            .report(ProgressEvent::new(ProgressStage::Deserialize, 1));
        Ok(node)
    }
}

/// Second pass over the reconstructed graph: runs the registry's
/// post-receive hooks for every node in arena order.
fn run_hooks(registry: &TypeRegistry, arena: &mut NodeArena) -> Result<u64> {
    if !registry.has_hooks() {
        return Ok(0);
    }
    let work: Vec<(ArenaIndex, String)> = arena
        .iter()
        .map(|(index, node)| (index, node.speckle_type().to_string()))
        .collect();
    let mut ran = 0;
    for (index, speckle_type) in work {
        for hook in registry.hooks_for(&speckle_type) {
            hook(&mut *arena, index).map_err(|message| TransportError::Hook {
                speckle_type: speckle_type.clone(),
                message,
            })?;
            ran += 1;
        }
    }
    Ok(ran)
}
