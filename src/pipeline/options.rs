use std::sync::Arc;

use super::progress::{default_progress, ProgressReporter};
use crate::remote::{DEFAULT_BATCH_BYTES, DEFAULT_BATCH_ITEMS};
use crate::serialization::DeserializeOptions;

/// Upper bound on the default worker count.
pub const MAX_DEFAULT_WORKERS: usize = 6;
/// Default capacity of every inter-stage queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
/// Default number of ids per cache lookup.
pub const DEFAULT_CACHE_CHUNK: usize = 500;
/// Default number of ids per remote download request.
pub const DEFAULT_DOWNLOAD_BATCH: usize = 2000;
/// Default number of download requests in flight at once.
pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 4;

/// `min(available cores, 6)`.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_DEFAULT_WORKERS)
}

/// Tuning for send and receive runs.
#[derive(Clone)]
pub struct PipelineOptions {
    /// Threads in the CPU worker pool.
    pub workers: usize,
    /// Capacity of the bounded queues between stages.
    pub queue_capacity: usize,
    /// Ids per `has_many` call in the cache filter.
    pub cache_chunk: usize,
    /// Item cap of one upload request.
    pub upload_batch_items: usize,
    /// Byte cap of one upload request.
    pub upload_batch_bytes: usize,
    /// Ids per download request.
    pub download_batch: usize,
    /// Download requests in flight at once.
    pub download_concurrency: usize,
    /// Write records straight to the cache without touching the remote.
    pub skip_remote: bool,
    /// Skip the cache filter and treat every record as new.
    pub skip_cache_read: bool,
    /// Gzip upload bodies.
    pub compress: bool,
    /// Options handed to the deserializer on receive.
    pub deserialize: DeserializeOptions,
    /// Progress sink.
    pub progress: Arc<dyn ProgressReporter>,
}

impl std::fmt::Debug for PipelineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOptions")
            .field("workers", &self.workers)
            .field("queue_capacity", &self.queue_capacity)
            .field("cache_chunk", &self.cache_chunk)
            .field("upload_batch_items", &self.upload_batch_items)
            .field("upload_batch_bytes", &self.upload_batch_bytes)
            .field("download_batch", &self.download_batch)
            .field("download_concurrency", &self.download_concurrency)
            .field("skip_remote", &self.skip_remote)
            .field("skip_cache_read", &self.skip_cache_read)
            .field("compress", &self.compress)
            .field("deserialize", &self.deserialize)
            .finish_non_exhaustive()
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineOptions {
    /// Library defaults.
    pub fn new() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            cache_chunk: DEFAULT_CACHE_CHUNK,
            upload_batch_items: DEFAULT_BATCH_ITEMS,
            upload_batch_bytes: DEFAULT_BATCH_BYTES,
            download_batch: DEFAULT_DOWNLOAD_BATCH,
            download_concurrency: DEFAULT_DOWNLOAD_CONCURRENCY,
            skip_remote: false,
            skip_cache_read: false,
            compress: true,
            deserialize: DeserializeOptions::default(),
            progress: default_progress(),
        }
    }

    /// Sets the worker count, at least one.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Sets the queue capacity, at least one.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Sets the ids per cache lookup, at least one.
    pub fn cache_chunk(mut self, ids: usize) -> Self {
        self.cache_chunk = ids.max(1);
        self
    }

    /// Sets both upload caps.
    pub fn upload_batch(mut self, items: usize, bytes: usize) -> Self {
        self.upload_batch_items = items.max(1);
        self.upload_batch_bytes = bytes.max(1);
        self
    }

    /// Sets the ids per download request, at least one.
    pub fn download_batch(mut self, ids: usize) -> Self {
        self.download_batch = ids.max(1);
        self
    }

    /// Sets the download requests in flight, at least one.
    pub fn download_concurrency(mut self, requests: usize) -> Self {
        self.download_concurrency = requests.max(1);
        self
    }

    /// Writes records to the cache only.
    pub fn skip_remote(mut self, skip: bool) -> Self {
        self.skip_remote = skip;
        self
    }

    /// Treats every record as new.
    pub fn skip_cache_read(mut self, skip: bool) -> Self {
        self.skip_cache_read = skip;
        self
    }

    /// Gzips upload bodies.
    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Sets the deserializer options.
    pub fn deserialize(mut self, options: DeserializeOptions) -> Self {
        self.deserialize = options;
        self
    }

    /// Sets the progress sink.
    pub fn progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }
}
