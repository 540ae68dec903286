use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Pipeline stage a [`ProgressEvent`] reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    /// Records checked against the local cache.
    CacheCheck,
    /// Nodes serialized into records.
    Serialize,
    /// Records written to the local cache.
    CacheWrite,
    /// Bytes sent to the remote.
    UploadBytes,
    /// Bytes received from the remote.
    DownloadBytes,
    /// Records turned back into nodes.
    Deserialize,
}

impl ProgressStage {
    /// Stable name used in logs and CLI output.
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressStage::CacheCheck => "cache_check",
            ProgressStage::Serialize => "serialize",
            ProgressStage::CacheWrite => "cache_write",
            ProgressStage::UploadBytes => "upload_bytes",
            ProgressStage::DownloadBytes => "download_bytes",
            ProgressStage::Deserialize => "deserialize",
        }
    }
}

/// An increment of work on one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    /// Stage the work belongs to.
    pub stage: ProgressStage,
    /// Amount completed by this step (items, or bytes for the byte stages).
    pub count: u64,
    /// Expected total for the stage, when known up front.
    pub total: Option<u64>,
}

impl ProgressEvent {
    /// An increment of `count` on `stage`.
    pub fn new(stage: ProgressStage, count: u64) -> Self {
        Self {
            stage,
            count,
            total: None,
        }
    }

    /// Attaches the expected total.
    pub fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }
}

/// Receives progress from running pipelines.
///
/// Called from worker threads and async tasks alike, so implementations
/// must be cheap and must not block.
pub trait ProgressReporter: Send + Sync {
    /// Receives one increment. Called from worker threads.
    fn report(&self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Running totals per stage.
#[derive(Debug, Default)]
pub struct CounterProgress {
    /// Ids checked against the cache.
    pub cache_checked: AtomicU64,
    /// Nodes serialized.
    pub serialized: AtomicU64,
    /// Records written to the cache.
    pub cache_written: AtomicU64,
    /// Bytes uploaded.
    pub uploaded_bytes: AtomicU64,
    /// Bytes downloaded.
    pub downloaded_bytes: AtomicU64,
    /// Records deserialized.
    pub deserialized: AtomicU64,
}

impl CounterProgress {
    /// All counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current total for `stage`.
    pub fn get(&self, stage: ProgressStage) -> u64 {
        self.counter(stage).load(Ordering::Relaxed)
    }

    fn counter(&self, stage: ProgressStage) -> &AtomicU64 {
        match stage {
            ProgressStage::CacheCheck => &self.cache_checked,
            ProgressStage::Serialize => &self.serialized,
            ProgressStage::CacheWrite => &self.cache_written,
            ProgressStage::UploadBytes => &self.uploaded_bytes,
            ProgressStage::DownloadBytes => &self.downloaded_bytes,
            ProgressStage::Deserialize => &self.deserialized,
        }
    }
}

impl ProgressReporter for CounterProgress {
    fn report(&self, event: ProgressEvent) {
        self.counter(event.stage)
            .fetch_add(event.count, Ordering::Relaxed);
    }
}

/// A reporter that discards everything.
pub fn default_progress() -> Arc<dyn ProgressReporter> {
    Arc::new(NoopProgress)
}
