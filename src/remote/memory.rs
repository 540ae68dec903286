use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::debug;

use super::wire::{self, LineDecoder};
use super::{ObjectStream, RemoteError, RemoteObjectManager};
use crate::serialization::Record;
use crate::types::ObjectId;

/// Size of the chunks a download body is fed to the decoder in.
const DOWNLOAD_CHUNK: usize = 8 * 1024;

/// Call counters kept by [`MemoryRemote`].
#[derive(Debug, Default)]
pub struct RemoteStats {
    has_calls: AtomicU64,
    upload_calls: AtomicU64,
    uploaded_objects: AtomicU64,
    uploaded_bytes: AtomicU64,
    download_calls: AtomicU64,
    downloaded_objects: AtomicU64,
    single_downloads: AtomicU64,
}

/// Call and volume counters of a [`MemoryRemote`] at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemoteStatsSnapshot {
    /// `has_objects` calls.
    pub has_calls: u64,
    /// Upload requests.
    pub upload_calls: u64,
    /// Records uploaded.
    pub uploaded_objects: u64,
    /// Upload bytes on the wire.
    pub uploaded_bytes: u64,
    /// Batch download requests.
    pub download_calls: u64,
    /// Records sent by batch downloads.
    pub downloaded_objects: u64,
    /// Single-record downloads.
    pub single_downloads: u64,
}

impl RemoteStats {
    /// Reads every counter.
    pub fn snapshot(&self) -> RemoteStatsSnapshot {
        RemoteStatsSnapshot {
            has_calls: self.has_calls.load(Ordering::Relaxed),
            upload_calls: self.upload_calls.load(Ordering::Relaxed),
            uploaded_objects: self.uploaded_objects.load(Ordering::Relaxed),
            uploaded_bytes: self.uploaded_bytes.load(Ordering::Relaxed),
            download_calls: self.download_calls.load(Ordering::Relaxed),
            downloaded_objects: self.downloaded_objects.load(Ordering::Relaxed),
            single_downloads: self.single_downloads.load(Ordering::Relaxed),
        }
    }
}

/// An in-process remote store.
///
/// Uploads and downloads pass through the real wire encoding, so the codec
/// is exercised end to end. An optional latency is slept before every call.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    objects: DashMap<ObjectId, String>,
    stats: RemoteStats,
    latency: Option<Duration>,
    compress_downloads: bool,
    failing: AtomicBool,
}

impl MemoryRemote {
    /// An empty store with no latency.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps `latency` before every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Serves batch downloads gzip-compressed.
    pub fn with_compressed_downloads(mut self, compress: bool) -> Self {
        self.compress_downloads = compress;
        self
    }

    /// Makes every subsequent call fail with [`RemoteError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Counters so far.
    pub fn stats(&self) -> RemoteStatsSnapshot {
        self.stats.snapshot()
    }

    /// Seeds the store directly, bypassing the wire.
    pub fn insert(&self, id: ObjectId, json: impl Into<String>) {
        self.objects.insert(id, json.into());
    }

    /// Stored record for `id`.
    pub fn get(&self, id: &ObjectId) -> Option<String> {
        self.objects.get(id).map(|entry| entry.value().clone())
    }

    /// True when `id` is stored.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    /// Removes and returns the record for `id`.
    pub fn remove(&self, id: &ObjectId) -> Option<String> {
        self.objects.remove(id).map(|(_, json)| json)
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    async fn enter(&self) -> Result<(), RemoteError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(Ordering::Relaxed) {
            return Err(RemoteError::Unavailable("remote marked as failing".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteObjectManager for MemoryRemote {
    async fn has_objects(&self, ids: &[ObjectId]) -> Result<HashMap<ObjectId, bool>, RemoteError> {
        self.enter().await?;
        self.stats.has_calls.fetch_add(1, Ordering::Relaxed);
        Ok(ids
            .iter()
            .map(|id| (id.clone(), self.objects.contains_key(id)))
            .collect())
    }

    async fn upload_objects(&self, batch: &[Record], compress: bool) -> Result<(), RemoteError> {
        self.enter().await?;
        let body = wire::encode_batch(
            batch.iter().map(|record| (&record.id, record.json.as_str())),
            compress,
        )?;
        let received = wire::decode_batch(&body)?;
        let count = received.len() as u64;
        for (id, json) in received {
            self.objects.entry(id).or_insert(json);
        }
        self.stats.upload_calls.fetch_add(1, Ordering::Relaxed);
        self.stats.uploaded_objects.fetch_add(count, Ordering::Relaxed);
        self.stats
            .uploaded_bytes
            .fetch_add(body.len() as u64, Ordering::Relaxed);
        debug!(objects = count, bytes = body.len(), compress, "remote accepted batch");
        Ok(())
    }

    async fn download_objects(&self, ids: &[ObjectId]) -> Result<ObjectStream, RemoteError> {
        self.enter().await?;
        let found: Vec<(ObjectId, String)> = ids
            .iter()
            .filter_map(|id| self.get(id).map(|json| (id.clone(), json)))
            .collect();
        let body = wire::encode_batch(
            found.iter().map(|(id, json)| (id, json.as_str())),
            self.compress_downloads,
        )?;
        let mut decoder = if self.compress_downloads {
            LineDecoder::gzip()
        } else {
            LineDecoder::new()
        };
        let mut decoded = Vec::with_capacity(found.len());
        for chunk in body.chunks(DOWNLOAD_CHUNK) {
            decoded.extend(decoder.push(chunk)?);
        }
        decoded.extend(decoder.finish()?);
        self.stats.download_calls.fetch_add(1, Ordering::Relaxed);
        self.stats
            .downloaded_objects
            .fetch_add(decoded.len() as u64, Ordering::Relaxed);
        Ok(stream::iter(decoded.into_iter().map(Ok)).boxed())
    }

    async fn download_single(&self, id: &ObjectId) -> Result<Option<String>, RemoteError> {
        self.enter().await?;
        self.stats.single_downloads.fetch_add(1, Ordering::Relaxed);
        Ok(self.get(id))
    }
}
