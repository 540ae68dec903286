//! The remote side of the transport.
//!
//! [`RemoteObjectManager`] is the seam to a remote object store. Only its
//! contract lives here together with the wire codecs; [`MemoryRemote`] is an
//! in-process peer and [`CachePeer`] serves another local cache as a remote.

use std::collections::HashMap;
use std::io;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::cache::CacheError;
use crate::serialization::Record;
use crate::types::ObjectId;

mod batch;
mod cache_peer;
mod memory;
pub mod wire;

pub use batch::{UploadBatcher, DEFAULT_BATCH_BYTES, DEFAULT_BATCH_ITEMS};
pub use cache_peer::CachePeer;
pub use memory::{MemoryRemote, RemoteStats, RemoteStatsSnapshot};
pub use wire::LineDecoder;

/// Records arriving from a batch download, in arrival order.
pub type ObjectStream = BoxStream<'static, Result<(ObjectId, String), RemoteError>>;

/// Failure of a [`RemoteObjectManager`] call.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The remote cannot be reached.
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    /// A payload that does not follow the line format.
    #[error("wire format error: {0}")]
    Wire(String),
    /// Reading or writing a payload failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The remote refused the request.
    #[error("remote rejected request: {0}")]
    Rejected(String),
    /// The cache behind a [`CachePeer`] failed.
    #[error("peer cache: {0}")]
    Cache(#[from] CacheError),
}

/// Remote object store, addressed by record id.
#[async_trait]
pub trait RemoteObjectManager: Send + Sync {
    /// Presence flag for every requested id.
    async fn has_objects(&self, ids: &[ObjectId]) -> Result<HashMap<ObjectId, bool>, RemoteError>;

    /// Stores a batch. `compress` gzips the request body.
    async fn upload_objects(&self, batch: &[Record], compress: bool) -> Result<(), RemoteError>;

    /// Streams the requested records. Ids the remote does not hold are
    /// absent from the stream.
    async fn download_objects(&self, ids: &[ObjectId]) -> Result<ObjectStream, RemoteError>;

    /// Fetches one record; `Ok(None)` when the remote lacks it.
    async fn download_single(&self, id: &ObjectId) -> Result<Option<String>, RemoteError>;
}
