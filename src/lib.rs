//! Content-addressed transport for polymorphic object graphs.
//!
//! A graph of [`model::Node`]s is split into small JSON records, each keyed by
//! the hash of its canonical bytes. Records are deduplicated against a local
//! [`cache::LocalCache`] and a [`remote::RemoteObjectManager`] and moved
//! between them by the [`pipeline`] send and receive runs.
//!
//! ```no_run
//! use std::sync::Arc;
//! use sombra_transport::cache::{CacheOptions, SqliteCache};
//! use sombra_transport::model::{Node, NodeRef, TypeRegistry};
//! use sombra_transport::pipeline::{PipelineOptions, ReceivePipeline, SendPipeline};
//! use sombra_transport::remote::MemoryRemote;
//! use sombra_transport::TransportError;
//! use tokio_util::sync::CancellationToken;
//!
//! sombra_transport::graph_object! {
//!     pub struct Point as "Objects.Geometry.Point" {
//!         pub x: f64,
//!         pub y: f64,
//!     }
//! }
//!
//! # async fn demo() -> sombra_transport::Result<()> {
//! let cache = SqliteCache::open("cache.db", CacheOptions::default()).map_err(|err| {
//!     TransportError::Storage { context: "open cache".into(), source: err.into() }
//! })?;
//! let cache = Arc::new(cache);
//! let remote = Arc::new(MemoryRemote::new());
//! let sender = SendPipeline::new(cache.clone(), remote.clone(), PipelineOptions::new())?;
//! let root: NodeRef = Arc::new(Point { x: 1.0, y: 2.0, ..Default::default() });
//! let report = sender.send(&root, CancellationToken::new()).await?;
//!
//! let mut registry = TypeRegistry::new();
//! registry.register::<Point>();
//! let receiver =
//!     ReceivePipeline::new(cache, remote, Arc::new(registry), PipelineOptions::new())?;
//! let received = receiver.receive(&report.root_id, CancellationToken::new()).await?;
//! assert_eq!(received.root.speckle_type(), "Objects.Geometry.Point");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod admin;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod remote;
pub mod serialization;
pub mod types;

pub use error::{Result, StorageError, TransportError};
pub use types::{content_hash, Closure, ObjectId};
