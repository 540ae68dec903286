//! Concurrent send and receive pipelines.
//!
//! CPU work (serializing, deserializing) runs on a [`WorkerPool`]; cache and
//! remote I/O run as tokio tasks joined by bounded queues. Every suspension
//! point also waits on the run's cancellation token.

use std::future::Future;
use std::sync::Arc;

use tokio::task;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheError, LocalCache};
use crate::error::{Result, TransportError};

mod options;
mod pool;
mod progress;
mod receive;
mod send;
mod state;

pub use options::{
    default_workers, PipelineOptions, DEFAULT_CACHE_CHUNK, DEFAULT_DOWNLOAD_BATCH,
    DEFAULT_DOWNLOAD_CONCURRENCY, DEFAULT_QUEUE_CAPACITY, MAX_DEFAULT_WORKERS,
};
pub use pool::WorkerPool;
pub use progress::{
    default_progress, CounterProgress, NoopProgress, ProgressEvent, ProgressReporter,
    ProgressStage,
};
pub use receive::{ReceivePipeline, ReceiveReport, Received};
pub use send::{SendPipeline, SendReport};
pub use state::{RunGuard, RunState, RunStateCell};

/// Awaits `fut` unless `stop` fires first.
pub(crate) async fn until_cancelled<F: Future>(
    stop: &CancellationToken,
    fut: F,
) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = stop.cancelled() => Err(TransportError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Runs a cache call on the blocking pool.
///
/// Cancellation stops the wait, not the call; a batch already handed to the
/// cache commits or rolls back as a whole.
pub(crate) async fn cache_call<T, F>(
    cache: &Arc<dyn LocalCache>,
    stop: &CancellationToken,
    context: &str,
    call: F,
) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn LocalCache) -> std::result::Result<T, CacheError> + Send + 'static,
{
    let cache = Arc::clone(cache);
    let joined = until_cancelled(stop, task::spawn_blocking(move || call(cache.as_ref()))).await?;
    joined
        .map_err(|err| TransportError::Internal(format!("{context}: {err}")))?
        .map_err(|err| TransportError::cache(context, err))
}

/// Picks the error a run reports from the outcomes of its stages.
///
/// Caller cancellation wins; otherwise the first real failure, since the
/// other stages only stopped because of it.
pub(crate) fn settle(
    cancel: &CancellationToken,
    outcomes: impl IntoIterator<Item = Result<()>>,
) -> Result<()> {
    let mut failure = None;
    let mut stopped = false;
    for outcome in outcomes {
        match outcome {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => stopped = true,
            Err(err) => {
                if failure.is_none() {
                    failure = Some(err);
                }
            }
        }
    }
    if cancel.is_cancelled() {
        return Err(TransportError::Cancelled);
    }
    match failure {
        Some(err) => Err(err),
        None if stopped => Err(TransportError::Cancelled),
        None => Ok(()),
    }
}
