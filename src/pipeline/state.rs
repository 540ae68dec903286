use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::error::{Result, TransportError};

/// Where a pipeline run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// No run has started.
    Idle,
    /// Walking and serializing the graph.
    Traversing,
    /// Waiting on cache lookups and writes.
    DrainingCache,
    /// Waiting on remote requests.
    DrainingRemote,
    /// Rebuilding nodes from records.
    Reconstructing,
    /// The last run succeeded.
    Completed,
    /// The last run failed.
    Failed,
    /// The last run was cancelled.
    Canceled,
}

impl RunState {
    /// True once a run has ended.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Canceled
        )
    }

    /// True while a run is in progress.
    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != RunState::Idle
    }

    /// Lower-case name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Traversing => "traversing",
            RunState::DrainingCache => "draining_cache",
            RunState::DrainingRemote => "draining_remote",
            RunState::Reconstructing => "reconstructing",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Canceled => "canceled",
        }
    }
}

/// Per-pipeline state slot that admits one run at a time.
#[derive(Debug)]
pub struct RunStateCell {
    state: Mutex<RunState>,
}

impl Default for RunStateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStateCell {
    /// A cell in [`RunState::Idle`].
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RunState::Idle),
        }
    }

    /// Current state.
    pub fn get(&self) -> RunState {
        *self.state.lock()
    }

    /// Starts a run in `first`. Fails with [`TransportError::Busy`] while
    /// another run is active.
    pub fn begin(&self, kind: &'static str, first: RunState) -> Result<RunGuard<'_>> {
        let mut state = self.state.lock();
        if state.is_active() {
            return Err(TransportError::Busy(kind));
        }
        debug!(run = kind, from = state.as_str(), to = first.as_str(), "run started");
        *state = first;
        Ok(RunGuard {
            cell: self,
            kind,
            finished: false,
        })
    }
}

/// Handle of the active run. Dropping it unfinished marks the run canceled.
#[derive(Debug)]
pub struct RunGuard<'a> {
    cell: &'a RunStateCell,
    kind: &'static str,
    finished: bool,
}

impl RunGuard<'_> {
    /// Moves the run to `next`.
    pub fn advance(&self, next: RunState) {
        let mut state = self.cell.state.lock();
        debug!(run = self.kind, from = state.as_str(), to = next.as_str(), "run state");
        *state = next;
    }

    /// Records the terminal state matching `result`.
    pub fn finish<T>(mut self, result: &Result<T>) -> RunState {
        let terminal = match result {
            Ok(_) => RunState::Completed,
            Err(err) if err.is_cancelled() => RunState::Canceled,
            Err(_) => RunState::Failed,
        };
        self.advance(terminal);
        self.finished = true;
        terminal
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            *self.cell.state.lock() = RunState::Canceled;
        }
    }
}
