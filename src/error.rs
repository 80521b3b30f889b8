//! Error taxonomy for the frame loop.
//!
//! Transient conditions (no frame ready, display busy) never show up here.
//! Operational failures are returned by the engines and absorbed by the
//! [`SyncCore`](crate::pipeline::SyncCore); only [`PipelineError`] ends a session.

use std::io;

use thiserror::Error;

use crate::pipeline::pool::{BufferId, Ownership};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("event source failed: {0}")]
    EventSource(#[source] io::Error),

    #[error("no event source became ready within {timeout_ms}ms")]
    Stall { timeout_ms: u64 },

    #[error("capture device failure: {0}")]
    Capture(#[from] CaptureError),

    #[error("display device failure: {0}")]
    Display(#[from] DisplayError),

    #[error("buffer pool: {0}")]
    Pool(#[from] PoolError),
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("buffer {0} has no capture queue index")]
    Unregistered(BufferId),
}

impl CaptureError {
    pub(crate) fn io(op: &'static str, source: io::Error) -> Self {
        Self::Io { op, source }
    }
}

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("atomic commit failed: {0}")]
    Commit(#[source] io::Error),

    #[error("initial modeset failed: {0}")]
    Modeset(#[source] io::Error),

    #[error("buffer {0} has no display surface")]
    Unregistered(BufferId),

    #[error("reading display events failed: {0}")]
    Events(#[source] io::Error),
}

impl DisplayError {
    /// Whether the session can continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Events(_) | Self::Modeset(_))
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("a pool needs at least 2 buffers, got {count}")]
    TooFew { count: usize },

    #[error("no buffer {0} in pool")]
    UnknownBuffer(BufferId),

    #[error("buffer {id} is {actual}, expected {expected} (moving to {next})")]
    InvalidTransition {
        id: BufferId,
        expected: Ownership,
        actual: Ownership,
        next: Ownership,
    },

    #[error("buffer {pending} is already pending on display")]
    PendingOccupied { pending: BufferId },
}
