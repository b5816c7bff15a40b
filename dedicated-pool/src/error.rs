use std::io;

use thiserror::Error;

/// Errors returned by the dedicated-thread pool and its workers.
#[derive(Error, Debug)]
pub enum PoolError {
    /// The pool, or the worker a call was routed to, has stopped or is stopping.
    #[error("thread pool has been stopped")]
    Stopped,
    #[error("job panicked on dedicated thread: {0}")]
    Panicked(String),
    #[error("invalid thread pool size: {0}")]
    InvalidSize(usize),
    #[error("failed to spawn dedicated thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("worker state error: {0}")]
    WorkerState(String),
    #[error("metrics registration failed: {0}")]
    Metrics(#[from] MetricsError),
    #[error("internal pool error: {0}")]
    Other(#[from] anyhow::Error),
}

impl PoolError {
    /// Whether the call was rejected or abandoned because of shutdown.
    pub fn is_stopped(&self) -> bool {
        matches!(self, PoolError::Stopped)
    }
}

/// Errors related to registering metric collectors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetricsError {
    #[error("collector already registered: {0}")]
    AlreadyRegistered(String),
    #[error("invalid label value {0:?}")]
    InvalidLabel(String),
}
