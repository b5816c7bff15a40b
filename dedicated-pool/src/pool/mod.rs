//! # Dedicated Thread Pool Module
//!
//! A fixed set of dedicated OS threads used for operations that must start
//! and finish on the same, unshared thread: reading memory-mapped index
//! headers, for instance.
//!
//! ## Key Concepts
//! - Checkout: a caller takes exclusive use of one idle worker from the
//!   free-list and gives it back when its job returns
//! - Admission: callers block while every worker is checked out
//! - Shutdown: the supervisor stops and joins every worker, checked out or not
//!
//! ## Threads
//! `num_threads` workers plus one supervisor. They coordinate only through
//! [`Signal`]s and bounded `flume` channels.
//!
//! ## Shutdown races
//! A call that sees the stopping signal before it starts waiting is rejected.
//! A call already waiting when shutdown begins may either be rejected or get
//! a worker and run its job; both outcomes are valid.

pub mod worker;

use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::anyhow;
use flume::{Receiver, Selector, Sender};
use tracing::{debug, error, warn};

use crate::config::ThreadPoolConfig;
use crate::error::PoolError;
use crate::metrics::{PoolMetrics, Registerer};
use crate::signal::Signal;

use self::worker::{lock, Job, Lease, Output, Worker};

/// State shared between the pool handle and its supervisor thread
struct Shared {
    /// Indices into `workers` of the idle ones, capacity `workers.len()`
    free_tx: Sender<usize>,
    free_rx: Receiver<usize>,

    /// Every worker, used for dispatch through the free-list and for
    /// stopping all of them at once
    workers: Vec<Worker>,

    /// Raised when shutdown begins
    stopping: Signal,

    /// Raised once every worker has been stopped and joined
    stopped: Signal,

    metrics: PoolMetrics,
    config: ThreadPoolConfig,
}

impl Shared {
    fn supervise(&self) {
        self.stopping.wait();
        self.shutdown_workers();
    }

    /// Stop and join every worker, including ones checked out right now.
    fn shutdown_workers(&self) {
        debug!(threads = self.workers.len(), "stopping dedicated threads");

        for worker in &self.workers {
            worker.stop();
            if let Err(err) = worker.join() {
                warn!(worker = worker.name(), error = %err, "dedicated thread did not exit cleanly");
            }
        }

        self.stopped.raise();
        debug!("dedicated thread pool stopped");
    }
}

enum Lifecycle {
    Created,
    Started(JoinHandle<()>),
    Stopped,
}

/// Pool of dedicated threads with blocking admission and coordinated shutdown.
pub struct ThreadPool {
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
}

impl ThreadPool {
    /// Create a pool and start its workers.
    ///
    /// Returns `None` when `config.num_threads` is zero, or when the pool
    /// cannot be set up. Use [`try_new`](Self::try_new) to see why.
    pub fn new(config: ThreadPoolConfig, registerer: &dyn Registerer) -> Option<Self> {
        match Self::try_new(config, registerer) {
            Ok(pool) => Some(pool),
            Err(PoolError::InvalidSize(_)) => None,
            Err(err) => {
                error!(error = %err, "failed to create dedicated thread pool");
                None
            }
        }
    }

    /// Shorthand for [`new`](Self::new) with default settings and `num_threads` threads.
    pub fn with_threads(num_threads: usize, registerer: &dyn Registerer) -> Option<Self> {
        Self::new(ThreadPoolConfig::with_threads(num_threads), registerer)
    }

    /// Create a pool and start its workers, reporting why it failed.
    pub fn try_new(config: ThreadPoolConfig, registerer: &dyn Registerer) -> Result<Self, PoolError> {
        config.validate()?;
        let metrics = PoolMetrics::new(&config.metrics_prefix, registerer)?;

        let num_threads = config.num_threads;
        let (free_tx, free_rx) = flume::bounded(num_threads);
        let mut workers: Vec<Worker> = Vec::with_capacity(num_threads);

        for index in 0..num_threads {
            let worker = Worker::new(config.worker_name(index)).stack_size(config.stack_size);
            if let Err(err) = worker.start() {
                for started in &workers {
                    started.stop();
                    let _ = started.join();
                }
                return Err(err);
            }

            free_tx
                .try_send(index)
                .map_err(|_| anyhow!("free-list rejected worker {index}"))?;
            workers.push(worker);
        }

        debug!(threads = num_threads, prefix = %config.thread_name_prefix, "dedicated thread pool created");

        Ok(Self {
            shared: Arc::new(Shared {
                free_tx,
                free_rx,
                workers,
                stopping: Signal::new(),
                stopped: Signal::new(),
                metrics,
                config,
            }),
            lifecycle: Mutex::new(Lifecycle::Created),
        })
    }

    /// Launch the supervisor thread.
    ///
    /// Has no effect if the pool was already started or is shutting down.
    pub fn start(&self) -> Result<(), PoolError> {
        let mut lifecycle = lock(&self.lifecycle);
        if !matches!(*lifecycle, Lifecycle::Created) || self.shared.stopping.is_raised() {
            return Ok(());
        }

        let name = self.shared.config.supervisor_name();
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || shared.supervise())
            .map_err(|source| PoolError::Spawn { name, source })?;

        *lifecycle = Lifecycle::Started(handle);
        Ok(())
    }

    /// Begin shutdown and block until every worker has stopped.
    ///
    /// Jobs already running are allowed to finish. Safe to call repeatedly,
    /// concurrently, and on a pool that was never started.
    pub fn stop_and_wait(&self) {
        let previous = {
            let mut lifecycle = lock(&self.lifecycle);
            self.shared.stopping.raise();
            mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        };

        match previous {
            Lifecycle::Created => self.shared.shutdown_workers(),
            Lifecycle::Started(handle) => {
                if handle.join().is_err() {
                    error!("dedicated thread pool supervisor panicked");
                }
            }
            Lifecycle::Stopped => {}
        }
        self.shared.stopped.wait();
    }

    /// Run `job` on a dedicated thread, blocking until one is free.
    ///
    /// The job's output is returned unmodified. A job returning a `Result`
    /// has its own error passed through inside the `Ok`.
    pub fn call<F, T>(&self, job: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let start = Instant::now();
        if self.shared.stopping.is_raised() {
            return Err(PoolError::Stopped);
        }

        let index = Selector::new()
            .recv(self.shared.stopping.receiver(), |_| None)
            .recv(&self.shared.free_rx, |index| index.ok())
            .wait()
            .ok_or(PoolError::Stopped)?;

        let checkout = Checkout::new(Arc::clone(&self.shared), index, start);
        let output = checkout.worker().call(erase(job))?;
        downcast(output)
    }

    /// Like [`call`](Self::call), for jobs that return `Result<T, E>` where
    /// `E` can absorb a [`PoolError`].
    pub fn try_call<F, T, E>(&self, job: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<PoolError> + Send + 'static,
    {
        self.call(job)?
    }

    /// Run `job` on a dedicated thread without blocking the calling task.
    ///
    /// If the returned future is dropped after a worker was acquired, the job
    /// still runs to completion. The worker stays checked out, and counted in
    /// the tasks gauge, until then.
    pub async fn call_async<F, T>(&self, job: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let start = Instant::now();
        if self.shared.stopping.is_raised() {
            return Err(PoolError::Stopped);
        }

        let index = tokio::select! {
            _ = self.shared.stopping.wait_async() => None,
            index = self.shared.free_rx.recv_async() => index.ok(),
        }
        .ok_or(PoolError::Stopped)?;

        let worker = &self.shared.workers[index];
        let checkout: Lease = Box::new(Checkout::new(Arc::clone(&self.shared), index, start));
        let output = worker.call_async_leased(erase(job), Some(checkout)).await?;
        downcast(output)
    }

    /// Number of dedicated threads.
    pub fn size(&self) -> usize {
        self.shared.workers.len()
    }

    /// Number of idle dedicated threads.
    pub fn available(&self) -> usize {
        self.shared.free_rx.len()
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.is_raised()
    }

    /// Whether every worker has been stopped and joined.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.is_raised()
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.shared.metrics
    }

    pub fn config(&self) -> &ThreadPoolConfig {
        &self.shared.config
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Lets a running supervisor wind down without blocking here. Workers
        // of a never-started pool exit once their senders are dropped.
        self.shared.stopping.raise();
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("size", &self.size())
            .field("available", &self.available())
            .field("stopping", &self.is_stopping())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// A worker checked out of the free-list.
///
/// Dropping it checks the worker back in and records the call's timing. An
/// async call hands it to the worker as the job's lease, so a caller that
/// goes away leaves the worker checked out until the job ends.
struct Checkout {
    shared: Arc<Shared>,
    index: usize,
    start: Instant,
}

impl Checkout {
    fn new(shared: Arc<Shared>, index: usize, start: Instant) -> Self {
        shared.metrics.waiting.observe_duration(start.elapsed());
        shared.metrics.tasks.inc();
        Self {
            shared,
            index,
            start,
        }
    }

    fn worker(&self) -> &Worker {
        &self.shared.workers[self.index]
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        self.shared.metrics.tasks.dec();
        self.shared
            .metrics
            .complete
            .observe_duration(self.start.elapsed());
        // Never full: there are exactly `workers.len()` indices.
        let _ = self.shared.free_tx.try_send(self.index);
    }
}

fn erase<F, T>(job: F) -> Job
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Box::new(move || Box::new(job()) as Output)
}

fn downcast<T: 'static>(output: Output) -> Result<T, PoolError> {
    output
        .downcast::<T>()
        .map(|value| *value)
        .map_err(|_| PoolError::Other(anyhow!("dedicated thread returned an unexpected output type")))
}
