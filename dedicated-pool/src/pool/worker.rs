//! # Worker Thread Module
//!
//! A dedicated worker owns exactly one OS thread for its whole lifetime and
//! runs submitted jobs on it, one at a time, start to finish.
//!
//! ## Key Concepts
//! - Submission and result slots: single-slot `flume` channels
//! - Stop signal: raised by the owner, ends the run loop between jobs
//! - Completion signal: raised by the run loop on every exit path
//! - Lease: held for as long as the worker is busy with a caller's job. If
//!   the caller stops waiting, the run loop releases it when the job ends
//!
//! ## Lifecycle
//! `Created` → `start()` → `Running` → `stop()` → `Stopping` → `join()` → `Stopped`

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use flume::{Receiver, Selector, Sender, TrySendError};
use tracing::{debug, trace, warn};

use crate::error::PoolError;
use crate::signal::Signal;

/// Type-erased value produced by a job.
pub type Output = Box<dyn Any + Send>;

/// A zero-argument operation run on a dedicated thread.
pub type Job = Box<dyn FnOnce() -> Output + Send + 'static>;

/// Held while the worker is busy with one caller's job and dropped once the
/// worker is done with it.
pub type Lease = Box<dyn Send + 'static>;

/// Either the job's output or its panic payload.
type Completion = thread::Result<Output>;

/// Jobs and results carry a sequence number so that the result of a call
/// abandoned by its caller is never handed to the next one.
struct Submission {
    seq: u64,
    job: Job,
}

/// Shared by callers and the run loop, for jobs whose caller went away.
#[derive(Default)]
struct Handoff {
    /// Sequence number and lease of an abandoned job
    abandoned: Option<(u64, Option<Lease>)>,
    /// Set once the run loop has exited
    closed: bool,
}

/// States a worker can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Worker has been created but not started yet
    Created,
    /// Run loop is waiting for, or executing, jobs
    Running,
    /// Stop signal raised, run loop may still be finishing a job
    Stopping,
    /// Thread joined
    Stopped,
}

/// Worker bound to one persistent OS thread.
///
/// `call` trusts single-caller discipline: the owning pool never hands the
/// same worker to two callers at once.
pub struct Worker {
    name: String,
    stack_size: Option<usize>,
    state: Mutex<WorkerState>,
    next_seq: AtomicU64,

    jobs_tx: Sender<Submission>,
    results_rx: Receiver<(u64, Completion)>,
    /// Thread-side ends of the slots, moved onto the thread by `start`
    endpoints: Mutex<Option<(Receiver<Submission>, Sender<(u64, Completion)>)>>,

    stop: Arc<Signal>,
    done: Arc<Signal>,
    handoff: Arc<Mutex<Handoff>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("stop_raised", &self.stop.is_raised())
            .field("done", &self.done.is_raised())
            .finish()
    }
}

impl Worker {
    /// Create a worker with its own stop signal.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_stop_signal(name, Arc::new(Signal::new()))
    }

    /// Create a worker whose stop signal is owned by someone else.
    pub fn with_stop_signal(name: impl Into<String>, stop: Arc<Signal>) -> Self {
        let (jobs_tx, jobs_rx) = flume::bounded(1);
        let (results_tx, results_rx) = flume::bounded(1);

        Self {
            name: name.into(),
            stack_size: None,
            state: Mutex::new(WorkerState::Created),
            next_seq: AtomicU64::new(0),
            jobs_tx,
            results_rx,
            endpoints: Mutex::new(Some((jobs_rx, results_tx))),
            stop,
            done: Arc::new(Signal::new()),
            handoff: Arc::new(Mutex::new(Handoff::default())),
            handle: Mutex::new(None),
        }
    }

    /// Set the stack size of the dedicated thread. Only effective before `start`.
    pub fn stack_size(mut self, stack_size: Option<usize>) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        *lock(&self.state)
    }

    /// Whether the run loop has exited.
    pub fn is_done(&self) -> bool {
        self.done.is_raised()
    }

    /// Spawn the dedicated thread and enter the run loop.
    pub fn start(&self) -> Result<(), PoolError> {
        let mut state = lock(&self.state);
        if *state != WorkerState::Created {
            return Err(PoolError::WorkerState(format!(
                "cannot start worker {} in state {:?}",
                self.name, *state
            )));
        }

        let (jobs, results) = lock(&self.endpoints).take().ok_or_else(|| {
            PoolError::WorkerState(format!("worker {} has already been torn down", self.name))
        })?;

        let mut builder = thread::Builder::new().name(self.name.clone());
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }

        let name = self.name.clone();
        let stop = Arc::clone(&self.stop);
        let done = Arc::clone(&self.done);
        let handoff = Arc::clone(&self.handoff);
        let handle = builder
            .spawn(move || run_loop(&name, jobs, results, &stop, &done, &handoff))
            .map_err(|source| PoolError::Spawn {
                name: self.name.clone(),
                source,
            })?;

        *lock(&self.handle) = Some(handle);
        *state = WorkerState::Running;
        Ok(())
    }

    /// Run `job` on the dedicated thread and wait for its output.
    ///
    /// Returns [`PoolError::Stopped`] if the worker was never started or its
    /// run loop exits before producing a result. A panicking job yields
    /// [`PoolError::Panicked`] and leaves the thread running.
    pub fn call(&self, job: Job) -> Result<Output, PoolError> {
        let seq = self.submit_guard()?;
        self.jobs_tx
            .send(Submission { seq, job })
            .map_err(|_| PoolError::Stopped)?;

        loop {
            let received = Selector::new()
                .recv(&self.results_rx, |res| res.ok())
                .recv(self.done.receiver(), |_| None)
                .wait();

            match received {
                Some((got, completion)) if got == seq => return into_output(completion),
                // Not ours
                Some(_) => continue,
                None => return self.take_buffered(seq),
            }
        }
    }

    /// Async form of [`call`](Self::call).
    ///
    /// Dropping the returned future does not cancel the job; its result is
    /// discarded when the job finishes.
    pub async fn call_async(&self, job: Job) -> Result<Output, PoolError> {
        self.call_async_leased(job, None).await
    }

    /// [`call_async`](Self::call_async) holding `lease` until the worker is
    /// done with the job.
    ///
    /// If the future is dropped while the job is queued or running, the run
    /// loop drops the lease once the job ends or the loop exits.
    pub(crate) async fn call_async_leased(
        &self,
        job: Job,
        lease: Option<Lease>,
    ) -> Result<Output, PoolError> {
        let seq = self.submit_guard()?;
        self.jobs_tx
            .send_async(Submission { seq, job })
            .await
            .map_err(|_| PoolError::Stopped)?;

        let mut in_flight = InFlight {
            worker: self,
            seq,
            lease,
            settled: false,
        };

        loop {
            let received = tokio::select! {
                res = self.results_rx.recv_async() => res.ok(),
                _ = self.done.wait_async() => None,
            };

            match received {
                Some((got, completion)) if got == seq => {
                    in_flight.settled = true;
                    return into_output(completion);
                }
                Some(_) => continue,
                None => {
                    in_flight.settled = true;
                    return self.take_buffered(seq);
                }
            }
        }
    }

    /// Raise the stop signal. Does nothing if it is already raised.
    pub fn stop(&self) {
        if self.stop.raise() {
            trace!(worker = %self.name, "stop signal raised");
        }

        let mut state = lock(&self.state);
        if *state == WorkerState::Running {
            *state = WorkerState::Stopping;
        }
    }

    /// The caller of job `seq` stopped waiting for it.
    fn abandon(&self, seq: u64, lease: Option<Lease>) {
        let mut handoff = lock(&self.handoff);

        let mut finished = handoff.closed;
        while let Ok((got, _)) = self.results_rx.try_recv() {
            finished |= got == seq;
        }

        if finished {
            drop(handoff);
            drop(lease);
        } else {
            trace!(worker = %self.name, seq, "caller went away, job still in flight");
            handoff.abandoned = Some((seq, lease));
        }
    }

    /// Wait for the run loop to exit. Only call after [`stop`](Self::stop).
    ///
    /// A worker that was never started is torn down and returns at once.
    pub fn join(&self) -> Result<(), PoolError> {
        let handle = lock(&self.handle).take();
        let result = match handle {
            Some(handle) => handle
                .join()
                .map_err(|payload| PoolError::Panicked(panic_message(payload.as_ref()))),
            None => {
                // Dropping the thread-side ends makes later calls fail fast.
                drop(lock(&self.endpoints).take());
                Ok(())
            }
        };

        *lock(&self.state) = WorkerState::Stopped;
        result
    }

    fn submit_guard(&self) -> Result<u64, PoolError> {
        if self.state() == WorkerState::Created {
            return Err(PoolError::Stopped);
        }
        Ok(self.next_seq.fetch_add(1, Ordering::Relaxed))
    }

    /// After the run loop exited, a result may still sit in the slot.
    fn take_buffered(&self, seq: u64) -> Result<Output, PoolError> {
        while let Ok((got, completion)) = self.results_rx.try_recv() {
            if got == seq {
                return into_output(completion);
            }
        }
        Err(PoolError::Stopped)
    }
}

/// A submitted job whose result the caller has not received yet.
struct InFlight<'a> {
    worker: &'a Worker,
    seq: u64,
    lease: Option<Lease>,
    settled: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.worker.abandon(self.seq, self.lease.take());
        }
    }
}

/// Runs when the run loop returns or unwinds.
struct OnExit<'a> {
    handoff: &'a Mutex<Handoff>,
    done: &'a Signal,
}

impl Drop for OnExit<'_> {
    fn drop(&mut self) {
        let abandoned = {
            let mut handoff = lock(self.handoff);
            handoff.closed = true;
            handoff.abandoned.take()
        };
        // An abandoned job still queued behind the stop never runs.
        drop(abandoned);
        self.done.raise();
    }
}

fn run_loop(
    name: &str,
    jobs: Receiver<Submission>,
    results: Sender<(u64, Completion)>,
    stop: &Signal,
    done: &Signal,
    handoff: &Mutex<Handoff>,
) {
    let _exit = OnExit { handoff, done };
    debug!(worker = name, "dedicated thread started");

    loop {
        // Stop wins over a waiting job once it is visible.
        if stop.is_raised() {
            break;
        }

        let next = Selector::new()
            .recv(stop.receiver(), |_| None)
            .recv(&jobs, |submission| submission.ok())
            .wait();
        let Some(Submission { seq, job }) = next else {
            break;
        };

        let completion = panic::catch_unwind(AssertUnwindSafe(job));
        if let Err(payload) = &completion {
            warn!(
                worker = name,
                panic = %panic_message(payload.as_ref()),
                "job panicked on dedicated thread"
            );
        }

        // Held across the send so an abandoning caller either finds the
        // result in the slot or leaves its lease for us.
        let overflow = {
            let mut handoff = lock(handoff);
            let abandoned = handoff.abandoned.take_if(|(id, _)| *id == seq);
            if let Some((_, lease)) = abandoned {
                drop(handoff);
                drop(lease);
                continue;
            }

            match results.try_send((seq, completion)) {
                Ok(()) => None,
                Err(TrySendError::Disconnected(_)) => break,
                Err(TrySendError::Full(item)) => Some(item),
            }
        };

        // Only reachable when two callers share the worker.
        if let Some(item) = overflow {
            let sent = Selector::new()
                .send(&results, item, |res| res.is_ok())
                .recv(stop.receiver(), |_| false)
                .wait();
            if !sent {
                break;
            }
        }
    }

    debug!(worker = name, "dedicated thread exiting");
}

fn into_output(completion: Completion) -> Result<Output, PoolError> {
    completion.map_err(|payload| PoolError::Panicked(panic_message(payload.as_ref())))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "Unknown panic".to_string()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
