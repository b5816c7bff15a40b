// Integration tests for dedicated_pool::ThreadPool

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use dedicated_pool::{NoopRegistry, PoolError, Registry, ThreadPool, ThreadPoolConfig};

fn started_pool(num_threads: usize) -> Arc<ThreadPool> {
    let pool = ThreadPool::with_threads(num_threads, &NoopRegistry).expect("pool should be created");
    pool.start().unwrap();
    Arc::new(pool)
}

/// Poll `cond` until it holds or the deadline passes.
fn eventually(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[test]
fn test_zero_threads_yields_no_pool() {
    assert!(ThreadPool::with_threads(0, &NoopRegistry).is_none());

    let err = ThreadPool::try_new(ThreadPoolConfig::with_threads(0), &NoopRegistry).unwrap_err();
    assert!(matches!(err, PoolError::InvalidSize(0)));
}

#[test]
fn test_new_pool_has_every_thread_available() {
    let pool = started_pool(3);
    assert_eq!(pool.size(), 3);
    assert_eq!(pool.available(), 3);
    assert!(!pool.is_stopping());
    pool.stop_and_wait();
}

#[test]
fn test_call_returns_job_output_unmodified() {
    let pool = started_pool(2);

    assert_eq!(pool.call(|| 42).unwrap(), 42);
    assert_eq!(pool.call(|| "header".to_string()).unwrap(), "header");

    let job_result = pool
        .call(|| -> Result<u32, io::Error> { Err(io::Error::new(io::ErrorKind::InvalidData, "corrupt header")) })
        .unwrap();
    let err = job_result.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    assert_eq!(err.to_string(), "corrupt header");

    // The worker went back to the pool even though the job failed.
    assert_eq!(pool.available(), 2);
    pool.stop_and_wait();
}

#[test]
fn test_job_executes_exactly_once() {
    let pool = started_pool(1);
    let runs = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&runs);
    pool.call(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    pool.stop_and_wait();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_try_call_flattens_job_errors() {
    #[derive(Debug)]
    enum ReadError {
        Pool(PoolError),
        Missing(&'static str),
    }

    impl From<PoolError> for ReadError {
        fn from(err: PoolError) -> Self {
            ReadError::Pool(err)
        }
    }

    let pool = started_pool(1);

    let ok: Result<u64, ReadError> = pool.try_call(|| Ok(7));
    assert_eq!(ok.unwrap(), 7);

    let missing: Result<u64, ReadError> = pool.try_call(|| Err(ReadError::Missing("symbols")));
    assert!(matches!(missing, Err(ReadError::Missing("symbols"))));

    pool.stop_and_wait();

    let stopped: Result<u64, ReadError> = pool.try_call(|| Ok(7));
    assert!(matches!(stopped, Err(ReadError::Pool(PoolError::Stopped))));
}

#[test]
fn test_accepts_n_concurrent_calls_and_blocks_the_next() {
    const N: usize = 3;
    let pool = started_pool(N);
    let (release_tx, release_rx) = flume::unbounded::<()>();

    let holders: Vec<_> = (0..N)
        .map(|i| {
            let pool = Arc::clone(&pool);
            let release_rx = release_rx.clone();
            thread::spawn(move || {
                pool.call(move || {
                    release_rx.recv().unwrap();
                    i
                })
                .unwrap()
            })
        })
        .collect();

    assert!(
        eventually(Duration::from_secs(5), || pool.available() == 0),
        "all {N} calls should have been admitted"
    );

    let extra_ran = Arc::new(AtomicBool::new(false));
    let extra = {
        let pool = Arc::clone(&pool);
        let extra_ran = Arc::clone(&extra_ran);
        thread::spawn(move || {
            pool.call(move || extra_ran.store(true, Ordering::SeqCst)).unwrap();
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!extra_ran.load(Ordering::SeqCst), "call N+1 must wait for a free thread");

    release_tx.send(()).unwrap();
    assert!(eventually(Duration::from_secs(5), || extra_ran.load(Ordering::SeqCst)));

    for _ in 1..N {
        release_tx.send(()).unwrap();
    }

    let mut finished: Vec<usize> = holders.into_iter().map(|h| h.join().unwrap()).collect();
    finished.sort_unstable();
    assert_eq!(finished, vec![0, 1, 2]);
    extra.join().unwrap();

    pool.stop_and_wait();
}

#[test]
fn test_two_threads_run_two_jobs_side_by_side() {
    let pool = started_pool(2);
    let (started_tx, started_rx) = flume::bounded::<()>(1);

    let a = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            pool.call(move || {
                started_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                (1, thread::current().id())
            })
            .unwrap()
        })
    };

    started_rx.recv().unwrap();
    let begin = Instant::now();
    let (b, b_thread) = pool.call(|| (2, thread::current().id())).unwrap();
    assert!(begin.elapsed() < Duration::from_millis(50), "B should not wait for A");

    let (a, a_thread) = a.join().unwrap();
    assert_eq!(a, 1);
    assert_eq!(b, 2);
    assert_ne!(a_thread, b_thread);

    pool.stop_and_wait();
}

#[test]
fn test_single_thread_serializes_jobs() {
    let pool = started_pool(1);
    let job = || {
        thread::sleep(Duration::from_millis(50));
        thread::current().id()
    };

    let begin = Instant::now();
    let first = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.call(job).unwrap())
    };
    let second = pool.call(job).unwrap();
    let first = first.join().unwrap();

    assert!(begin.elapsed() >= Duration::from_millis(100));
    assert_eq!(first, second);

    pool.stop_and_wait();
}

#[test]
fn test_jobs_run_on_named_dedicated_threads() {
    let config = ThreadPoolConfig {
        num_threads: 1,
        thread_name_prefix: "mmap-reader".to_string(),
        ..Default::default()
    };
    let pool = ThreadPool::new(config, &NoopRegistry).unwrap();
    pool.start().unwrap();

    let caller = thread::current().id();
    let (name, id) = pool
        .call(|| {
            let current = thread::current();
            (current.name().map(str::to_string), current.id())
        })
        .unwrap();

    assert_eq!(name.as_deref(), Some("mmap-reader-0"));
    assert_ne!(id, caller);
    assert_eq!(pool.call(|| thread::current().id()).unwrap(), id);

    pool.stop_and_wait();
}

#[test]
fn test_no_two_jobs_share_a_thread_at_once() {
    let pool = started_pool(3);
    let busy = Arc::new(Mutex::new(HashSet::new()));
    let seen = Arc::new(Mutex::new(HashSet::new()));

    let callers: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let busy = Arc::clone(&busy);
            let seen = Arc::clone(&seen);
            thread::spawn(move || {
                for _ in 0..25 {
                    let busy = Arc::clone(&busy);
                    let seen = Arc::clone(&seen);
                    pool.call(move || {
                        let id = thread::current().id();
                        assert!(busy.lock().unwrap().insert(id), "thread already running a job");
                        seen.lock().unwrap().insert(id);
                        thread::sleep(Duration::from_micros(200));
                        busy.lock().unwrap().remove(&id);
                    })
                    .unwrap();
                }
            })
        })
        .collect();

    for caller in callers {
        caller.join().unwrap();
    }

    assert!(seen.lock().unwrap().len() <= 3);
    assert_eq!(pool.available(), 3);
    pool.stop_and_wait();
}

#[test]
fn test_calls_after_stop_are_rejected_without_running() {
    let pool = started_pool(2);
    pool.stop_and_wait();
    assert!(pool.is_stopping());
    assert!(pool.is_stopped());

    let ran = Arc::new(AtomicBool::new(false));
    for _ in 0..10 {
        let ran = Arc::clone(&ran);
        let result = pool.call(move || ran.store(true, Ordering::SeqCst));
        assert!(matches!(result, Err(PoolError::Stopped)));
    }
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn test_stop_before_any_call() {
    let pool = ThreadPool::with_threads(1, &NoopRegistry).unwrap();
    pool.start().unwrap();
    pool.stop_and_wait();

    let err = pool.call(|| 1).unwrap_err();
    assert!(err.is_stopped());
}

#[test]
fn test_stop_and_wait_without_start_terminates() {
    let pool = ThreadPool::with_threads(2, &NoopRegistry).unwrap();
    pool.stop_and_wait();
    assert!(pool.is_stopped());
    assert!(pool.call(|| 1).unwrap_err().is_stopped());

    // Starting after shutdown is a no-op.
    pool.start().unwrap();
    assert!(pool.call(|| 1).unwrap_err().is_stopped());
}

#[test]
fn test_start_and_stop_are_idempotent() {
    let pool = ThreadPool::with_threads(2, &NoopRegistry).unwrap();
    pool.start().unwrap();
    pool.start().unwrap();
    assert_eq!(pool.call(|| 5).unwrap(), 5);

    pool.stop_and_wait();
    pool.stop_and_wait();
    assert!(pool.is_stopped());
}

#[test]
fn test_concurrent_stop_and_wait() {
    let pool = started_pool(4);
    let stoppers: Vec<_> = (0..4)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.stop_and_wait())
        })
        .collect();

    for stopper in stoppers {
        stopper.join().unwrap();
    }
    assert!(pool.is_stopped());
}

#[test]
fn test_stop_waits_for_in_flight_job() {
    let pool = started_pool(1);
    let (started_tx, started_rx) = flume::bounded::<()>(1);

    let caller = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            pool.call(move || {
                started_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(100));
                "done"
            })
        })
    };

    started_rx.recv().unwrap();
    let begin = Instant::now();
    pool.stop_and_wait();
    assert!(begin.elapsed() >= Duration::from_millis(50));

    // The in-flight job is not interrupted and its result still arrives.
    assert_eq!(caller.join().unwrap().unwrap(), "done");
    assert!(pool.call(|| 1).unwrap_err().is_stopped());
}

#[test]
fn test_inline_shutdown_does_not_block_start_or_debug() {
    let pool = Arc::new(ThreadPool::with_threads(1, &NoopRegistry).unwrap());
    let (release_tx, release_rx) = flume::bounded::<()>(1);
    let (started_tx, started_rx) = flume::bounded::<()>(1);

    let caller = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            pool.call(move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
        })
    };
    started_rx.recv().unwrap();

    // Never started, so the shutdown runs on this stopper thread.
    let stopper = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.stop_and_wait())
    };
    assert!(eventually(Duration::from_secs(1), || pool.is_stopping()));

    let (report_tx, report_rx) = flume::bounded::<String>(1);
    {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            pool.start().unwrap();
            report_tx.send(format!("{pool:?}")).unwrap();
        });
    }
    let debug = report_rx
        .recv_timeout(Duration::from_secs(1))
        .expect("start and Debug must not wait for the running job");
    assert!(debug.contains("stopping: true"));
    assert!(!pool.is_stopped());

    release_tx.send(()).unwrap();
    caller.join().unwrap().unwrap();
    stopper.join().unwrap();
    assert!(pool.is_stopped());
}

#[test]
fn test_stop_with_calls_in_progress_terminates() {
    let pool = started_pool(2);
    let completed = Arc::new(AtomicUsize::new(0));

    let callers: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let completed = Arc::clone(&completed);
            thread::spawn(move || loop {
                match pool.call(|| thread::sleep(Duration::from_millis(1))) {
                    Ok(()) => {
                        completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(PoolError::Stopped) => break,
                    Err(other) => panic!("unexpected error: {other}"),
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(30));
    pool.stop_and_wait();

    for caller in callers {
        caller.join().unwrap();
    }
    assert!(completed.load(Ordering::Relaxed) > 0);
    assert!(pool.is_stopped());
}

#[test]
fn test_panicking_job_leaves_thread_usable() {
    let pool = started_pool(1);
    let before = pool.call(|| thread::current().id()).unwrap();

    let err = pool.call(|| -> u32 { panic!("bad index header") }).unwrap_err();
    match err {
        PoolError::Panicked(msg) => assert_eq!(msg, "bad index header"),
        other => panic!("expected Panicked, got {other:?}"),
    }

    assert_eq!(pool.available(), 1);
    let after = pool.call(|| thread::current().id()).unwrap();
    assert_eq!(before, after);

    pool.stop_and_wait();
}

#[test]
fn test_timing_and_task_metrics() {
    let registry = Registry::new();
    let pool = ThreadPool::new(ThreadPoolConfig::with_threads(2), &registry).unwrap();
    pool.start().unwrap();
    let pool = Arc::new(pool);

    let (started_tx, started_rx) = flume::bounded::<()>(1);
    let (release_tx, release_rx) = flume::bounded::<()>(1);
    let running = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            pool.call(move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
            .unwrap()
        })
    };

    started_rx.recv().unwrap();
    assert_eq!(pool.metrics().tasks.get(), 1);
    release_tx.send(()).unwrap();
    running.join().unwrap();

    pool.call(|| ()).unwrap();
    pool.call(|| ()).unwrap();

    let metrics = pool.metrics();
    assert_eq!(metrics.tasks.get(), 0);
    assert_eq!(metrics.waiting.count(), 3);
    assert_eq!(metrics.complete.count(), 3);
    assert!(metrics.complete.sum() >= metrics.waiting.sum());

    let text = registry.gather();
    assert!(text.contains("# TYPE cortex_bucket_store_indexheader_thread_pool_seconds histogram"));
    assert!(text.contains("cortex_bucket_store_indexheader_thread_pool_seconds_count{stage=\"waiting\"} 3"));
    assert!(text.contains("cortex_bucket_store_indexheader_thread_pool_seconds_count{stage=\"complete\"} 3"));
    assert!(text.contains("cortex_bucket_store_indexheader_thread_pool_tasks 0"));

    pool.stop_and_wait();
}

#[test]
fn test_rejected_calls_are_not_timed() {
    let registry = Registry::new();
    let pool = ThreadPool::new(ThreadPoolConfig::with_threads(1), &registry).unwrap();
    pool.stop_and_wait();

    assert!(pool.call(|| ()).is_err());
    assert_eq!(pool.metrics().waiting.count(), 0);
    assert_eq!(pool.metrics().complete.count(), 0);
}

#[test]
fn test_duplicate_metrics_registration_fails() {
    let registry = Registry::new();
    let first = ThreadPool::new(ThreadPoolConfig::with_threads(1), &registry).unwrap();

    let err = ThreadPool::try_new(ThreadPoolConfig::with_threads(1), &registry).unwrap_err();
    assert!(matches!(err, PoolError::Metrics(_)));
    assert!(ThreadPool::new(ThreadPoolConfig::with_threads(1), &registry).is_none());

    // A different prefix registers fine next to the first pool.
    let config = ThreadPoolConfig {
        num_threads: 1,
        metrics_prefix: "store_gateway_indexheader".to_string(),
        ..Default::default()
    };
    let second = ThreadPool::new(config, &registry).unwrap();

    first.stop_and_wait();
    second.stop_and_wait();
}

#[test]
fn test_dropping_started_pool_stops_supervisor() {
    let pool = started_pool(2);
    assert_eq!(pool.call(|| 1).unwrap(), 1);
    drop(pool);
}

#[test]
fn test_debug_format() {
    let pool = started_pool(1);
    let debug = format!("{:?}", pool);
    assert!(debug.contains("ThreadPool"));
    assert!(debug.contains("size: 1"));
    pool.stop_and_wait();
}
