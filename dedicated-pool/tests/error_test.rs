// Integration tests for error types in dedicated_pool::error

use std::error::Error as _;
use std::io;

use anyhow::anyhow;
use dedicated_pool::error::*;

#[test]
fn test_pool_error_display() {
    assert_eq!(PoolError::Stopped.to_string(), "thread pool has been stopped");
    assert_eq!(
        PoolError::Panicked("boom".to_string()).to_string(),
        "job panicked on dedicated thread: boom"
    );
    assert_eq!(PoolError::InvalidSize(0).to_string(), "invalid thread pool size: 0");
    assert_eq!(
        PoolError::WorkerState("already running".to_string()).to_string(),
        "worker state error: already running"
    );

    let other = PoolError::Other(anyhow!("free-list closed"));
    assert!(other.to_string().contains("free-list closed"));
}

#[test]
fn test_spawn_error_keeps_source() {
    let err = PoolError::Spawn {
        name: "index-header-0".to_string(),
        source: io::Error::new(io::ErrorKind::OutOfMemory, "no stack"),
    };

    assert_eq!(err.to_string(), "failed to spawn dedicated thread index-header-0: no stack");
    let source = err.source().expect("spawn error should carry its io::Error");
    assert_eq!(source.to_string(), "no stack");
}

#[test]
fn test_metrics_error_converts_into_pool_error() {
    let err: PoolError = MetricsError::AlreadyRegistered("x_tasks".to_string()).into();
    assert!(matches!(err, PoolError::Metrics(MetricsError::AlreadyRegistered(_))));
    assert_eq!(
        err.to_string(),
        "metrics registration failed: collector already registered: x_tasks"
    );
    assert_eq!(
        MetricsError::InvalidLabel("a\"b".to_string()).to_string(),
        "invalid label value \"a\\\"b\""
    );
}

#[test]
fn test_is_stopped() {
    assert!(PoolError::Stopped.is_stopped());
    assert!(!PoolError::InvalidSize(0).is_stopped());
    assert!(!PoolError::Panicked(String::new()).is_stopped());
}
