// Dedicated Thread Pool
//
// A bounded pool of persistent OS threads for operations that must start and
// finish on the same thread and must not share it with other callers while
// they run.

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod signal;

// Re-export commonly used types
pub use config::ThreadPoolConfig;
pub use error::{MetricsError, PoolError};
pub use metrics::{NoopRegistry, Registerer, Registry};
pub use pool::worker::{Worker, WorkerState};
pub use pool::ThreadPool;
pub use signal::Signal;
