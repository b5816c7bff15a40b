use crate::error::PoolError;

pub const DEFAULT_THREAD_NAME_PREFIX: &str = "index-header";
pub const DEFAULT_METRICS_PREFIX: &str = "cortex_bucket_store_indexheader";

// --- Pool Configuration ---

/// Configuration for a [`ThreadPool`](crate::ThreadPool).
#[derive(Clone, Debug)]
pub struct ThreadPoolConfig {
    /// Number of dedicated threads. Must be greater than zero.
    pub num_threads: usize,

    /// Dedicated threads are named `<prefix>-<index>`, the supervisor
    /// `<prefix>-supervisor`.
    pub thread_name_prefix: String,

    /// Stack size for each dedicated thread. `None` uses the platform default.
    pub stack_size: Option<usize>,

    /// Prefix of the `_thread_pool_seconds` and `_thread_pool_tasks` metrics.
    pub metrics_prefix: String,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            num_threads: num_cpus::get(),
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
            stack_size: None,
            metrics_prefix: DEFAULT_METRICS_PREFIX.to_string(),
        }
    }
}

impl ThreadPoolConfig {
    /// Default configuration with `num_threads` dedicated threads.
    pub fn with_threads(num_threads: usize) -> Self {
        Self {
            num_threads,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.num_threads == 0 {
            return Err(PoolError::InvalidSize(self.num_threads));
        }
        Ok(())
    }

    pub(crate) fn worker_name(&self, index: usize) -> String {
        format!("{}-{}", self.thread_name_prefix, index)
    }

    pub(crate) fn supervisor_name(&self) -> String {
        format!("{}-supervisor", self.thread_name_prefix)
    }
}
