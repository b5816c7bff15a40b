// Logging for the dedicated thread pool
//
// The pool itself only emits `tracing` events: worker start and exit at
// debug level, job panics at warn. This module sets up a subscriber for
// binaries and tests that want to see them.
//
// # Usage Examples
//
// ```rust
// use dedicated_pool::logging;
//
// // INFO level, console output
// logging::init_default();
//
// // DEBUG everywhere, TRACE for worker lifecycle
// logging::init_development();
// ```

use std::fs::OpenOptions;
use std::io;
use std::sync::{Mutex, Once};

use tracing::{Level, Subscriber};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub use tracing;
pub use tracing::{debug, error, info, trace, warn};

/// Configuration for the logging system
///
/// # Examples
///
/// ```rust
/// use dedicated_pool::logging::LogConfig;
/// use tracing::Level;
///
/// let config = LogConfig {
///     level: Level::DEBUG,
///     target_filters: Some("dedicated_pool::pool=trace".to_string()),
///     ..Default::default()
/// };
/// assert!(!config.json_format);
/// ```
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: Level,
    /// Whether to use JSON format for logs
    pub json_format: bool,
    /// Whether to include file and line information
    pub show_file_line: bool,
    /// Whether to include thread name/id. Worker threads are named after
    /// the pool's thread name prefix.
    pub show_thread_info: bool,
    /// Target filter expressions (format: "target=level,target2=level2,...")
    pub target_filters: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            show_file_line: true,
            show_thread_info: true,
            target_filters: None,
        }
    }
}

// Initialization guard to ensure we only initialize once
static INIT: Once = Once::new();

fn env_filter(config: &LogConfig) -> EnvFilter {
    let mut env_filter = EnvFilter::from_default_env().add_directive(config.level.into());

    if let Some(filters) = &config.target_filters {
        for filter in filters.split(',') {
            if let Ok(directive) = filter.parse() {
                env_filter = env_filter.add_directive(directive);
            }
        }
    }

    env_filter
}

/// Initialize the global subscriber with the given configuration.
///
/// Safe to call multiple times; only the first call takes effect.
pub fn init(config: LogConfig) {
    INIT.call_once(|| {
        let registry = tracing_subscriber::registry().with(env_filter(&config));

        let subscriber: Box<dyn Subscriber + Send + Sync> = if config.json_format {
            Box::new(registry.with(fmt::layer().json().flatten_event(true)))
        } else {
            Box::new(
                registry.with(
                    fmt::layer()
                        .with_ansi(atty::is(atty::Stream::Stdout))
                        .with_file(config.show_file_line)
                        .with_line_number(config.show_file_line)
                        .with_thread_names(config.show_thread_info)
                        .with_thread_ids(config.show_thread_info),
                ),
            )
        };

        set_global_subscriber(subscriber);
    });
}

/// Initialize logging to both the console and `log_file`.
///
/// The file is opened in append mode and created if missing. File output
/// never uses ANSI colors and always carries file, line and thread info.
pub fn init_with_file(config: LogConfig, log_file: &str) -> io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(log_file)?;

    INIT.call_once(|| {
        let console_layer = fmt::layer()
            .with_ansi(atty::is(atty::Stream::Stdout))
            .with_file(config.show_file_line)
            .with_line_number(config.show_file_line)
            .with_thread_names(config.show_thread_info)
            .with_thread_ids(config.show_thread_info);

        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .with_file(true)
            .with_line_number(true)
            .with_thread_names(true)
            .with_thread_ids(true);

        let subscriber = tracing_subscriber::registry()
            .with(env_filter(&config))
            .with(console_layer)
            .with(file_layer);

        set_global_subscriber(subscriber);
    });

    Ok(())
}

fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error setting global tracing subscriber: {}", err);
    }
}

/// INFO level with human-readable console output.
pub fn init_default() {
    init(LogConfig::default());
}

/// DEBUG for the crate, TRACE for worker lifecycle events.
pub fn init_development() {
    init(LogConfig {
        level: Level::DEBUG,
        target_filters: Some("dedicated_pool=debug,dedicated_pool::pool=trace".to_string()),
        ..Default::default()
    });
}

/// JSON output at INFO, without file/line information.
pub fn init_production() {
    init(LogConfig {
        level: Level::INFO,
        json_format: true,
        show_file_line: false,
        show_thread_info: true,
        target_filters: None,
    });
}

/// Warnings and errors only, without thread information.
pub fn init_test() {
    init(LogConfig {
        level: Level::WARN,
        show_thread_info: false,
        ..Default::default()
    });
}

/// Span covering one pool, for grouping the events of its threads.
///
/// ```rust
/// let span = dedicated_pool::pool_span!("index-header", 4);
/// let _guard = span.enter();
/// ```
#[macro_export]
macro_rules! pool_span {
    ($prefix:expr, $threads:expr) => {
        $crate::logging::tracing::info_span!("thread_pool", prefix = $prefix, threads = $threads)
    };
    ($prefix:expr, $threads:expr, $($fields:tt)*) => {
        $crate::logging::tracing::info_span!("thread_pool", prefix = $prefix, threads = $threads, $($fields)*)
    };
}
