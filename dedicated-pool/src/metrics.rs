//! # Metrics
//!
//! Instruments recorded by the thread pool, and the registration seam they
//! are handed to.
//!
//! Nothing here is global. A pool receives a [`Registerer`] at construction
//! and registers its collectors against it; [`NoopRegistry`] discards them
//! and [`Registry`] keeps them for exposition in the Prometheus text format.
//!
//! ```text
//! ThreadPool::call
//!       │  observe(waiting) / inc()
//!       ▼
//! Histogram / Gauge  (atomics, shared by all callers)
//!       │
//!       ▼  Registry::gather()
//! <prefix>_thread_pool_seconds_bucket{stage="waiting",le="0.005"} 3
//! ```

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use crate::error::MetricsError;

/// Label value for the time spent waiting for a free dedicated thread.
pub const STAGE_WAITING: &str = "waiting";
/// Label value for the time from the start of the wait to job completion.
pub const STAGE_COMPLETE: &str = "complete";

/// Prometheus client default buckets, in seconds.
pub const DEFAULT_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Something that can be exposed by a [`Registry`].
pub trait Collector: Send + Sync {
    /// Fully qualified metric name
    fn name(&self) -> &str;

    /// Append the text exposition of this collector to `out`.
    fn encode(&self, out: &mut String);
}

/// Registration handle injected into the pool.
pub trait Registerer: Send + Sync {
    fn register(&self, collector: Arc<dyn Collector>) -> Result<(), MetricsError>;

    /// Remove the collector registered under `name`. Returns whether one was.
    fn unregister(&self, name: &str) -> bool;
}

// ── Gauge ─────────────────────────────────────────────────────────

/// A value that can go up and down.
#[derive(Debug)]
pub struct Gauge {
    name: String,
    help: String,
    value: AtomicI64,
}

impl Gauge {
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            value: AtomicI64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Collector for Gauge {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} gauge", self.name);
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

// ── Histogram ─────────────────────────────────────────────────────

/// A single histogram series.
///
/// Bucket counts are stored per bucket and made cumulative on encode.
pub struct Histogram {
    bounds: Arc<[f64]>,
    /// One slot per bound plus the implicit `+Inf` bucket
    counts: Vec<AtomicU64>,
    count: AtomicU64,
    /// `f64` bits
    sum: AtomicU64,
}

impl Histogram {
    fn with_bounds(bounds: Arc<[f64]>) -> Self {
        let counts = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            counts,
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn observe(&self, value: f64) {
        let idx = self
            .bounds
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(self.bounds.len());
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        let mut current = self.sum.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self
                .sum
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn observe_duration(&self, elapsed: Duration) {
        self.observe(elapsed.as_secs_f64());
    }

    /// Number of observations.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of all observed values.
    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    /// Cumulative count per bucket, `+Inf` last.
    pub fn cumulative_counts(&self) -> Vec<u64> {
        let mut total = 0;
        self.counts
            .iter()
            .map(|c| {
                total += c.load(Ordering::Relaxed);
                total
            })
            .collect()
    }
}

impl fmt::Debug for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Histogram")
            .field("count", &self.count())
            .field("sum", &self.sum())
            .finish()
    }
}

/// A family of histograms partitioned by a single label.
pub struct HistogramVec {
    name: String,
    help: String,
    label: String,
    bounds: Arc<[f64]>,
    children: RwLock<BTreeMap<String, Arc<Histogram>>>,
}

impl HistogramVec {
    pub fn new(
        name: impl Into<String>,
        help: impl Into<String>,
        label: impl Into<String>,
        buckets: &[f64],
    ) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            label: label.into(),
            bounds: buckets.into(),
            children: RwLock::new(BTreeMap::new()),
        }
    }

    /// Get or create the series for `value`.
    pub fn with_label_value(&self, value: &str) -> Result<Arc<Histogram>, MetricsError> {
        if value.contains(['"', '\\', '\n']) {
            return Err(MetricsError::InvalidLabel(value.to_string()));
        }

        if let Some(child) = self
            .children
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(value)
        {
            return Ok(Arc::clone(child));
        }

        let mut children = self.children.write().unwrap_or_else(PoisonError::into_inner);
        let child = children
            .entry(value.to_string())
            .or_insert_with(|| Arc::new(Histogram::with_bounds(Arc::clone(&self.bounds))));
        Ok(Arc::clone(child))
    }
}

impl fmt::Debug for HistogramVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistogramVec")
            .field("name", &self.name)
            .field("label", &self.label)
            .finish()
    }
}

impl Collector for HistogramVec {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} histogram", self.name);

        let children = self.children.read().unwrap_or_else(PoisonError::into_inner);
        for (value, child) in children.iter() {
            let cumulative = child.cumulative_counts();
            for (bound, count) in self.bounds.iter().zip(&cumulative) {
                let _ = writeln!(
                    out,
                    "{}_bucket{{{}=\"{}\",le=\"{}\"}} {}",
                    self.name, self.label, value, bound, count
                );
            }
            let _ = writeln!(
                out,
                "{}_bucket{{{}=\"{}\",le=\"+Inf\"}} {}",
                self.name,
                self.label,
                value,
                child.count()
            );
            let _ = writeln!(out, "{}_sum{{{}=\"{}\"}} {}", self.name, self.label, value, child.sum());
            let _ = writeln!(out, "{}_count{{{}=\"{}\"}} {}", self.name, self.label, value, child.count());
        }
    }
}

// ── Registries ────────────────────────────────────────────────────

/// In-memory registry that renders the Prometheus text format.
#[derive(Default)]
pub struct Registry {
    collectors: Mutex<Vec<Arc<dyn Collector>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render every registered collector, ordered by name.
    pub fn gather(&self) -> String {
        let mut collectors = self
            .collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        collectors.sort_by(|a, b| a.name().cmp(b.name()));

        let mut out = String::new();
        for collector in &collectors {
            collector.encode(&mut out);
        }
        out
    }

    /// Names of all registered collectors, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }
}

impl Registerer for Registry {
    fn register(&self, collector: Arc<dyn Collector>) -> Result<(), MetricsError> {
        let mut collectors = self.collectors.lock().unwrap_or_else(PoisonError::into_inner);
        if collectors.iter().any(|c| c.name() == collector.name()) {
            return Err(MetricsError::AlreadyRegistered(collector.name().to_string()));
        }
        collectors.push(collector);
        Ok(())
    }

    fn unregister(&self, name: &str) -> bool {
        let mut collectors = self.collectors.lock().unwrap_or_else(PoisonError::into_inner);
        let before = collectors.len();
        collectors.retain(|c| c.name() != name);
        collectors.len() != before
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("names", &self.names()).finish()
    }
}

/// Registerer that accepts and drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRegistry;

impl Registerer for NoopRegistry {
    fn register(&self, _collector: Arc<dyn Collector>) -> Result<(), MetricsError> {
        Ok(())
    }

    fn unregister(&self, _name: &str) -> bool {
        false
    }
}

// ── Pool instruments ──────────────────────────────────────────────

/// The two instruments recorded by [`ThreadPool`](crate::ThreadPool).
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    pub waiting: Arc<Histogram>,
    pub complete: Arc<Histogram>,
    pub tasks: Arc<Gauge>,
}

impl PoolMetrics {
    /// Create and register `<prefix>_thread_pool_seconds` and
    /// `<prefix>_thread_pool_tasks`.
    ///
    /// Registers both or neither.
    pub fn new(prefix: &str, registerer: &dyn Registerer) -> Result<Self, MetricsError> {
        let timing = Arc::new(HistogramVec::new(
            format!("{prefix}_thread_pool_seconds"),
            "Amount of time spent performing index header operations on a dedicated thread",
            "stage",
            &DEFAULT_BUCKETS,
        ));
        let tasks = Arc::new(Gauge::new(
            format!("{prefix}_thread_pool_tasks"),
            "Number of index header operations currently executing",
        ));

        let waiting = timing.with_label_value(STAGE_WAITING)?;
        let complete = timing.with_label_value(STAGE_COMPLETE)?;

        let timing_name = timing.name().to_string();
        registerer.register(timing)?;
        if let Err(err) = registerer.register(Arc::clone(&tasks) as Arc<dyn Collector>) {
            registerer.unregister(&timing_name);
            return Err(err);
        }

        Ok(Self {
            waiting,
            complete,
            tasks,
        })
    }
}
