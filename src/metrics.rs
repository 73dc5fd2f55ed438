//! Counter and timing sinks
//!
//! The runtime reports through the narrow [`Metrics`] trait. Names are
//! dotted paths (`worker.types.signup.response_time`), the way a statsd
//! backend expects them.

use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Sink for counters and timings
pub trait Metrics: Send + Sync + 'static {
    /// Add `delta` to the counter `name`
    fn counter(&self, name: &str, delta: i64);

    /// Record one duration sample under `name`
    fn timing(&self, name: &str, duration: Duration);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn counter(&self, _name: &str, _delta: i64) {}

    fn timing(&self, _name: &str, _duration: Duration) {}
}

/// Prepends a fixed prefix to every name
#[derive(Debug, Clone)]
pub struct Prefixed<M> {
    prefix: String,
    inner: M,
}

impl<M: Metrics> Prefixed<M> {
    /// Wrap `inner`; an empty prefix leaves names untouched
    pub fn new(prefix: impl Into<String>, inner: M) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }

    fn name(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.prefix, name)
        }
    }
}

impl<M: Metrics> Metrics for Prefixed<M> {
    fn counter(&self, name: &str, delta: i64) {
        self.inner.counter(&self.name(name), delta);
    }

    fn timing(&self, name: &str, duration: Duration) {
        self.inner.timing(&self.name(name), duration);
    }
}

impl<M: Metrics + ?Sized> Metrics for Arc<M> {
    fn counter(&self, name: &str, delta: i64) {
        (**self).counter(name, delta);
    }

    fn timing(&self, name: &str, duration: Duration) {
        (**self).timing(name, duration);
    }
}

/// Aggregated samples of one timing
#[derive(Debug, Default)]
struct TimingSummary {
    count: AtomicU64,
    total_nanos: AtomicU64,
    max_nanos: AtomicU64,
}

/// Snapshot of a timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimingStats {
    /// Number of samples
    pub count: u64,
    /// Sum of all samples
    pub total: Duration,
    /// Largest sample
    pub max: Duration,
}

impl TimingStats {
    /// Mean sample, zero when empty
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            let nanos = self.total.as_nanos() / u128::from(self.count);
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        }
    }
}

/// Escape a label value for the text exposition format
fn escape_label(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// In-process metrics store
#[derive(Debug, Default, Clone)]
pub struct InMemoryMetrics {
    counters: Arc<DashMap<String, AtomicI64>>,
    timings: Arc<DashMap<String, TimingSummary>>,
}

impl InMemoryMetrics {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, zero if never touched
    pub fn counter_value(&self, name: &str) -> i64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Snapshot of a timing
    pub fn timing_stats(&self, name: &str) -> TimingStats {
        self.timings
            .get(name)
            .map(|t| TimingStats {
                count: t.count.load(Ordering::Relaxed),
                total: Duration::from_nanos(t.total_nanos.load(Ordering::Relaxed)),
                max: Duration::from_nanos(t.max_nanos.load(Ordering::Relaxed)),
            })
            .unwrap_or_default()
    }

    /// Number of samples recorded for a timing
    pub fn timing_count(&self, name: &str) -> u64 {
        self.timing_stats(name).count
    }

    /// Names of all counters, sorted
    pub fn counter_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.counters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Render everything in the Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str(
            "# HELP worker_counter_total Worker counters by name\n\
             # TYPE worker_counter_total counter\n",
        );
        for name in self.counter_names() {
            output.push_str(&format!(
                "worker_counter_total{{name=\"{}\"}} {}\n",
                escape_label(&name),
                self.counter_value(&name)
            ));
        }

        let mut timing_names: Vec<String> = self.timings.iter().map(|e| e.key().clone()).collect();
        timing_names.sort();
        output.push_str(
            "# HELP worker_timing_seconds Worker timings by name\n\
             # TYPE worker_timing_seconds summary\n",
        );
        for name in timing_names {
            let stats = self.timing_stats(&name);
            let label = escape_label(&name);
            output.push_str(&format!(
                "worker_timing_seconds_sum{{name=\"{}\"}} {}\n\
                 worker_timing_seconds_count{{name=\"{}\"}} {}\n",
                label,
                stats.total.as_secs_f64(),
                label,
                stats.count
            ));
        }

        output
    }
}

impl Metrics for InMemoryMetrics {
    fn counter(&self, name: &str, delta: i64) {
        if let Some(counter) = self.counters.get(name) {
            counter.fetch_add(delta, Ordering::Relaxed);
            return;
        }
        self.counters
            .entry(name.to_string())
            .or_default()
            .fetch_add(delta, Ordering::Relaxed);
    }

    fn timing(&self, name: &str, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        let entry = self.timings.entry(name.to_string()).or_default();
        entry.count.fetch_add(1, Ordering::Relaxed);
        entry.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        entry.max_nanos.fetch_max(nanos, Ordering::Relaxed);
    }
}

/// Metrics registered on a `prometheus::Registry`
#[cfg(feature = "metrics")]
#[derive(Clone)]
pub struct PrometheusMetrics {
    counters: prometheus::IntCounterVec,
    timings: prometheus::HistogramVec,
}

#[cfg(feature = "metrics")]
impl PrometheusMetrics {
    /// Create the collectors and register them on `registry`
    pub fn new(registry: &prometheus::Registry) -> prometheus::Result<Self> {
        let counters = prometheus::IntCounterVec::new(
            prometheus::Opts::new("worker_counter_total", "Worker counters by name"),
            &["name"],
        )?;
        let timings = prometheus::HistogramVec::new(
            prometheus::HistogramOpts::new("worker_timing_seconds", "Worker timings by name"),
            &["name"],
        )?;
        registry.register(Box::new(counters.clone()))?;
        registry.register(Box::new(timings.clone()))?;
        Ok(Self { counters, timings })
    }
}

#[cfg(feature = "metrics")]
impl Metrics for PrometheusMetrics {
    fn counter(&self, name: &str, delta: i64) {
        // Prometheus counters only go up
        if delta > 0 {
            self.counters.with_label_values(&[name]).inc_by(delta as u64);
        }
    }

    fn timing(&self, name: &str, duration: Duration) {
        self.timings
            .with_label_values(&[name])
            .observe(duration.as_secs_f64());
    }
}
