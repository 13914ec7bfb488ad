//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Hold the per-target series (`http_keepalive_idle_timeout_seconds`,
//!   `http_keepalive_errors_total`) in a `prometheus` registry that supports
//!   deleting series
//! - Render those series in Prometheus text format
//! - Install the `metrics` facade recorder for process level counters
//!
//! # Metrics
//! - `http_keepalive_idle_timeout_seconds` (gauge): last measurement, -1 on failure
//! - `http_keepalive_errors_total` (counter): failed measurements
//! - `keepalive_probes_total` (counter, facade): measurements by outcome
//! - `keepalive_probe_duration_seconds` (histogram, facade): idle wait duration
//! - `keepalive_monitors_active` (gauge, facade): registered monitor loops
//!
//! # Design Decisions
//! - The facade recorder cannot forget a label set, so per-target series live
//!   in a `GaugeVec` / `IntCounterVec` pair owned by [`KeepaliveMetrics`]
//! - Deletion is two-phase: a delete that arrives while a collection pass is
//!   running is queued and applied when the last pass finishes
//! - Every write is stamped; a queued delete only removes series last written
//!   before it was queued, so a target that qualifies again during a scrape
//!   keeps the series its new loop writes

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use prometheus::proto::{Metric, MetricFamily};
use prometheus::{GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};

use crate::discovery::TargetId;

pub const IDLE_TIMEOUT_METRIC: &str = "http_keepalive_idle_timeout_seconds";
pub const ERRORS_METRIC: &str = "http_keepalive_errors_total";

const LABEL_NAMES: [&str; 3] = ["namespace", "target", "backend"];

/// Gauge value written when a measurement fails.
pub const FAILURE_SENTINEL: f64 = -1.0;

/// Label set of one per-backend series.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesLabels {
    pub namespace: String,
    pub target: String,
    pub backend: String,
}

impl SeriesLabels {
    pub fn new(target: &TargetId, backend: impl Into<String>) -> Self {
        Self {
            namespace: target.namespace.clone(),
            target: target.name.clone(),
            backend: backend.into(),
        }
    }

    /// Label values in [`LABEL_NAMES`] order.
    fn values(&self) -> [&str; 3] {
        [&self.namespace, &self.target, &self.backend]
    }

    fn from_metric(metric: &Metric) -> Self {
        let mut labels = Self::default();
        for pair in metric.get_label() {
            let slot = match pair.get_name() {
                "namespace" => &mut labels.namespace,
                "target" => &mut labels.target,
                "backend" => &mut labels.backend,
                _ => continue,
            };
            *slot = pair.get_value().to_string();
        }
        labels
    }
}

/// Predicate over series labels; unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelMatcher {
    pub namespace: Option<String>,
    pub target: Option<String>,
    pub backend: Option<String>,
}

impl LabelMatcher {
    /// Matches every series belonging to `target`.
    pub fn target(target: &TargetId) -> Self {
        Self {
            namespace: Some(target.namespace.clone()),
            target: Some(target.name.clone()),
            backend: None,
        }
    }

    pub fn matches(&self, labels: &SeriesLabels) -> bool {
        fn field(want: &Option<String>, have: &str) -> bool {
            want.as_deref().map_or(true, |w| w == have)
        }
        field(&self.namespace, &labels.namespace)
            && field(&self.target, &labels.target)
            && field(&self.backend, &labels.backend)
    }
}

/// Destination for per-backend measurements.
///
/// Implementations must be internally synchronized; callers add no locking.
pub trait MetricSink: Send + Sync {
    /// Set the idle timeout gauge for `labels`.
    fn set_gauge(&self, labels: &SeriesLabels, value: f64);

    /// Increment the error counter for `labels`.
    fn increment_counter(&self, labels: &SeriesLabels);

    /// Remove every gauge and counter series matched by `matcher`.
    fn delete_series(&self, matcher: &LabelMatcher);
}

/// A series visited during collection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SeriesValue {
    Gauge(f64),
    Counter(u64),
}

/// Live label sets and the stamp of their last write.
#[derive(Debug, Default)]
struct SeriesIndex {
    stamp: u64,
    written: BTreeMap<SeriesLabels, u64>,
}

impl SeriesIndex {
    fn touch(&mut self, labels: &SeriesLabels) {
        self.stamp += 1;
        self.written.insert(labels.clone(), self.stamp);
    }
}

#[derive(Debug, Default)]
struct CollectionState {
    active: usize,
    deferred: Vec<(LabelMatcher, u64)>,
}

/// Registry of the per-target series.
pub struct KeepaliveMetrics {
    registry: Registry,
    idle_timeout: GaugeVec,
    errors: IntCounterVec,
    index: Mutex<SeriesIndex>,
    collection: Mutex<CollectionState>,
}

impl KeepaliveMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let idle_timeout = GaugeVec::new(
            Opts::new(IDLE_TIMEOUT_METRIC, "the idle timeout measured for http keepalive connections"),
            &LABEL_NAMES,
        )?;
        let errors = IntCounterVec::new(
            Opts::new(ERRORS_METRIC, "errors that happened while measuring the timeout"),
            &LABEL_NAMES,
        )?;

        let registry = Registry::new();
        registry.register(Box::new(idle_timeout.clone()))?;
        registry.register(Box::new(errors.clone()))?;

        Ok(Self {
            registry,
            idle_timeout,
            errors,
            index: Mutex::new(SeriesIndex::default()),
            collection: Mutex::new(CollectionState::default()),
        })
    }

    /// Current gauge value for `labels`.
    pub fn idle_timeout(&self, labels: &SeriesLabels) -> Option<f64> {
        let families = self.registry.gather();
        find_series(&families, IDLE_TIMEOUT_METRIC, labels).map(|m| m.get_gauge().get_value())
    }

    /// Current counter value for `labels`.
    pub fn errors(&self, labels: &SeriesLabels) -> Option<u64> {
        let families = self.registry.gather();
        find_series(&families, ERRORS_METRIC, labels).map(|m| m.get_counter().get_value() as u64)
    }

    /// Number of live series across both families.
    pub fn series_count(&self) -> usize {
        self.registry.gather().iter().map(|f| f.get_metric().len()).sum()
    }

    /// Number of deletions queued behind a running collection.
    pub fn pending_deletions(&self) -> usize {
        self.collection().deferred.len()
    }

    /// Visit every series. Deletions requested while the visitor runs,
    /// including from the visitor itself, take effect after it returns.
    pub fn collect<F>(&self, mut visit: F)
    where
        F: FnMut(&str, &SeriesLabels, SeriesValue),
    {
        let _pass = self.begin_pass();

        for family in self.registry.gather() {
            for metric in family.get_metric() {
                let value = if family.get_name() == IDLE_TIMEOUT_METRIC {
                    SeriesValue::Gauge(metric.get_gauge().get_value())
                } else {
                    SeriesValue::Counter(metric.get_counter().get_value() as u64)
                };
                visit(family.get_name(), &SeriesLabels::from_metric(metric), value);
            }
        }
    }

    /// Render all series in Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let _pass = self.begin_pass();

        let families = self.registry.gather();
        let mut out = String::new();
        TextEncoder::new().encode_utf8(&families, &mut out)?;
        Ok(out)
    }

    fn begin_pass(&self) -> CollectionPass<'_> {
        self.collection().active += 1;
        CollectionPass { store: self }
    }

    /// Remove series matched by `matcher` whose last write is not newer than `upto`.
    fn remove(&self, matcher: &LabelMatcher, upto: u64) -> usize {
        let mut index = self.index();
        let doomed: Vec<SeriesLabels> = index
            .written
            .iter()
            .filter(|(labels, stamp)| **stamp <= upto && matcher.matches(labels))
            .map(|(labels, _)| labels.clone())
            .collect();

        let mut removed = 0;
        for labels in &doomed {
            index.written.remove(labels);
            let values = labels.values();
            // a backend that never failed has no counter series
            removed += usize::from(self.idle_timeout.remove_label_values(&values).is_ok());
            removed += usize::from(self.errors.remove_label_values(&values).is_ok());
        }
        removed
    }

    fn index(&self) -> std::sync::MutexGuard<'_, SeriesIndex> {
        self.index.lock().expect("metrics index mutex poisoned")
    }

    fn collection(&self) -> std::sync::MutexGuard<'_, CollectionState> {
        self.collection.lock().expect("metrics collection mutex poisoned")
    }
}

impl MetricSink for KeepaliveMetrics {
    fn set_gauge(&self, labels: &SeriesLabels, value: f64) {
        let mut index = self.index();
        index.touch(labels);
        self.idle_timeout.with_label_values(&labels.values()).set(value);
    }

    fn increment_counter(&self, labels: &SeriesLabels) {
        let mut index = self.index();
        index.touch(labels);
        self.errors.with_label_values(&labels.values()).inc();
    }

    fn delete_series(&self, matcher: &LabelMatcher) {
        {
            let mut collection = self.collection();
            if collection.active > 0 {
                let upto = self.index().stamp;
                tracing::debug!(?matcher, upto, "Collection in progress, deferring series deletion");
                collection.deferred.push((matcher.clone(), upto));
                return;
            }
        }
        let removed = self.remove(matcher, u64::MAX);
        tracing::debug!(?matcher, removed, "Deleted metric series");
    }
}

/// Ends a collection pass; the last pass out applies queued deletions.
struct CollectionPass<'a> {
    store: &'a KeepaliveMetrics,
}

impl Drop for CollectionPass<'_> {
    fn drop(&mut self) {
        let deferred = {
            let mut collection = self.store.collection();
            collection.active -= 1;
            if collection.active > 0 {
                return;
            }
            std::mem::take(&mut collection.deferred)
        };
        for (matcher, upto) in &deferred {
            let removed = self.store.remove(matcher, *upto);
            tracing::debug!(?matcher, removed, "Applied deferred series deletion");
        }
    }
}

fn find_series<'a>(families: &'a [MetricFamily], name: &str, labels: &SeriesLabels) -> Option<&'a Metric> {
    families
        .iter()
        .filter(|f| f.get_name() == name)
        .flat_map(|f| f.get_metric())
        .find(|m| SeriesLabels::from_metric(m) == *labels)
}

// --- Facade metrics ---

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Errors that can occur during metrics setup.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to install metrics recorder: {0}")]
    SetupFailed(String),

    #[error("failed to register series: {0}")]
    Registry(#[from] prometheus::Error),

    #[error("failed to bind metrics endpoint {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

/// Install the Prometheus recorder behind the `metrics` facade. Subsequent
/// calls return the existing handle.
pub fn init_recorder() -> Result<PrometheusHandle, MetricsError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| MetricsError::SetupFailed(e.to_string()))?;
    describe_metrics();

    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

fn describe_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    describe_counter!("keepalive_probes_total", "Probes performed, by outcome");
    describe_histogram!(
        "keepalive_probe_duration_seconds",
        "Time spent waiting on the idle connection"
    );
    describe_gauge!("keepalive_monitors_active", "Registered monitor loops");
}

/// Record one finished probe.
pub fn record_probe(outcome: &'static str, elapsed: Duration) {
    counter!("keepalive_probes_total", "outcome" => outcome).increment(1);
    histogram!("keepalive_probe_duration_seconds").record(elapsed.as_secs_f64());
}

/// Record the number of registered monitor loops.
pub fn record_monitors_active(count: usize) {
    gauge!("keepalive_monitors_active").set(count as f64);
}
