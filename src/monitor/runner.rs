//! Per-target monitor loop.
//!
//! # Responsibilities
//! - Tick on a jittered period equal to the probe timeout
//! - Resolve the target's backends afresh on every tick
//! - Probe every backend concurrently and publish one sample per backend
//! - Stop scheduling ticks once cancelled, and drop results of probes that
//!   finish after cancellation
//!
//! # Design Decisions
//! - Cancellation is cooperative: an in-flight probe is never aborted, its
//!   socket closes on its own schedule and only its result is discarded
//! - The cancelled check and the metric write happen under one lock shared
//!   with the cancelling side, so no write can land after `cancel` returns

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::schema::ProbeConfig;
use crate::discovery::resolver::{Backend, BackendResolver, ResolveError};
use crate::discovery::target::TargetId;
use crate::monitor::jitter;
use crate::observability::metrics::{self, MetricSink, SeriesLabels, FAILURE_SENTINEL};
use crate::probe::{IdleOutcome, ProbeResult, ProbeTarget, Prober};

/// Loop tuning shared by every monitor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopSettings {
    /// Maximum random stretch of each tick period.
    pub jitter_factor: f64,
    /// Connect/handshake bound; `None` uses the probe timeout.
    pub connect_timeout: Option<Duration>,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            jitter_factor: 0.0,
            connect_timeout: None,
        }
    }
}

impl From<&ProbeConfig> for LoopSettings {
    fn from(config: &ProbeConfig) -> Self {
        Self {
            jitter_factor: config.jitter_factor,
            connect_timeout: config.connect_timeout(),
        }
    }
}

/// Cancellation shared between a monitor loop and its handle.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    cancelled: Arc<Mutex<bool>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the loop. Waits for a publish that is already underway; once
    /// this returns no further metric write happens. Idempotent.
    pub fn cancel(&self) {
        let mut cancelled = self.cancelled.lock().expect("cancel signal mutex poisoned");
        *cancelled = true;
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Run `publish` unless cancellation already happened.
    pub fn publish_unless_cancelled<R>(&self, publish: impl FnOnce() -> R) -> Option<R> {
        let cancelled = self.cancelled.lock().expect("cancel signal mutex poisoned");
        if *cancelled {
            return None;
        }
        Some(publish())
    }
}

/// Counts of what one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub probed: usize,
    pub recorded: usize,
    pub failed: usize,
    pub discarded: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Published {
    Recorded,
    Failed,
    Discarded,
}

/// The perpetual probe loop for one target.
pub struct MonitorLoop<P> {
    target: TargetId,
    timeout: Duration,
    settings: LoopSettings,
    resolver: Arc<dyn BackendResolver>,
    prober: Arc<P>,
    sink: Arc<dyn MetricSink>,
    cancel: CancelSignal,
}

impl<P: Prober> MonitorLoop<P> {
    pub fn new(
        target: TargetId,
        timeout: Duration,
        settings: LoopSettings,
        resolver: Arc<dyn BackendResolver>,
        prober: Arc<P>,
        sink: Arc<dyn MetricSink>,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            target,
            timeout,
            settings,
            resolver,
            prober,
            sink,
            cancel,
        }
    }

    /// Tick until cancelled. The first tick runs immediately; each period is
    /// measured from the start of the previous tick.
    pub async fn run(self) {
        tracing::info!(target_id = %self.target, timeout = ?self.timeout, "Monitor starting");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let tick_start = Instant::now();
            let period = jitter::jittered(self.timeout, self.settings.jitter_factor);

            let report = self.tick().await;
            tracing::debug!(
                target_id = %self.target,
                probed = report.probed,
                recorded = report.recorded,
                failed = report.failed,
                discarded = report.discarded,
                "Tick finished"
            );

            // A period too long to schedule only ends on cancellation.
            let next_tick = tick_start.checked_add(period);
            let wait = async {
                match next_tick {
                    Some(at) => time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = wait => {}
            }
        }

        tracing::info!(target_id = %self.target, "Monitor stopped");
    }

    /// One probe-and-publish cycle over the current backend set.
    pub async fn tick(&self) -> TickReport {
        let backends = match resolve_backends(self.resolver.as_ref(), &self.target) {
            Ok(backends) => backends,
            Err(e) => {
                tracing::warn!(target_id = %self.target, error = %e, "Failed to probe");
                return TickReport::default();
            }
        };
        if backends.is_empty() {
            tracing::debug!(target_id = %self.target, "No backends resolved");
            return TickReport::default();
        }
        if self.cancel.is_cancelled() {
            return TickReport::default();
        }

        let outcomes = join_all(backends.iter().map(|b| self.probe_and_publish(b))).await;

        let mut report = TickReport {
            probed: outcomes.len(),
            ..TickReport::default()
        };
        for outcome in outcomes {
            match outcome {
                Published::Recorded => report.recorded += 1,
                Published::Failed => report.failed += 1,
                Published::Discarded => report.discarded += 1,
            }
        }
        report
    }

    async fn probe_and_publish(&self, backend: &Backend) -> Published {
        let probe_target = ProbeTarget::new(backend.address.clone(), backend.tls)
            .with_connect_timeout(self.settings.connect_timeout);
        let result = self.prober.probe(probe_target, self.timeout).await;

        let labels = SeriesLabels::new(&self.target, backend.identity.clone());
        let published = self
            .cancel
            .publish_unless_cancelled(|| self.publish(&labels, &result))
            .unwrap_or(Published::Discarded);

        match (&result, published) {
            (_, Published::Discarded) => {
                tracing::debug!(
                    target_id = %self.target,
                    backend = %backend.identity,
                    "Monitor cancelled, discarding probe result"
                );
            }
            (Ok(m), _) => {
                metrics::record_probe(outcome_label(m.outcome), m.elapsed);
                tracing::info!(
                    target_id = %self.target,
                    backend = %backend.identity,
                    address = %backend.address,
                    idle_timeout_secs = m.elapsed.as_secs_f64(),
                    outcome = ?m.outcome,
                    "Probed keepalive timeout"
                );
            }
            (Err(e), _) => {
                metrics::record_probe(e.kind(), e.elapsed());
                tracing::warn!(
                    target_id = %self.target,
                    backend = %backend.identity,
                    address = %backend.address,
                    error = %e,
                    "Probing keepalive timeout failed"
                );
            }
        }
        published
    }

    fn publish(&self, labels: &SeriesLabels, result: &ProbeResult) -> Published {
        match result {
            Ok(m) => {
                self.sink.set_gauge(labels, m.elapsed.as_secs_f64());
                Published::Recorded
            }
            Err(_) => {
                self.sink.increment_counter(labels);
                self.sink.set_gauge(labels, FAILURE_SENTINEL);
                Published::Failed
            }
        }
    }
}

fn outcome_label(outcome: IdleOutcome) -> &'static str {
    match outcome {
        IdleOutcome::ClosedByPeer => "closed",
        IdleOutcome::DeadlineElapsed => "timed_out",
        IdleOutcome::KeepAliveDisabled => "keepalive_disabled",
        IdleOutcome::DataReceived => "data_received",
    }
}

/// Resolve every backend of `target`, skipping backends that fail to
/// resolve. Pairs that share both address and identity are probed once;
/// distinct identities on the same address each keep their own series.
pub fn resolve_backends(resolver: &dyn BackendResolver, target: &TargetId) -> Result<Vec<Backend>, ResolveError> {
    let refs = resolver.backend_refs(target)?;

    let mut seen = BTreeSet::new();
    let mut backends = Vec::new();
    for backend_ref in refs.iter() {
        match resolver.resolve_backend(target, backend_ref) {
            Ok(backend) => {
                if seen.insert((backend.address.clone(), backend.identity.clone())) {
                    backends.push(backend);
                }
            }
            Err(e) => {
                tracing::warn!(target_id = %target, error = %e, "Failed to resolve backend");
            }
        }
    }
    Ok(backends)
}
