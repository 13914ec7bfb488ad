//! Target supervisor and its registry of running monitor loops.
//!
//! # Locking
//! The registry mutex is held for the whole critical section of each
//! operation: the presence check, insert or remove, and on removal the
//! cancellation and series deletion too. A qualify that races a
//! disqualify for the same target therefore observes either no entry or
//! a fully torn down one, never a half-removed loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::discovery::resolver::BackendResolver;
use crate::discovery::target::TargetId;
use crate::monitor::runner::{CancelSignal, LoopSettings, MonitorLoop};
use crate::observability::metrics::{self, LabelMatcher, MetricSink};
use crate::probe::Prober;

/// Cancellation capability for one running monitor loop.
#[derive(Debug)]
pub struct MonitorHandle {
    cancel: CancelSignal,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Cancel the loop and hand back its task so the caller may await it.
    fn retire(self) -> JoinHandle<()> {
        self.cancel.cancel();
        self.task
    }
}

/// Target identity to monitor handle, behind one lock.
#[derive(Debug, Default)]
pub struct Registry {
    monitors: Mutex<HashMap<TargetId, MonitorHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, target: &TargetId) -> bool {
        self.lock().contains_key(target)
    }

    /// Registered targets, sorted.
    pub fn targets(&self) -> Vec<TargetId> {
        let mut targets: Vec<TargetId> = self.lock().keys().cloned().collect();
        targets.sort();
        targets
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TargetId, MonitorHandle>> {
        self.monitors.lock().expect("registry mutex poisoned")
    }
}

/// Keeps exactly one monitor loop per qualifying target.
pub struct Supervisor<P> {
    registry: Arc<Registry>,
    prober: Arc<P>,
    sink: Arc<dyn MetricSink>,
    settings: LoopSettings,
    draining: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: Prober> Supervisor<P> {
    pub fn new(registry: Arc<Registry>, prober: Arc<P>, sink: Arc<dyn MetricSink>, settings: LoopSettings) -> Self {
        Self {
            registry,
            prober,
            sink,
            settings,
            draining: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Start a monitor loop for `target` unless one is already registered.
    ///
    /// Returns `true` when a new loop was started. Must be called from
    /// within a Tokio runtime.
    pub fn on_target_qualifies(&self, target: TargetId, timeout: Duration, resolver: Arc<dyn BackendResolver>) -> bool {
        let mut monitors = self.registry.lock();
        if monitors.contains_key(&target) {
            return false;
        }

        let cancel = CancelSignal::new();
        let monitor = MonitorLoop::new(
            target.clone(),
            timeout,
            self.settings,
            resolver,
            self.prober.clone(),
            self.sink.clone(),
            cancel.clone(),
        );
        let task = tokio::spawn(monitor.run());
        monitors.insert(target.clone(), MonitorHandle { cancel, task });
        let active = monitors.len();
        drop(monitors);

        metrics::record_monitors_active(active);
        tracing::info!(target_id = %target, timeout = ?timeout, "Monitor registered");
        true
    }

    /// Stop monitoring `target` and delete its series.
    ///
    /// Series are deleted even when no loop was registered, so a target
    /// disqualified across a restart leaves nothing behind. Returns `true`
    /// when a running loop was cancelled.
    pub fn on_target_disqualifies(&self, target: &TargetId) -> bool {
        let mut monitors = self.registry.lock();
        let retired = monitors.remove(target).map(MonitorHandle::retire);
        self.sink.delete_series(&LabelMatcher::target(target));
        let active = monitors.len();
        drop(monitors);

        let Some(task) = retired else {
            return false;
        };
        self.draining().push(task);
        metrics::record_monitors_active(active);
        tracing::info!(target_id = %target, "Monitor deregistered");
        true
    }

    /// Cancel every registered loop and wait for all loop tasks to exit.
    pub async fn shutdown(&self) {
        let retired: Vec<JoinHandle<()>> = {
            let mut monitors = self.registry.lock();
            let mut retired: Vec<JoinHandle<()>> = monitors.drain().map(|(_, h)| h.retire()).collect();
            retired.append(&mut self.draining());
            retired
        };
        metrics::record_monitors_active(0);
        tracing::info!(monitors = retired.len(), "Stopping monitors");

        for task in retired {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Monitor task ended abnormally");
            }
        }
    }

    fn draining(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        let mut draining = self.draining.lock().expect("draining mutex poisoned");
        draining.retain(|task| !task.is_finished());
        draining
    }
}
