//! Reconciliation of target snapshots against the supervisor.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::discovery::resolver::BackendResolver;
use crate::discovery::target::{ClassPolicy, Qualification, TargetId, TargetSpec};
use crate::monitor::Supervisor;
use crate::probe::Prober;

/// Turns discovery events into supervisor calls.
pub struct Reconciler<P> {
    supervisor: Arc<Supervisor<P>>,
    policy: ClassPolicy,
    timeout: Duration,
    resolver: Arc<dyn BackendResolver>,
    known: Mutex<BTreeSet<TargetId>>,
}

impl<P: Prober> Reconciler<P> {
    pub fn new(
        supervisor: Arc<Supervisor<P>>,
        policy: ClassPolicy,
        timeout: Duration,
        resolver: Arc<dyn BackendResolver>,
    ) -> Self {
        Self {
            supervisor,
            policy,
            timeout,
            resolver,
            known: Mutex::new(BTreeSet::new()),
        }
    }

    /// Evaluate one target and start or stop its monitor.
    pub fn reconcile(&self, spec: &TargetSpec) -> Qualification {
        let verdict = self.policy.evaluate(spec);
        if verdict.qualifies() {
            self.known().insert(spec.id.clone());
            self.supervisor
                .on_target_qualifies(spec.id.clone(), self.timeout, self.resolver.clone());
        } else {
            self.known().remove(&spec.id);
            tracing::debug!(target_id = %spec.id, verdict = ?verdict, "Target does not qualify");
            self.supervisor.on_target_disqualifies(&spec.id);
        }
        verdict
    }

    /// Reconcile a full snapshot: every listed target is evaluated and every
    /// previously seen target missing from it is disqualified.
    pub fn apply(&self, specs: &[TargetSpec]) {
        let listed: BTreeSet<TargetId> = specs.iter().map(|s| s.id.clone()).collect();
        let vanished: Vec<TargetId> = self.known().difference(&listed).cloned().collect();

        for id in &vanished {
            self.known().remove(id);
            tracing::info!(target_id = %id, "Target removed");
            self.supervisor.on_target_disqualifies(id);
        }
        for spec in specs {
            self.reconcile(spec);
        }
    }

    fn known(&self) -> std::sync::MutexGuard<'_, BTreeSet<TargetId>> {
        self.known.lock().expect("reconciler mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::MonitorConfig;
    use crate::discovery::resolver::ConfigResolver;
    use crate::monitor::{LoopSettings, Registry};
    use crate::observability::metrics::KeepaliveMetrics;
    use crate::probe::KeepaliveProber;

    fn reconciler(policy: ClassPolicy) -> Reconciler<KeepaliveProber> {
        let supervisor = Supervisor::new(
            Arc::new(Registry::new()),
            Arc::new(KeepaliveProber),
            Arc::new(KeepaliveMetrics::new().unwrap()),
            LoopSettings::default(),
        );
        Reconciler::new(
            Arc::new(supervisor),
            policy,
            Duration::from_secs(60),
            Arc::new(ConfigResolver::new(MonitorConfig::default())),
        )
    }

    fn spec(name: &str, class: Option<&str>) -> TargetSpec {
        TargetSpec {
            explicit_class: class.map(str::to_string),
            ..TargetSpec::new(TargetId::new("default", name))
        }
    }

    #[tokio::test]
    async fn class_change_stops_monitor() {
        let rec = reconciler(ClassPolicy::new(false, "nginx"));
        let registry = rec.supervisor.registry().clone();

        assert!(rec.reconcile(&spec("web", Some("nginx"))).qualifies());
        assert!(registry.contains(&TargetId::new("default", "web")));

        let verdict = rec.reconcile(&spec("web", Some("traefik")));
        assert!(matches!(verdict, Qualification::ClassMismatch { .. }));
        assert!(registry.is_empty());
        rec.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn snapshot_drops_vanished_targets() {
        let rec = reconciler(ClassPolicy::new(true, ""));
        let registry = rec.supervisor.registry().clone();

        rec.apply(&[spec("a", None), spec("b", None), spec("c", None)]);
        assert_eq!(registry.len(), 3);

        let mut opted_out = spec("c", None);
        opted_out.opt_out = true;
        rec.apply(&[spec("a", None), opted_out]);
        assert_eq!(registry.targets(), vec![TargetId::new("default", "a")]);

        rec.apply(&[]);
        assert!(registry.is_empty());
        rec.supervisor.shutdown().await;
    }
}
