//! Backend resolution.
//!
//! # Responsibilities
//! - List a target's backend references (default backend, then rule paths)
//! - Turn one reference into a dialable `host:port` plus its label identity
//!
//! # Design Decisions
//! - Resolution is a capability injected into each monitor loop, so tests
//!   can hand in a fake
//! - The config-backed resolver reads the latest snapshot on every call;
//!   a target re-pointed by a reload is picked up on its next tick

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::schema::{BackendRef, MonitorConfig, ServicePort};
use crate::discovery::target::TargetId;

/// A dialable backend of a target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Backend {
    /// `host:port` to dial.
    pub address: String,
    /// Label identity, `service:port`.
    pub identity: String,
    /// Probe over TLS.
    pub tls: bool,
}

/// Backend references of one target, in resolution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetBackends {
    pub default_backend: Option<BackendRef>,
    pub rule_backends: Vec<BackendRef>,
}

impl TargetBackends {
    pub fn iter(&self) -> impl Iterator<Item = &BackendRef> {
        self.default_backend.iter().chain(self.rule_backends.iter())
    }
}

/// Resolution failures. Both kinds are local to one tick or one backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("failed to resolve target {target}: {reason}")]
    Target { target: TargetId, reason: String },

    #[error("failed to resolve backend {backend}: {reason}")]
    Backend { backend: String, reason: String },
}

/// Source of backend addresses for targets.
pub trait BackendResolver: Send + Sync {
    /// List the backend references of `target`.
    fn backend_refs(&self, target: &TargetId) -> Result<TargetBackends, ResolveError>;

    /// Resolve one reference of `target` to a dialable backend.
    fn resolve_backend(&self, target: &TargetId, backend: &BackendRef) -> Result<Backend, ResolveError>;
}

/// Resolves against the current configuration snapshot.
#[derive(Debug)]
pub struct ConfigResolver {
    snapshot: ArcSwap<MonitorConfig>,
}

impl ConfigResolver {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(config),
        }
    }

    /// Replace the snapshot; in-flight ticks keep the one they loaded.
    pub fn store(&self, config: MonitorConfig) {
        self.snapshot.store(Arc::new(config));
    }
}

impl BackendResolver for ConfigResolver {
    fn backend_refs(&self, target: &TargetId) -> Result<TargetBackends, ResolveError> {
        let config = self.snapshot.load();
        let found = config.find_target(target).ok_or_else(|| ResolveError::Target {
            target: target.clone(),
            reason: "target not found".to_string(),
        })?;

        Ok(TargetBackends {
            default_backend: found.default_backend.clone(),
            rule_backends: found
                .rules
                .iter()
                .flat_map(|r| r.paths.iter().map(|p| p.backend.clone()))
                .collect(),
        })
    }

    fn resolve_backend(&self, target: &TargetId, backend: &BackendRef) -> Result<Backend, ResolveError> {
        let config = self.snapshot.load();
        let fail = |reason: String| ResolveError::Backend {
            backend: backend.identity(),
            reason,
        };

        let service_name = backend
            .service
            .as_deref()
            .ok_or_else(|| fail("backend does not contain a service reference".to_string()))?;
        let service = config
            .find_service(&target.namespace, service_name)
            .ok_or_else(|| fail(format!("service {}/{} not found", target.namespace, service_name)))?;

        let host = match service.cluster_ip.as_deref() {
            Some(ip) if !ip.is_empty() && ip != "None" => ip.to_string(),
            _ => format!("{}.{}.svc.cluster.local", service.name, service.namespace),
        };

        let port = match &backend.port {
            ServicePort::Number(n) if *n > 0 => *n,
            ServicePort::Number(_) => return Err(fail("port number must be non-zero".to_string())),
            ServicePort::Name(name) => service
                .ports
                .iter()
                .find(|p| p.name.as_deref() == Some(name.as_str()))
                .map(|p| p.port)
                .ok_or_else(|| fail(format!("port {name} not found on service")))?,
        };

        let tls = config.find_target(target).is_some_and(|t| t.tls);

        Ok(Backend {
            address: join_host_port(&host, port),
            identity: backend.identity(),
            tls,
        })
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MonitorConfig {
        toml::from_str(
            r#"
[[services]]
name = "web"
cluster_ip = "10.0.0.5"
ports = [{ name = "http", port = 8080 }]

[[services]]
name = "headless"
cluster_ip = "None"
ports = [{ port = 9000 }]

[[services]]
name = "v6"
cluster_ip = "fd00::1"

[[targets]]
name = "web"
tls = true
default_backend = { service = "web", port = 8080 }

[[targets.rules]]
paths = [
  { backend = { service = "web", port = "http" } },
  { backend = { service = "headless", port = 9000 } },
  { backend = { service = "missing", port = 80 } },
]
"#,
        )
        .unwrap()
    }

    fn web() -> TargetId {
        TargetId::new("default", "web")
    }

    #[test]
    fn lists_default_backend_first() {
        let resolver = ConfigResolver::new(config());
        let refs = resolver.backend_refs(&web()).unwrap();
        let ids: Vec<String> = refs.iter().map(BackendRef::identity).collect();
        assert_eq!(ids, vec!["web:8080", "web:http", "headless:9000", "missing:80"]);
    }

    #[test]
    fn unknown_target_is_a_target_error() {
        let resolver = ConfigResolver::new(config());
        let err = resolver.backend_refs(&TargetId::new("default", "gone")).unwrap_err();
        assert!(matches!(err, ResolveError::Target { .. }));
    }

    #[test]
    fn resolves_cluster_ip_and_named_ports() {
        let resolver = ConfigResolver::new(config());
        let by_number = resolver
            .resolve_backend(&web(), &BackendRef::new("web", ServicePort::Number(8080)))
            .unwrap();
        let by_name = resolver
            .resolve_backend(&web(), &BackendRef::new("web", ServicePort::Name("http".into())))
            .unwrap();
        assert_eq!(by_number.address, "10.0.0.5:8080");
        assert_eq!(by_name.address, "10.0.0.5:8080");
        assert_eq!(by_number.identity, "web:8080");
        assert_eq!(by_name.identity, "web:http");
        assert!(by_name.tls);
    }

    #[test]
    fn headless_and_ipv6_hosts() {
        let resolver = ConfigResolver::new(config());
        let headless = resolver
            .resolve_backend(&web(), &BackendRef::new("headless", ServicePort::Number(9000)))
            .unwrap();
        assert_eq!(headless.address, "headless.default.svc.cluster.local:9000");
        let v6 = resolver
            .resolve_backend(&web(), &BackendRef::new("v6", ServicePort::Number(443)))
            .unwrap();
        assert_eq!(v6.address, "[fd00::1]:443");
    }

    #[test]
    fn backend_failures_are_backend_errors() {
        let resolver = ConfigResolver::new(config());
        for backend in [
            BackendRef::new("missing", ServicePort::Number(80)),
            BackendRef::new("web", ServicePort::Name("grpc".into())),
            BackendRef::new("web", ServicePort::Number(0)),
            BackendRef {
                service: None,
                port: ServicePort::Number(80),
            },
        ] {
            let err = resolver.resolve_backend(&web(), &backend).unwrap_err();
            assert!(matches!(err, ResolveError::Backend { .. }), "{err}");
        }
    }

    #[test]
    fn store_repoints_backends() {
        let resolver = ConfigResolver::new(config());
        let mut updated = config();
        updated.services[0].cluster_ip = Some("10.0.0.9".into());
        resolver.store(updated);
        let backend = resolver
            .resolve_backend(&web(), &BackendRef::new("web", ServicePort::Number(8080)))
            .unwrap();
        assert_eq!(backend.address, "10.0.0.9:8080");
    }
}
