//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the monitor.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::discovery::target::{TargetId, TargetSpec, INGRESS_CLASS_ANNOTATION, OPT_OUT_ANNOTATION};

/// Root configuration for the keepalive monitor.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Probe timing.
    pub probe: ProbeConfig,

    /// Which targets qualify for monitoring.
    pub classes: ClassConfig,

    /// Logging and metrics endpoint.
    pub observability: ObservabilityConfig,

    /// Services that backend references resolve against.
    pub services: Vec<ServiceConfig>,

    /// Monitored targets.
    pub targets: Vec<TargetConfig>,
}

impl MonitorConfig {
    /// Discovery view of every configured target.
    pub fn target_specs(&self) -> Vec<TargetSpec> {
        self.targets.iter().map(TargetConfig::spec).collect()
    }

    pub fn find_target(&self, id: &TargetId) -> Option<&TargetConfig> {
        self.targets
            .iter()
            .find(|t| t.namespace == id.namespace && t.name == id.name)
    }

    pub fn find_service(&self, namespace: &str, name: &str) -> Option<&ServiceConfig> {
        self.services
            .iter()
            .find(|s| s.namespace == namespace && s.name == name)
    }
}

/// Longest accepted measurement or connect timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Largest accepted `jitter_factor`; a period is at most doubled.
pub const MAX_JITTER_FACTOR: f64 = 1.0;

/// Probe timing configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ProbeConfig {
    /// Idle read deadline and base tick period, in seconds.
    pub timeout_secs: f64,

    /// Random stretch applied to each tick period (0 = exact period).
    pub jitter_factor: f64,

    /// Connect/handshake timeout in seconds; 0 falls back to `timeout_secs`.
    pub connect_timeout_secs: f64,
}

impl ProbeConfig {
    /// Measurement timeout, capped at [`MAX_TIMEOUT`].
    pub fn timeout(&self) -> Duration {
        seconds(self.timeout_secs).unwrap_or(MAX_TIMEOUT)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        seconds(self.connect_timeout_secs).filter(|d| !d.is_zero())
    }
}

fn seconds(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok().map(|d| d.min(MAX_TIMEOUT))
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 61.0,
            jitter_factor: 0.0,
            connect_timeout_secs: 0.0,
        }
    }
}

/// Class filter configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ClassConfig {
    /// Monitor targets without any class.
    pub default_class_qualifies: bool,

    /// Restrict to this class; empty means no restriction.
    pub ingress_class: String,
}

impl Default for ClassConfig {
    fn default() -> Self {
        Self {
            default_class_qualifies: true,
            ingress_class: String::new(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// A service that backends point at.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServiceConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,

    pub name: String,

    /// Cluster IP; `"None"` or absent means headless (dial by DNS name).
    #[serde(default)]
    pub cluster_ip: Option<String>,

    #[serde(default)]
    pub ports: Vec<ServicePortConfig>,
}

/// One named port of a service.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServicePortConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub port: u16,
}

/// A monitored target and its routing rules.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TargetConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,

    pub name: String,

    /// Explicit class; takes precedence over the class annotation.
    #[serde(default)]
    pub ingress_class_name: Option<String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    /// Probe backends over TLS.
    #[serde(default)]
    pub tls: bool,

    /// The target is being deleted.
    #[serde(default)]
    pub deleted: bool,

    #[serde(default)]
    pub default_backend: Option<BackendRef>,

    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl TargetConfig {
    pub fn id(&self) -> TargetId {
        TargetId::new(self.namespace.clone(), self.name.clone())
    }

    pub fn spec(&self) -> TargetSpec {
        TargetSpec {
            id: self.id(),
            class_annotation: self.annotations.get(INGRESS_CLASS_ANNOTATION).cloned(),
            explicit_class: self.ingress_class_name.clone(),
            opt_out: self
                .annotations
                .get(OPT_OUT_ANNOTATION)
                .is_some_and(|v| v.eq_ignore_ascii_case("true")),
            deletion_requested: self.deleted,
        }
    }

    /// Every backend reference: the default backend first, then rule paths
    /// in declaration order.
    pub fn backend_refs(&self) -> impl Iterator<Item = &BackendRef> {
        self.default_backend
            .iter()
            .chain(self.rules.iter().flat_map(|r| r.paths.iter().map(|p| &p.backend)))
    }
}

/// A host rule with its paths.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RuleConfig {
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub paths: Vec<PathConfig>,
}

/// A path routed to a backend.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PathConfig {
    #[serde(default)]
    pub path: Option<String>,

    pub backend: BackendRef,
}

/// Reference from a target to a service port.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct BackendRef {
    /// Service name; a reference without one cannot be resolved.
    #[serde(default)]
    pub service: Option<String>,

    pub port: ServicePort,
}

impl BackendRef {
    pub fn new(service: impl Into<String>, port: ServicePort) -> Self {
        Self {
            service: Some(service.into()),
            port,
        }
    }

    /// Label identity, `service:port`.
    pub fn identity(&self) -> String {
        format!("{}:{}", self.service.as_deref().unwrap_or("<none>"), self.port)
    }
}

/// A service port, by number or by name.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum ServicePort {
    Number(u16),
    Name(String),
}

impl fmt::Display for ServicePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServicePort::Number(n) => write!(f, "{n}"),
            ServicePort::Name(name) => f.write_str(name),
        }
    }
}

fn default_namespace() -> String {
    "default".to_string()
}
