//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (backends reference existing services)
//! - Validate value ranges (timeouts > 0, ports non-zero)
//! - Detect duplicate targets and services
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: MonitorConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::config::schema::{BackendRef, MonitorConfig, ServicePort, MAX_JITTER_FACTOR, MAX_TIMEOUT};

/// One semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Validate a parsed configuration, collecting every error.
pub fn validate_config(config: &MonitorConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let probe = &config.probe;
    check_seconds(&mut errors, "probe.timeout_secs", probe.timeout_secs, false);
    if !(0.0..=MAX_JITTER_FACTOR).contains(&probe.jitter_factor) {
        errors.push(ValidationError::new(
            "probe.jitter_factor",
            format!("must be between 0 and {MAX_JITTER_FACTOR}"),
        ));
    }
    check_seconds(&mut errors, "probe.connect_timeout_secs", probe.connect_timeout_secs, true);

    if config.observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    let mut services = HashSet::new();
    for (i, service) in config.services.iter().enumerate() {
        let field = format!("services[{i}]");
        if service.name.is_empty() {
            errors.push(ValidationError::new(format!("{field}.name"), "must not be empty"));
        }
        if !services.insert((service.namespace.as_str(), service.name.as_str())) {
            errors.push(ValidationError::new(
                field.clone(),
                format!("duplicate service {}/{}", service.namespace, service.name),
            ));
        }
        for (j, port) in service.ports.iter().enumerate() {
            if port.port == 0 {
                errors.push(ValidationError::new(format!("{field}.ports[{j}].port"), "must be non-zero"));
            }
        }
    }

    let mut targets = HashSet::new();
    for (i, target) in config.targets.iter().enumerate() {
        let field = format!("targets[{i}]");
        if target.name.is_empty() {
            errors.push(ValidationError::new(format!("{field}.name"), "must not be empty"));
        }
        if !targets.insert((target.namespace.as_str(), target.name.as_str())) {
            errors.push(ValidationError::new(
                field.clone(),
                format!("duplicate target {}/{}", target.namespace, target.name),
            ));
        }
        for backend in target.backend_refs() {
            check_backend(&field, backend, &mut errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_backend(field: &str, backend: &BackendRef, errors: &mut Vec<ValidationError>) {
    let identity = backend.identity();
    if backend.service.as_deref().map_or(true, str::is_empty) {
        errors.push(ValidationError::new(
            field,
            format!("backend {identity} does not name a service"),
        ));
    }
    match &backend.port {
        ServicePort::Number(0) => {
            errors.push(ValidationError::new(field, format!("backend {identity} has port 0")));
        }
        ServicePort::Name(name) if name.is_empty() => {
            errors.push(ValidationError::new(field, format!("backend {identity} has an empty port name")));
        }
        _ => {}
    }
}

/// A timeout must convert to a `Duration` and stay within [`MAX_TIMEOUT`].
fn check_seconds(errors: &mut Vec<ValidationError>, field: &str, secs: f64, allow_zero: bool) {
    match Duration::try_from_secs_f64(secs) {
        Ok(d) if d.is_zero() && !allow_zero => {
            errors.push(ValidationError::new(field, "must be a positive number"));
        }
        Ok(d) if d > MAX_TIMEOUT => {
            errors.push(ValidationError::new(
                field,
                format!("must not exceed {}s", MAX_TIMEOUT.as_secs()),
            ));
        }
        Ok(_) => {}
        Err(e) => errors.push(ValidationError::new(field, format!("not a valid duration: {e}"))),
    }
}
