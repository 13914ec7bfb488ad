//! HTTP keep-alive idle timeout monitor.
//!
//! # Architecture Overview
//!
//! ```text
//!   config file ──▶ loader ──▶ ConfigResolver snapshot (ArcSwap)
//!        │                          ▲
//!        ▼                          │ resolve backends per tick
//!   watcher ──▶ Reconciler ──▶ Supervisor ──▶ MonitorLoop (one per target)
//!                                                  │
//!                                                  ▼
//!                                             Probe Engine ──▶ backend
//!                                                  │
//!                                                  ▼
//!                               KeepaliveMetrics ──▶ /metrics (axum)
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use keepalive_monitor::config::validation::validate_config;
use keepalive_monitor::config::watcher::ConfigWatcher;
use keepalive_monitor::config::{load_config, ConfigError, MonitorConfig};
use keepalive_monitor::discovery::{ClassPolicy, ConfigResolver, Reconciler};
use keepalive_monitor::lifecycle::{shutdown_signal, Shutdown};
use keepalive_monitor::monitor::{LoopSettings, Registry, Supervisor};
use keepalive_monitor::observability::metrics::{self, KeepaliveMetrics, MetricsError};
use keepalive_monitor::observability::server::{self, MetricsState};
use keepalive_monitor::observability::logging;
use keepalive_monitor::probe::KeepaliveProber;

/// Continuously measure the keep-alive idle timeout of configured backends.
#[derive(Debug, Parser)]
#[command(name = "keepalive-monitor", version)]
struct Cli {
    /// TOML configuration file; watched for changes.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// The address the metric endpoint binds to.
    #[arg(long)]
    metrics_addr: Option<String>,

    /// Measurement timeout, e.g. "61s", "5m" or "1m 30s".
    #[arg(long, value_parser = humantime::parse_duration)]
    idle_timeout: Option<std::time::Duration>,

    /// Do not monitor targets without an ingress class.
    #[arg(long)]
    skip_no_class: bool,

    /// Only monitor targets of this ingress class.
    #[arg(long)]
    ingress_class: Option<String>,
}

impl Cli {
    fn load(&self) -> Result<MonitorConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => MonitorConfig::default(),
        };
        self.apply_overrides(&mut config);
        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }

    fn apply_overrides(&self, config: &mut MonitorConfig) {
        if let Some(addr) = &self.metrics_addr {
            config.observability.metrics_address = addr.clone();
        }
        if let Some(timeout) = self.idle_timeout {
            config.probe.timeout_secs = timeout.as_secs_f64();
        }
        if self.skip_no_class {
            config.classes.default_class_qualifies = false;
        }
        if let Some(class) = &self.ingress_class {
            config.classes.ingress_class = class.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = cli.load()?;

    logging::init_logging(&config.observability.log_level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "keepalive-monitor starting");

    let recorder = metrics::init_recorder()?;
    let timeout = config.probe.timeout();
    let settings = LoopSettings::from(&config.probe);
    let policy = ClassPolicy::new(
        config.classes.default_class_qualifies,
        config.classes.ingress_class.clone(),
    );
    tracing::info!(
        timeout = ?timeout,
        jitter_factor = settings.jitter_factor,
        default_class_qualifies = policy.default_class_qualifies,
        ingress_class = ?policy.restrict_to,
        targets = config.targets.len(),
        "Configuration loaded"
    );

    let metrics_address = config.observability.metrics_address.clone();
    let initial_targets = config.target_specs();
    let resolver = Arc::new(ConfigResolver::new(config));
    let store = Arc::new(KeepaliveMetrics::new().map_err(MetricsError::from)?);
    let registry = Arc::new(Registry::new());
    let supervisor = Arc::new(Supervisor::new(
        registry.clone(),
        Arc::new(KeepaliveProber),
        store.clone(),
        settings,
    ));
    let reconciler = Reconciler::new(supervisor.clone(), policy, timeout, resolver.clone());

    let shutdown = Shutdown::new();

    let listener = TcpListener::bind(&metrics_address)
        .await
        .map_err(|source| MetricsError::Bind {
            address: metrics_address.clone(),
            source,
        })?;
    let state = MetricsState {
        store,
        registry,
        recorder: Some(recorder),
    };
    let metrics_server = tokio::spawn(server::serve(listener, state, shutdown.subscribe()));

    reconciler.apply(&initial_targets);

    // The watcher stops when dropped at the end of main.
    let (mut updates, _watcher) = match &cli.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            (Some(updates), Some(watcher.run()?))
        }
        None => (None, None),
    };

    let signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal.trigger();
    });

    loop {
        let next = async {
            match updates.as_mut() {
                Some(rx) => rx.recv().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = shutdown.triggered() => break,
            update = next => {
                let Some(mut update) = update else { break };
                cli.apply_overrides(&mut update);
                let specs = update.target_specs();
                tracing::info!(targets = specs.len(), "Applying reloaded configuration");
                resolver.store(update);
                reconciler.apply(&specs);
            }
        }
    }

    shutdown.trigger();
    supervisor.shutdown().await;
    if let Err(e) = metrics_server.await? {
        tracing::error!(error = %e, "Metrics server failed");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
