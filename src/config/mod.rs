//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → MonitorConfig (validated, immutable)
//!     → ConfigResolver snapshot + Reconciler
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → atomic swap of the resolver snapshot
//!     → Reconciler applies the new target list
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Only services and targets follow reloads; probe, class and
//!   observability settings are fixed at startup

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::MonitorConfig;
pub use schema::ProbeConfig;
pub use schema::TargetConfig;
pub use schema::ServiceConfig;
pub use validation::ValidationError;
