//! HTTP keep-alive idle timeout monitor library.

pub mod config;
pub mod discovery;
pub mod lifecycle;
pub mod monitor;
pub mod observability;
pub mod probe;

pub use config::MonitorConfig;
pub use lifecycle::Shutdown;
pub use monitor::Supervisor;
pub use probe::measure;
