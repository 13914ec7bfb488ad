//! Monitoring subsystem.
//!
//! # Data Flow
//! ```text
//! Reconciler
//!     → supervisor.rs (registry: one handle per target)
//!         on qualify    → spawn runner.rs loop
//!         on disqualify → cancel loop → delete target series
//!
//! runner.rs, every jittered period (jitter.rs):
//!     resolve backends → probe all concurrently → publish unless cancelled
//! ```
//!
//! # Design Decisions
//! - The supervisor never touches sockets; loops never touch the registry
//! - Loops are parallel tasks, one per target
//! - Cancelled loops are awaited on shutdown, not aborted

pub mod jitter;
pub mod runner;
pub mod supervisor;

pub use runner::{resolve_backends, CancelSignal, LoopSettings, MonitorLoop, TickReport};
pub use supervisor::{MonitorHandle, Registry, Supervisor};
