//! Probe engine.
//!
//! # Data Flow
//! ```text
//! measure(address, timeout, tls)
//!     → engine.rs (dial TCP, optional TLS via tls.rs)
//!     → http1.rs (write GET /, parse one response, drain body)
//!     → engine.rs (deadline-gated one byte read on the idle connection)
//!     → Measurement { elapsed, outcome } | ProbeError
//! ```
//!
//! # Design Decisions
//! - One connection per call, never shared or reused
//! - No concurrency of its own; callers fan out
//! - Errors are terminal for the call only (see error.rs)

pub mod engine;
pub mod error;
pub mod http1;
pub mod tls;

pub use engine::{measure, measure_target, IdleOutcome, KeepaliveProber, Measurement, ProbeResult, ProbeTarget, Prober};
pub use error::ProbeError;
