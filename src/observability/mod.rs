//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! monitor loops
//!     → metrics.rs (per-target gauge/counter store, facade counters)
//!     → server.rs (/metrics scrape, /healthz, /targets)
//!
//! all subsystems
//!     → tracing macros → logging.rs subscriber (stdout)
//! ```
//!
//! # Design Decisions
//! - Per-target series support deletion; facade metrics do not need it
//! - Scrapes render under a collection pass, deletions wait for it

pub mod logging;
pub mod metrics;
pub mod server;
