//! Target discovery subsystem.
//!
//! # Data Flow
//! ```text
//! config snapshot (initial load or reload)
//!     → target.rs (TargetSpec per target, ClassPolicy verdict)
//!     → reconcile.rs (qualify / disqualify, drop vanished targets)
//!     → monitor::Supervisor
//!
//! monitor loop tick
//!     → resolver.rs (backend refs → dialable addresses)
//! ```
//!
//! # Design Decisions
//! - Discovery is snapshot based: every reload is a full target list
//! - Backends are resolved per tick, so a re-pointed target keeps its loop

pub mod reconcile;
pub mod resolver;
pub mod target;

pub use reconcile::Reconciler;
pub use resolver::{Backend, BackendResolver, ConfigResolver, ResolveError, TargetBackends};
pub use target::{ClassPolicy, Qualification, TargetId, TargetSpec};
