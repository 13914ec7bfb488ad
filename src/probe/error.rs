//! Probe error taxonomy.

use std::io;
use std::time::Duration;

/// A terminal failure of one `measure` call.
///
/// Every variant is local to the probe that produced it: the monitor loop
/// records it as an error sample and moves on to the next tick.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// The address or TLS server name cannot be used to dial.
    #[error("invalid probe target {address}: {reason}")]
    InvalidTarget { address: String, reason: String },

    /// TCP connect or TLS handshake failed.
    #[error("connection failed: {0}")]
    Connect(#[source] io::Error),

    /// Writing the initial request failed.
    #[error("sending initial request failed: {0}")]
    RequestWrite(#[source] io::Error),

    /// The initial response could not be read or parsed.
    #[error("failed to read initial response: {0}")]
    ResponseParse(#[source] io::Error),

    /// The response body could not be drained.
    #[error("failed to drain response body: {0}")]
    BodyDrain(#[source] io::Error),

    /// The idle read deadline could not be armed.
    #[error("failed to set read deadline: timeout {0:?} overflows the clock")]
    ReadDeadlineSet(Duration),

    /// The idle read failed for a reason other than EOF or the deadline.
    #[error("idle read failed after {elapsed:?}: {source}")]
    Read {
        elapsed: Duration,
        #[source]
        source: io::Error,
    },
}

impl ProbeError {
    /// Short stable label used for the `outcome` metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeError::InvalidTarget { .. } => "invalid_target",
            ProbeError::Connect(_) => "connect_error",
            ProbeError::RequestWrite(_) => "request_write_error",
            ProbeError::ResponseParse(_) => "response_parse_error",
            ProbeError::BodyDrain(_) => "body_drain_error",
            ProbeError::ReadDeadlineSet(_) => "read_deadline_error",
            ProbeError::Read { .. } => "read_error",
        }
    }

    /// Time spent waiting on the idle connection, if the probe got that far.
    pub fn elapsed(&self) -> Duration {
        match self {
            ProbeError::Read { elapsed, .. } => *elapsed,
            _ => Duration::ZERO,
        }
    }
}
