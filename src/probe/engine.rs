//! Single-connection idle timeout measurement.
//!
//! # Responsibilities
//! - Open one TCP (optionally TLS) connection to a backend
//! - Complete exactly one `GET /` exchange on it with raw HTTP/1.1 framing
//! - Wait, under a read deadline, for the server to close the now idle
//!   connection and report how long that took
//!
//! # Design Decisions
//! - A pooled HTTP client would hide the server's idle close behind its own
//!   connection reuse policy, so the exchange is done by hand on the socket
//! - The socket is owned by the call and dropped on every return path
//! - Every phase before the idle read is bounded by the probe timeout as well

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};

use crate::probe::error::ProbeError;
use crate::probe::http1;
use crate::probe::tls;

/// Result of one probe call.
pub type ProbeResult = Result<Measurement, ProbeError>;

/// What ended the idle wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// The server closed the idle connection before the deadline.
    ClosedByPeer,
    /// The deadline fired first; the idle timeout is at least the probe timeout.
    DeadlineElapsed,
    /// The response announced `Connection: close`; keep-alive is unsupported.
    KeepAliveDisabled,
    /// The server sent bytes on the idle connection before closing it.
    DataReceived,
}

/// A successful measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    pub elapsed: Duration,
    pub outcome: IdleOutcome,
}

impl Measurement {
    /// True when the read deadline fired before the server closed.
    pub fn timed_out(&self) -> bool {
        self.outcome == IdleOutcome::DeadlineElapsed
    }
}

/// Where and how to connect for one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    /// `host:port` to dial; also sent as the `Host` header.
    pub address: String,
    /// Wrap the connection in TLS (certificate verification disabled).
    pub tls: bool,
    /// Upper bound for connection establishment; defaults to the probe timeout.
    pub connect_timeout: Option<Duration>,
}

impl ProbeTarget {
    pub fn new(address: impl Into<String>, tls: bool) -> Self {
        Self {
            address: address.into(),
            tls,
            connect_timeout: None,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Option<Duration>) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

/// Something that can take one idle timeout measurement.
///
/// The monitor loop is generic over this so tests can substitute scripted
/// results for real sockets.
pub trait Prober: Send + Sync + 'static {
    fn probe(&self, target: ProbeTarget, timeout: Duration) -> impl Future<Output = ProbeResult> + Send;
}

/// The real socket-level prober.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepaliveProber;

impl Prober for KeepaliveProber {
    fn probe(&self, target: ProbeTarget, timeout: Duration) -> impl Future<Output = ProbeResult> + Send {
        async move { measure_target(&target, timeout).await }
    }
}

/// Measure the idle timeout of the server at `address`.
pub async fn measure(address: &str, timeout: Duration, use_tls: bool) -> ProbeResult {
    measure_target(&ProbeTarget::new(address, use_tls), timeout).await
}

/// Measure the idle timeout for a fully specified target.
pub async fn measure_target(target: &ProbeTarget, timeout: Duration) -> ProbeResult {
    let connect_timeout = target.connect_timeout.unwrap_or(timeout);

    let tcp = bounded(connect_timeout, "connect", TcpStream::connect(target.address.as_str()))
        .await
        .map_err(ProbeError::Connect)?;
    if let Err(e) = tcp.set_nodelay(true) {
        tracing::trace!(error = %e, "Failed to set TCP_NODELAY");
    }

    if !target.tls {
        return exchange(tcp, &target.address, timeout).await;
    }

    let server_name = tls::server_name(&target.address).ok_or_else(|| ProbeError::InvalidTarget {
        address: target.address.clone(),
        reason: "host is not a valid TLS server name".to_string(),
    })?;
    let connector = tls::insecure_connector().map_err(|e| ProbeError::Connect(io::Error::other(e)))?;
    let stream = bounded(connect_timeout, "TLS handshake", connector.connect(server_name, tcp))
        .await
        .map_err(ProbeError::Connect)?;

    exchange(stream, &target.address, timeout).await
}

async fn exchange<S>(stream: S, host: &str, timeout: Duration) -> ProbeResult
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = BufReader::new(stream);

    let request = http1::build_request(host, "/");
    bounded(timeout, "request write", async {
        conn.write_all(&request).await?;
        conn.flush().await
    })
    .await
    .map_err(ProbeError::RequestWrite)?;

    let head = bounded(timeout, "response read", http1::read_response_head(&mut conn))
        .await
        .map_err(ProbeError::ResponseParse)?;
    tracing::trace!(host, status = head.status, "Initial response received");

    if head.will_close().map_err(ProbeError::ResponseParse)? {
        return Ok(Measurement {
            elapsed: Duration::ZERO,
            outcome: IdleOutcome::KeepAliveDisabled,
        });
    }

    let framing = head.framing().map_err(ProbeError::ResponseParse)?;
    bounded(timeout, "body drain", http1::drain_body(&mut conn, framing))
        .await
        .map_err(ProbeError::BodyDrain)?;

    let deadline = Instant::now()
        .checked_add(timeout)
        .ok_or(ProbeError::ReadDeadlineSet(timeout))?;

    let mut byte = [0u8; 1];
    let start = Instant::now();
    let read = time::timeout_at(deadline, conn.read(&mut byte)).await;
    let elapsed = start.elapsed();

    match read {
        Ok(Ok(0)) => Ok(Measurement {
            elapsed,
            outcome: IdleOutcome::ClosedByPeer,
        }),
        Ok(Ok(_)) => {
            tracing::debug!(host, ?elapsed, "Server sent data on the idle connection");
            Ok(Measurement {
                elapsed,
                outcome: IdleOutcome::DataReceived,
            })
        }
        Ok(Err(source)) => Err(ProbeError::Read { elapsed, source }),
        Err(_) => Ok(Measurement {
            elapsed,
            outcome: IdleOutcome::DeadlineElapsed,
        }),
    }
}

/// Run an I/O future under a time limit, folding expiry into a `TimedOut` error.
async fn bounded<T, F>(limit: Duration, phase: &str, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{phase} timed out after {limit:?}"),
        )),
    }
}
