//! Probe engine behaviour against live mock backends.

use std::time::{Duration, Instant};

use keepalive_monitor::probe::{measure, IdleOutcome, ProbeError};

mod common;

#[tokio::test]
async fn closing_server_reports_its_idle_timeout() {
    let addr = common::start_closing_backend(Duration::from_millis(300)).await;

    let m = measure(&addr.to_string(), Duration::from_secs(5), false).await.unwrap();

    assert_eq!(m.outcome, IdleOutcome::ClosedByPeer);
    assert!(!m.timed_out());
    assert!(m.elapsed >= Duration::from_millis(200), "{:?}", m.elapsed);
    assert!(m.elapsed < Duration::from_millis(1000), "{:?}", m.elapsed);
}

#[tokio::test]
async fn silent_server_hits_the_deadline() {
    let addr = common::start_idle_backend().await;

    let m = measure(&addr.to_string(), Duration::from_millis(500), false).await.unwrap();

    assert!(m.timed_out());
    assert!(m.elapsed >= Duration::from_millis(450), "{:?}", m.elapsed);
    assert!(m.elapsed < Duration::from_secs(2), "{:?}", m.elapsed);
}

#[tokio::test]
async fn connection_close_returns_immediately() {
    let addr = common::start_close_announcing_backend().await;
    let started = Instant::now();

    let m = measure(&addr.to_string(), Duration::from_secs(30), false).await.unwrap();

    assert_eq!(m.outcome, IdleOutcome::KeepAliveDisabled);
    assert_eq!(m.elapsed, Duration::ZERO);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn unreachable_backend_fails_fast_with_connect_error() {
    let addr = common::unused_address().await;
    let started = Instant::now();

    let err = measure(&addr.to_string(), Duration::from_secs(30), false).await.unwrap_err();

    assert!(matches!(err, ProbeError::Connect(_)), "{err}");
    assert_eq!(err.kind(), "connect_error");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn chunked_body_is_drained_before_idle_wait() {
    let addr = common::start_chunked_backend(Duration::from_millis(200)).await;

    let m = measure(&addr.to_string(), Duration::from_secs(5), false).await.unwrap();

    assert_eq!(m.outcome, IdleOutcome::ClosedByPeer);
    assert!(m.elapsed >= Duration::from_millis(100), "{:?}", m.elapsed);
}

#[tokio::test]
async fn tls_backend_with_self_signed_cert() {
    let addr = common::start_tls_backend(Duration::from_millis(300)).await;

    let m = measure(&format!("localhost:{}", addr.port()), Duration::from_secs(5), true)
        .await
        .unwrap();

    assert_eq!(m.outcome, IdleOutcome::ClosedByPeer);
    assert!(m.elapsed >= Duration::from_millis(200), "{:?}", m.elapsed);
    assert!(m.elapsed < Duration::from_millis(1500), "{:?}", m.elapsed);
}

#[tokio::test]
async fn non_http_reply_is_a_parse_error() {
    let addr = common::start_garbage_backend().await;

    let err = measure(&addr.to_string(), Duration::from_secs(5), false).await.unwrap_err();

    assert!(matches!(err, ProbeError::ResponseParse(_)), "{err}");
}

#[tokio::test]
async fn data_on_idle_connection_ends_the_wait() {
    let addr = common::start_chatty_backend(Duration::from_millis(100)).await;

    let m = measure(&addr.to_string(), Duration::from_secs(5), false).await.unwrap();

    assert_eq!(m.outcome, IdleOutcome::DataReceived);
    assert!(!m.timed_out());
    assert!(m.elapsed >= Duration::from_millis(50), "{:?}", m.elapsed);
    assert!(m.elapsed < Duration::from_secs(2), "{:?}", m.elapsed);
}

#[tokio::test]
async fn truncated_body_is_a_drain_error() {
    let addr = common::start_truncating_backend().await;

    let err = measure(&addr.to_string(), Duration::from_secs(5), false).await.unwrap_err();

    assert!(matches!(err, ProbeError::BodyDrain(_)), "{err}");
    assert_eq!(err.kind(), "body_drain_error");
}

#[tokio::test]
async fn connection_dropped_before_request_fails_the_exchange() {
    let addr = common::start_hangup_backend().await;
    let started = Instant::now();

    let err = measure(&addr.to_string(), Duration::from_secs(5), false).await.unwrap_err();

    assert!(
        matches!(err, ProbeError::RequestWrite(_) | ProbeError::ResponseParse(_)),
        "{err}"
    );
    assert!(started.elapsed() < Duration::from_secs(2));
}
