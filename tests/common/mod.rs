//! Shared mock backends for integration tests.
//!
//! Every backend binds `127.0.0.1:0`, serves each connection in its own task
//! and returns the bound address.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;

pub const OK_RESPONSE: &str = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";

/// Start a backend that runs `serve` on every accepted connection.
pub async fn start_backend<F, Fut>(serve: F) -> SocketAddr
where
    F: Fn(tokio::net::TcpStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve(socket));
        }
    });
    addr
}

/// Read until the end of the request head.
pub async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

/// Wait until the client goes away.
pub async fn hold_open<S: AsyncRead + Unpin>(stream: &mut S) {
    let mut chunk = [0u8; 64];
    while let Ok(n) = stream.read(&mut chunk).await {
        if n == 0 {
            break;
        }
    }
}

async fn respond_then_close<S>(mut stream: S, response: &'static str, idle: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    read_request(&mut stream).await;
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.flush().await;
    tokio::time::sleep(idle).await;
    let _ = stream.shutdown().await;
}

/// Keep-alive backend that closes each connection `idle` after responding.
pub async fn start_closing_backend(idle: Duration) -> SocketAddr {
    start_backend(move |socket| respond_then_close(socket, OK_RESPONSE, idle)).await
}

/// Keep-alive backend that never closes an idle connection.
pub async fn start_idle_backend() -> SocketAddr {
    start_backend(|mut socket| async move {
        read_request(&mut socket).await;
        let _ = socket.write_all(OK_RESPONSE.as_bytes()).await;
        hold_open(&mut socket).await;
    })
    .await
}

/// Backend that answers with `Connection: close` but leaves the socket open.
pub async fn start_close_announcing_backend() -> SocketAddr {
    start_backend(|mut socket| async move {
        read_request(&mut socket).await;
        let _ = socket
            .write_all(b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\nok")
            .await;
        hold_open(&mut socket).await;
    })
    .await
}

/// Keep-alive backend with a chunked body and trailer, closing after `idle`.
pub async fn start_chunked_backend(idle: Duration) -> SocketAddr {
    const CHUNKED: &str = "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                           5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\nX-Trailer: yes\r\n\r\n";
    start_backend(move |socket| respond_then_close(socket, CHUNKED, idle)).await
}

/// Backend that does not speak HTTP.
pub async fn start_garbage_backend() -> SocketAddr {
    start_backend(|mut socket| async move {
        read_request(&mut socket).await;
        let _ = socket.write_all(b"SSH-2.0-OpenSSH_9.6\r\n\r\n").await;
        hold_open(&mut socket).await;
    })
    .await
}

/// Backend that pushes unsolicited bytes `after` its response.
pub async fn start_chatty_backend(after: Duration) -> SocketAddr {
    start_backend(move |mut socket| async move {
        read_request(&mut socket).await;
        let _ = socket.write_all(OK_RESPONSE.as_bytes()).await;
        tokio::time::sleep(after).await;
        let _ = socket.write_all(b"surprise").await;
        hold_open(&mut socket).await;
    })
    .await
}

/// Backend that promises ten body bytes, sends three and closes.
pub async fn start_truncating_backend() -> SocketAddr {
    start_backend(|mut socket| async move {
        read_request(&mut socket).await;
        let _ = socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc")
            .await;
        let _ = socket.shutdown().await;
    })
    .await
}

/// Backend that hangs up on every connection without reading the request.
pub async fn start_hangup_backend() -> SocketAddr {
    start_backend(|socket| async move {
        drop(socket);
    })
    .await
}

/// TLS keep-alive backend with a self-signed certificate, closing after `idle`.
pub async fn start_tls_backend(idle: Duration) -> SocketAddr {
    let acceptor = tls_acceptor();
    start_backend(move |socket| {
        let acceptor = acceptor.clone();
        async move {
            if let Ok(stream) = acceptor.accept(socket).await {
                respond_then_close(stream, OK_RESPONSE, idle).await;
            }
        }
    })
    .await
}

fn tls_acceptor() -> TlsAcceptor {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = rustls::pki_types::PrivateKeyDer::Pkcs8(key_pair.serialize_der().into());

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.der().clone()], key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

/// An address with nothing listening on it.
pub async fn unused_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Poll `check` every 20ms until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
