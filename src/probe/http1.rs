//! Minimal HTTP/1.1 framing for the probe.
//!
//! # Responsibilities
//! - Serialize the single `GET /` request the probe sends
//! - Parse exactly one response head off a buffered connection
//! - Drain the body according to its framing so the connection is left
//!   positioned right after the response
//!
//! # Design Decisions
//! - No client machinery: no pooling, redirects or retries
//! - Lines are collected off the socket here; `httparse` parses the head
//!   and chunk sizes, this module only decides framing and close rules
//! - The reader is borrowed, never consumed, so the caller keeps the socket
//!   for the idle read that follows

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// User agent sent with every probe request.
pub const USER_AGENT: &str = "http-keepalive-monitor/1.0";

const MAX_LINE_BYTES: u64 = 16 * 1024;
const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 128;

/// Build the raw bytes of a `GET` request for `path` on `host`.
pub fn build_request(host: &str, path: &str) -> Vec<u8> {
    format!(
        "GET {path} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: {USER_AGENT}\r\nAccept: */*\r\n\r\n"
    )
    .into_bytes()
}

/// How the body following a response head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body at all (1xx, 204, 304).
    Empty,
    /// Exactly this many bytes.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Body runs until the server closes the connection.
    UntilClose,
}

/// A parsed status line and header block.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub minor_version: u8,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// All values of header `name` (case-insensitive).
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// True if any comma-separated token of header `name` equals `token`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.header_values(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Body framing for a response to a `GET`.
    pub fn framing(&self) -> io::Result<BodyFraming> {
        if (100..200).contains(&self.status) || self.status == 204 || self.status == 304 {
            return Ok(BodyFraming::Empty);
        }

        if self.header_values("transfer-encoding").next().is_some() {
            let last = self
                .header_values("transfer-encoding")
                .flat_map(|v| v.split(','))
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .last();
            return Ok(match last {
                Some(t) if t.eq_ignore_ascii_case("chunked") => BodyFraming::Chunked,
                _ => BodyFraming::UntilClose,
            });
        }

        let mut length = None;
        for value in self.header_values("content-length") {
            let parsed: u64 = value
                .trim()
                .parse()
                .map_err(|_| invalid(format!("bad Content-Length {value:?}")))?;
            match length {
                Some(prev) if prev != parsed => {
                    return Err(invalid("conflicting Content-Length headers"));
                }
                _ => length = Some(parsed),
            }
        }

        Ok(match length {
            Some(n) => BodyFraming::Length(n),
            None => BodyFraming::UntilClose,
        })
    }

    /// Whether the server announced it will close the connection after
    /// this response.
    pub fn will_close(&self) -> io::Result<bool> {
        if self.has_token("connection", "close") {
            return Ok(true);
        }
        if self.minor_version == 0 && !self.has_token("connection", "keep-alive") {
            return Ok(true);
        }
        Ok(self.framing()? == BodyFraming::UntilClose)
    }
}

/// Read one final response head, skipping interim 1xx responses.
pub async fn read_response_head<R>(reader: &mut R) -> io::Result<ResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let head = read_head_once(reader).await?;
        // 101 switches protocols and is final for our purposes
        if (100..200).contains(&head.status) && head.status != 101 {
            tracing::trace!(status = head.status, "Skipping interim response");
            continue;
        }
        return Ok(head);
    }
}

async fn read_head_once<R>(reader: &mut R) -> io::Result<ResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    let mut block = Vec::new();
    loop {
        let start = block.len();
        read_raw_line(reader, &mut block).await?;
        if is_blank(&block[start..]) && start > 0 {
            break;
        }
        if block.len() > MAX_HEAD_BYTES {
            return Err(invalid("response head too large"));
        }
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(&block) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(invalid("incomplete response head")),
        Err(e) => return Err(invalid(format!("malformed response head: {e}"))),
    }

    let (Some(minor_version), Some(status)) = (response.version, response.code) else {
        return Err(invalid("response head without version or status"));
    };
    Ok(ResponseHead {
        minor_version,
        status,
        reason: response.reason.unwrap_or_default().to_string(),
        headers: response
            .headers
            .iter()
            .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).trim().to_string()))
            .collect(),
    })
}

/// Read and discard the body described by `framing`. Returns the number of
/// body bytes consumed (excluding chunk framing).
pub async fn drain_body<R>(reader: &mut R, framing: BodyFraming) -> io::Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    match framing {
        BodyFraming::Empty => Ok(0),
        BodyFraming::Length(n) => discard_exact(reader, n).await.map(|_| n),
        BodyFraming::UntilClose => tokio::io::copy(reader, &mut tokio::io::sink()).await,
        BodyFraming::Chunked => {
            let mut total = 0u64;
            let mut line = Vec::new();
            loop {
                line.clear();
                read_raw_line(reader, &mut line).await?;
                let size = match httparse::parse_chunk_size(&line) {
                    Ok(httparse::Status::Complete((_, size))) => size,
                    _ => return Err(invalid(format!("bad chunk size line {:?}", String::from_utf8_lossy(&line)))),
                };
                if size == 0 {
                    // trailer section ends with an empty line
                    loop {
                        line.clear();
                        read_raw_line(reader, &mut line).await?;
                        if is_blank(&line) {
                            return Ok(total);
                        }
                    }
                }
                discard_exact(reader, size).await?;
                total += size;
                line.clear();
                read_raw_line(reader, &mut line).await?;
                if !is_blank(&line) {
                    return Err(invalid("missing CRLF after chunk data"));
                }
            }
        }
    }
}

async fn discard_exact<R>(reader: &mut R, n: u64) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let copied = tokio::io::copy(&mut (&mut *reader).take(n), &mut tokio::io::sink()).await?;
    if copied != n {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("body ended after {copied} of {n} bytes"),
        ));
    }
    Ok(())
}

/// Append one LF terminated line, terminator included, to `buf`.
async fn read_raw_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let n = (&mut *reader).take(MAX_LINE_BYTES).read_until(b'\n', buf).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before response was complete",
        ));
    }
    if buf.last() != Some(&b'\n') {
        if n as u64 == MAX_LINE_BYTES {
            return Err(invalid("response line too long"));
        }
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed mid-line",
        ));
    }
    Ok(())
}

fn is_blank(line: &[u8]) -> bool {
    line == b"\r\n" || line == b"\n"
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, BufReader};

    async fn parse(raw: &[u8]) -> io::Result<ResponseHead> {
        let mut reader = BufReader::new(raw);
        read_response_head(&mut reader).await
    }

    #[test]
    fn request_carries_host_and_user_agent() {
        let req = String::from_utf8(build_request("10.0.0.1:8080", "/")).unwrap();
        assert!(req.starts_with("GET / HTTP/1.1\r\n"));
        assert!(req.contains("\r\nHost: 10.0.0.1:8080\r\n"));
        assert!(req.contains("\r\nUser-Agent: http-keepalive-monitor/1.0\r\n"));
        assert!(!req.to_ascii_lowercase().contains("connection:"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn parses_keep_alive_response() {
        let head = parse(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nServer: test\r\n\r\nhello")
            .await
            .unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.reason, "OK");
        assert_eq!(head.framing().unwrap(), BodyFraming::Length(5));
        assert!(!head.will_close().unwrap());
    }

    #[tokio::test]
    async fn connection_close_header_means_close() {
        let head = parse(b"HTTP/1.1 200 OK\r\nConnection: Keep-Alive, Close\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        assert!(head.will_close().unwrap());
    }

    #[tokio::test]
    async fn http10_defaults_to_close() {
        let head = parse(b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n").await.unwrap();
        assert!(head.will_close().unwrap());

        let head = parse(b"HTTP/1.0 200 OK\r\nConnection: keep-alive\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        assert!(!head.will_close().unwrap());
    }

    #[tokio::test]
    async fn unbounded_body_means_close() {
        let head = parse(b"HTTP/1.1 200 OK\r\n\r\nbody until eof").await.unwrap();
        assert_eq!(head.framing().unwrap(), BodyFraming::UntilClose);
        assert!(head.will_close().unwrap());

        let head = parse(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
        assert_eq!(head.framing().unwrap(), BodyFraming::Empty);
        assert!(!head.will_close().unwrap());
    }

    #[tokio::test]
    async fn skips_interim_responses() {
        let head = parse(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(head.status, 404);
    }

    #[tokio::test]
    async fn rejects_garbage() {
        assert!(parse(b"SSH-2.0-OpenSSH_9.0\r\n").await.is_err());
        assert!(parse(b"HTTP/1.1 2000 OK\r\n\r\n").await.is_err());
        assert!(parse(b"HTTP/1.1 200 OK\r\nno-colon-here\r\n\r\n").await.is_err());
        let err = parse(b"HTTP/1.1 200 OK\r\nContent-").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        let head = parse(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n")
            .await
            .unwrap();
        assert!(head.framing().is_err());
    }

    #[tokio::test]
    async fn drains_chunked_body_and_trailers() {
        let raw: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
            5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: yes\r\n\r\nNEXT";
        let mut reader = BufReader::new(raw);
        let head = read_response_head(&mut reader).await.unwrap();
        assert_eq!(head.framing().unwrap(), BodyFraming::Chunked);
        let drained = drain_body(&mut reader, BodyFraming::Chunked).await.unwrap();
        assert_eq!(drained, 11);

        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "NEXT");
    }

    #[tokio::test]
    async fn header_overflow_and_bad_chunks_are_rejected() {
        let mut raw = b"HTTP/1.1 200 OK\r\n".to_vec();
        for i in 0..=MAX_HEADERS {
            raw.extend_from_slice(format!("X-Filler-{i}: y\r\n").as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        let err = parse(&raw).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut reader = BufReader::new(&b"zz\r\nhello\r\n0\r\n\r\n"[..]);
        let err = drain_body(&mut reader, BodyFraming::Chunked).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut reader = BufReader::new(&b"5\r\nhelloXX0\r\n\r\n"[..]);
        assert!(drain_body(&mut reader, BodyFraming::Chunked).await.is_err());
    }

    #[tokio::test]
    async fn short_body_is_an_error() {
        let mut reader = BufReader::new(&b"abc"[..]);
        let err = drain_body(&mut reader, BodyFraming::Length(10)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
