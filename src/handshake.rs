//! HTTP/1.1 Upgrade handshake.
//!
//! [`handshake`] writes the upgrade request, reads the response head and
//! reports whether permessage-deflate was accepted. The stream is taken as
//! [`AsyncBufRead`] so any bytes the server sends right after the header
//! block stay buffered for the frame reader.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use url::Url;

use crate::error::{Result, WebSocketError};

/// GUID appended to the client key before hashing (RFC6455 §1.3).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const EXTENSION_NAME: &str = "permessage-deflate";
const MAX_LINE_LEN: u64 = 8192;
const MAX_HEADERS: usize = 64;

/// Where to connect and what to request, parsed from a `ws://` or `wss://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Host name or IP literal (IPv6 keeps its brackets).
    pub host: String,
    /// TCP port, defaulted from the scheme.
    pub port: u16,
    /// Request target: path plus `?query`, never empty.
    pub path: String,
    /// Whether the scheme is `wss`.
    pub tls: bool,
}

impl Target {
    /// Parses a WebSocket URL.
    ///
    /// # Errors
    ///
    /// Returns [`WebSocketError::InvalidUrl`] for unparsable URLs, schemes
    /// other than `ws`/`wss`, or a missing host.
    pub fn parse(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|e| WebSocketError::InvalidUrl(format!("{url}: {e}")))?;
        let tls = match parsed.scheme() {
            "ws" => false,
            "wss" => true,
            other => {
                return Err(WebSocketError::InvalidUrl(format!(
                    "unsupported scheme {other:?}"
                )))
            }
        };
        let host = parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| WebSocketError::InvalidUrl(format!("{url}: missing host")))?
            .to_string();
        let port = parsed
            .port_or_known_default()
            .unwrap_or(if tls { 443 } else { 80 });

        let mut path = parsed.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = parsed.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            host,
            port,
            path,
            tls,
        })
    }

    /// Value of the `Host` header: the port is omitted when it is the scheme default.
    pub fn host_header(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Host to resolve and verify against, without IPv6 brackets.
    pub fn connect_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }
}

/// What the server agreed to during the upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Negotiated {
    /// permessage-deflate is active on this connection.
    pub compression: bool,
}

/// `base64(SHA-1(key + GUID))`, the value the server must echo.
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// A fresh `Sec-WebSocket-Key`: 16 random bytes, base64-encoded.
pub fn generate_key() -> String {
    STANDARD.encode(rand::random::<[u8; 16]>())
}

/// Checks a received `Sec-WebSocket-Accept` value against the request key.
///
/// # Errors
///
/// [`WebSocketError::MissingAccept`] when absent, [`WebSocketError::AcceptMismatch`]
/// when it differs.
pub fn validate_accept(key: &str, accept: Option<&str>) -> Result<()> {
    let actual = accept.ok_or(WebSocketError::MissingAccept)?;
    let expected = compute_accept_key(key);
    if actual == expected {
        Ok(())
    } else {
        Err(WebSocketError::AcceptMismatch {
            expected,
            actual: actual.to_string(),
        })
    }
}

/// Builds the upgrade request head.
pub fn request(target: &Target, key: &str, headers: &BTreeMap<String, String>) -> String {
    let mut out = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Extensions: {EXTENSION_NAME}\r\n",
        path = target.path,
        host = target.host_header(),
    );
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}

/// Performs the client side of the upgrade on an already-connected stream.
///
/// # Errors
///
/// I/O failures, a non-`101` status ([`WebSocketError::UpgradeRejected`]),
/// a bad accept value, or a response exceeding the line/header limits.
pub async fn handshake<S>(
    stream: &mut S,
    target: &Target,
    headers: &BTreeMap<String, String>,
) -> Result<Negotiated>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    let head = request(target, &key, headers);
    debug!(host = %target.host, path = %target.path, "sending upgrade request");
    stream.write_all(head.as_bytes()).await?;
    stream.flush().await?;
    read_response(stream, &key).await
}

/// Reads and validates the response head for a request sent with `key`.
pub(crate) async fn read_response<R>(stream: &mut R, key: &str) -> Result<Negotiated>
where
    R: AsyncBufRead + Unpin,
{
    let status_line = read_line(stream).await?;
    if !status_line.starts_with("HTTP/1.1 101") {
        let status = status_line
            .strip_prefix("HTTP/1.1 ")
            .and_then(|rest| rest.get(..3))
            .and_then(|code| code.parse().ok())
            .unwrap_or(0);
        return Err(WebSocketError::UpgradeRejected {
            status,
            status_line,
        });
    }

    let mut accept = None;
    let mut compression = false;
    let mut count = 0;
    loop {
        let line = read_line(stream).await?;
        if line.is_empty() {
            break;
        }
        count += 1;
        if count > MAX_HEADERS {
            return Err(WebSocketError::MalformedResponse("too many headers"));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or(WebSocketError::MalformedResponse("header line without ':'"))?;
        let value = value.trim();
        if name.eq_ignore_ascii_case("sec-websocket-accept") {
            accept = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("sec-websocket-extensions")
            && value.to_ascii_lowercase().contains(EXTENSION_NAME)
        {
            compression = true;
        }
    }

    validate_accept(key, accept.as_deref())?;
    debug!(compression, "upgrade accepted");
    Ok(Negotiated { compression })
}

async fn read_line<R>(stream: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *stream)
        .take(MAX_LINE_LEN)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
    }
    if !buf.ends_with(b"\n") {
        return Err(WebSocketError::MalformedResponse(
            "response line too long or truncated",
        ));
    }
    buf.pop();
    if buf.ends_with(b"\r") {
        buf.pop();
    }
    String::from_utf8(buf).map_err(|_| WebSocketError::MalformedResponse("response is not UTF-8"))
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::frame::{read_frame, Frame};
    use tokio::io::{duplex, AsyncReadExt, BufReader};

    const RFC_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const RFC_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

    async fn respond(head: &str) -> Result<Negotiated> {
        let mut reader = BufReader::new(head.as_bytes());
        read_response(&mut reader, RFC_KEY).await
    }

    #[test]
    fn accept_key_matches_rfc6455_vector() {
        assert_eq!(compute_accept_key(RFC_KEY), RFC_ACCEPT);
        assert!(validate_accept(RFC_KEY, Some(RFC_ACCEPT)).is_ok());
    }

    #[test]
    fn any_other_accept_fails() {
        let err = validate_accept(RFC_KEY, Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo")).unwrap_err();
        assert!(matches!(err, WebSocketError::AcceptMismatch { .. }));
        assert!(matches!(
            validate_accept(RFC_KEY, None),
            Err(WebSocketError::MissingAccept)
        ));
    }

    #[test]
    fn generated_keys_are_16_random_bytes() {
        let key = generate_key();
        assert_eq!(STANDARD.decode(&key).unwrap().len(), 16);
        assert_ne!(key, generate_key());
    }

    #[test]
    fn parses_targets() {
        let target = Target::parse("wss://irc-ws.chat.twitch.tv:443").unwrap();
        assert_eq!(target.host, "irc-ws.chat.twitch.tv");
        assert_eq!(target.port, 443);
        assert_eq!(target.path, "/");
        assert!(target.tls);
        assert_eq!(target.host_header(), "irc-ws.chat.twitch.tv");

        let target = Target::parse("ws://127.0.0.1:8080/v1/events?client=abc").unwrap();
        assert_eq!(target.port, 8080);
        assert_eq!(target.path, "/v1/events?client=abc");
        assert!(!target.tls);
        assert_eq!(target.host_header(), "127.0.0.1:8080");

        let target = Target::parse("ws://[::1]/").unwrap();
        assert_eq!(target.port, 80);
        assert_eq!(target.connect_host(), "::1");

        assert!(matches!(
            Target::parse("https://example.com"),
            Err(WebSocketError::InvalidUrl(_))
        ));
        assert!(Target::parse("not a url").is_err());
    }

    #[test]
    fn request_contains_required_headers() {
        let target = Target::parse("wss://pubsub-edge.example.com/").unwrap();
        let mut extra = BTreeMap::new();
        extra.insert("Origin".to_string(), "https://example.com".to_string());
        let head = request(&target, RFC_KEY, &extra);

        assert!(head.starts_with("GET / HTTP/1.1\r\n"));
        assert!(head.contains("Host: pubsub-edge.example.com\r\n"));
        assert!(head.contains("Upgrade: websocket\r\n"));
        assert!(head.contains("Connection: Upgrade\r\n"));
        assert!(head.contains(&format!("Sec-WebSocket-Key: {RFC_KEY}\r\n")));
        assert!(head.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(head.contains("Sec-WebSocket-Extensions: permessage-deflate\r\n"));
        assert!(head.ends_with("Origin: https://example.com\r\n\r\n"));
    }

    #[tokio::test]
    async fn accepts_101_with_deflate() {
        let negotiated = respond(&format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {RFC_ACCEPT}\r\n\
             Sec-WebSocket-Extensions: permessage-deflate; server_no_context_takeover\r\n\r\n"
        ))
        .await
        .unwrap();
        assert!(negotiated.compression);
    }

    #[tokio::test]
    async fn header_names_are_case_insensitive() {
        let negotiated = respond(&format!(
            "HTTP/1.1 101 Switching Protocols\r\nsec-websocket-accept: {RFC_ACCEPT}\r\n\r\n"
        ))
        .await
        .unwrap();
        assert!(!negotiated.compression);
    }

    #[tokio::test]
    async fn non_101_is_rejected_with_status() {
        let err = respond("HTTP/1.1 429 Too Many Requests\r\n\r\n").await.unwrap_err();
        assert!(err.is_throttled());

        let err = respond("HTTP/1.1 403 Forbidden\r\n\r\n").await.unwrap_err();
        assert!(matches!(err, WebSocketError::UpgradeRejected { status: 403, .. }));

        let err = respond("garbage\r\n\r\n").await.unwrap_err();
        assert!(matches!(err, WebSocketError::UpgradeRejected { status: 0, .. }));
    }

    #[tokio::test]
    async fn missing_accept_fails() {
        let err = respond("HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n")
            .await
            .unwrap_err();
        assert!(matches!(err, WebSocketError::MissingAccept));
    }

    #[tokio::test]
    async fn truncated_response_fails() {
        let err = respond("HTTP/1.1 101 Switching Protocols\r\nUpgrade: web")
            .await
            .unwrap_err();
        assert!(matches!(err, WebSocketError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn oversized_header_line_fails() {
        let err = respond(&format!(
            "HTTP/1.1 101 Switching Protocols\r\nX-Long: {}\r\n\r\n",
            "a".repeat(10_000)
        ))
        .await
        .unwrap_err();
        assert!(matches!(err, WebSocketError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn bytes_after_head_stay_buffered() {
        let (client, mut server) = duplex(4096);
        let server_task = tokio::spawn(async move {
            let mut request = Vec::new();
            let mut byte = [0u8; 1];
            while !request.ends_with(b"\r\n\r\n") {
                server.read_exact(&mut byte).await.unwrap();
                request.push(byte[0]);
            }
            let request = String::from_utf8(request).unwrap();
            let key = request
                .lines()
                .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
                .unwrap()
                .to_string();
            let mut response = format!(
                "HTTP/1.1 101 Switching Protocols\r\nSec-WebSocket-Accept: {}\r\n\r\n",
                compute_accept_key(&key)
            )
            .into_bytes();
            response.extend(Frame::text("welcome").encode(None).unwrap());
            server.write_all(&response).await.unwrap();
            server
        });

        let mut stream = BufReader::new(client);
        let target = Target::parse("ws://localhost/").unwrap();
        let negotiated = handshake(&mut stream, &target, &BTreeMap::new()).await.unwrap();
        assert!(!negotiated.compression);

        let frame = read_frame(&mut stream, 1024).await.unwrap().unwrap();
        assert_eq!(frame.payload, b"welcome");
        drop(server_task.await.unwrap());
    }
}
