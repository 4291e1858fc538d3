//! Error types for the WebSocket client.

use thiserror::Error;

/// Errors that can occur while connecting, framing or writing.
#[derive(Debug, Error)]
pub enum WebSocketError {
    /// The target URL could not be parsed or uses an unsupported scheme.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// A caller-supplied handshake header contains CR/LF or is empty.
    #[error("invalid header {name:?}")]
    InvalidHeader {
        /// Header name as supplied by the caller.
        name: String,
    },

    /// An I/O error occurred on the socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The TLS handshake was rejected. This is never retried.
    #[error("TLS handshake failed: {0}")]
    Tls(String),

    /// Connecting or completing the upgrade took longer than the configured timeout.
    #[error("operation timed out")]
    Timeout,

    /// The server answered the upgrade request with something other than `101`.
    #[error("upgrade rejected: {status_line}")]
    UpgradeRejected {
        /// Numeric HTTP status, `0` when the status line could not be parsed.
        status: u16,
        /// The raw status line as received.
        status_line: String,
    },

    /// The `101` response carried no `Sec-WebSocket-Accept` header.
    #[error("missing Sec-WebSocket-Accept header")]
    MissingAccept,

    /// The `Sec-WebSocket-Accept` header did not match the request key.
    #[error("invalid Sec-WebSocket-Accept: expected {expected}, got {actual}")]
    AcceptMismatch {
        /// Accept value derived from the request key.
        expected: String,
        /// Accept value sent by the server.
        actual: String,
    },

    /// The upgrade response was not valid HTTP/1.1 or exceeded the size limits.
    #[error("malformed handshake response: {0}")]
    MalformedResponse(&'static str),

    /// A frame carried a reserved opcode.
    #[error("invalid opcode: 0x{0:X}")]
    InvalidOpcode(u8),

    /// The peer broke an RFC6455 framing rule.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// A control frame payload exceeded 125 bytes.
    #[error("control frame payload too large: {0} bytes (max: 125)")]
    ControlFrameTooLarge(usize),

    /// A frame or reassembled message exceeded `max_message_size`.
    #[error("payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge {
        /// Declared or accumulated size in bytes.
        size: u64,
        /// Configured maximum in bytes.
        max: usize,
    },

    /// Deflating or inflating a permessage-deflate payload failed.
    #[error("compression error: {0}")]
    Compression(String),

    /// No connection is open.
    #[error("not connected to server")]
    NotConnected,

    /// No Pong arrived within the pong timeout.
    #[error("pong timeout")]
    PongTimeout,
}

impl WebSocketError {
    /// Returns `true` if the connect loop must stop instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// Returns `true` if the server signalled `429 Too Many Requests`.
    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::UpgradeRejected { status: 429, .. })
    }
}

/// A specialized [`Result`] type for WebSocket client operations.
pub type Result<T> = std::result::Result<T, WebSocketError>;

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

    #[test]
    fn only_tls_errors_are_fatal() {
        assert!(WebSocketError::Tls("bad certificate".into()).is_fatal());
        assert!(!WebSocketError::Timeout.is_fatal());
        assert!(!WebSocketError::MissingAccept.is_fatal());
        assert!(!WebSocketError::Io(std::io::ErrorKind::ConnectionReset.into()).is_fatal());
    }

    #[test]
    fn throttled_only_for_429() {
        let throttled = WebSocketError::UpgradeRejected {
            status: 429,
            status_line: "HTTP/1.1 429 Too Many Requests".into(),
        };
        let unavailable = WebSocketError::UpgradeRejected {
            status: 503,
            status_line: "HTTP/1.1 503 Service Unavailable".into(),
        };
        assert!(throttled.is_throttled());
        assert!(!unavailable.is_throttled());
        assert!(!throttled.is_fatal());
    }

    #[test]
    fn display_includes_status_line() {
        let err = WebSocketError::UpgradeRejected {
            status: 403,
            status_line: "HTTP/1.1 403 Forbidden".into(),
        };
        assert_eq!(err.to_string(), "upgrade rejected: HTTP/1.1 403 Forbidden");
    }
}
