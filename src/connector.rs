//! Byte-stream abstraction underneath the WebSocket protocol.
//!
//! The client never opens sockets itself. A [`Connector`] turns a parsed
//! [`Target`] into a connected, already-encrypted (for `wss://`) stream; the
//! handshake and framing run on top of whatever it returns. The default is
//! [`TcpConnector`](crate::connectors::TcpConnector). Tests and proxies plug
//! in their own.
//!
//! # Implementing a Custom Connector
//!
//! ```rust
//! use async_trait::async_trait;
//! use deflate_ws_client::connector::{BoxedStream, Connector};
//! use deflate_ws_client::{Result, Target};
//!
//! struct Loopback;
//!
//! #[async_trait]
//! impl Connector for Loopback {
//!     async fn connect(&self, target: &Target) -> Result<BoxedStream> {
//!         let stream = tokio::net::TcpStream::connect(("127.0.0.1", target.port)).await?;
//!         Ok(Box::new(stream))
//!     }
//! }
//! ```

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::handshake::Target;

/// A bidirectional byte stream the client can run WebSocket framing over.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Type-erased stream returned by a [`Connector`].
pub type BoxedStream = Box<dyn Stream>;

/// Opens the transport connection for one connection attempt.
///
/// Called once per attempt by the connect loop, under the configured
/// connect timeout.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect to `target`, completing TLS when `target.tls` is set.
    ///
    /// # Errors
    ///
    /// Return [`WebSocketError::Tls`](crate::WebSocketError::Tls) only for
    /// failures that must not be retried (certificate rejected, TLS
    /// unavailable). Anything else is treated as transient.
    async fn connect(&self, target: &Target) -> Result<BoxedStream>;
}
