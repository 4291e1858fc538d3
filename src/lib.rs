//! # deflate-ws-client
//!
//! A WebSocket client built directly on TCP/TLS sockets, without a WebSocket
//! library underneath.
//!
//! The crate speaks RFC6455 itself and carries each text message to a
//! [`Listener`]:
//!
//! - **Handshake**: HTTP/1.1 Upgrade with `Sec-WebSocket-Accept` validation
//! - **Framing**: masked client frames, all three length encodings, fragmentation
//! - **permessage-deflate**: RFC7692, no context takeover, negotiated per connection
//! - **Keepalive**: optional client pings with a pong deadline; server pings always answered
//! - **Reconnect**: bounded retries with a longer backoff after HTTP 429
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use deflate_ws_client::{ClientConfig, Listener, WebSocketClient};
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl Listener for Printer {
//!     async fn on_message(&self, text: String) {
//!         println!("{text}");
//!     }
//! }
//!
//! # async fn example() -> deflate_ws_client::Result<()> {
//! let config = ClientConfig::new("wss://irc-ws.chat.twitch.tv:443").with_client_pings(true);
//! let client = WebSocketClient::new(config, Arc::new(Printer))?;
//! client.start();
//! // ...
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

mod assembler;
pub mod client;
pub mod config;
pub mod connector;
pub mod connectors;
pub mod deflate;
pub mod error;
pub mod frame;
pub mod handshake;
mod keepalive;
pub mod listener;
mod reconnect;
mod session;
mod writer;

// Re-export primary types for ergonomic imports.
pub use client::{ConnectionState, WebSocketClient};
pub use config::{ClientConfig, KeepaliveConfig, ReconnectPolicy};
pub use connector::Connector;
pub use connectors::TcpConnector;
pub use error::{Result, WebSocketError};
pub use handshake::Target;
pub use listener::{ChannelListener, Event, Listener};
