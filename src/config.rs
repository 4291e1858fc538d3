//! Client configuration.
//!
//! [`ClientConfig`] is built with [`ClientConfig::new`] and tuned with the
//! `with_*` methods. Every default matches the behaviour consumers of this
//! transport rely on; override them only for tests or unusual servers.
//!
//! With the `serde` feature the configuration can be loaded from the host
//! application's settings file. Durations are written in milliseconds:
//!
//! ```toml
//! url = "wss://irc-ws.chat.twitch.tv:443"
//! client_pings = true
//!
//! [keepalive]
//! ping_interval_ms = 270000
//! pong_timeout_ms = 10000
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{Result, WebSocketError};

/// Delay before the first client ping and between pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(270);

/// How long to wait for a Pong after sending a Ping.
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive connection attempts before the connect loop gives up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;

/// Backoff after an ordinary failure.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Backoff after the server answered `429 Too Many Requests`.
pub const DEFAULT_THROTTLED_DELAY: Duration = Duration::from_secs(60);

/// Upper bound for TCP connect + TLS + upgrade.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long [`disconnect`](crate::WebSocketClient::disconnect) waits for the close handshake.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Text messages at least this long are compressed when deflate is negotiated.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Largest frame, inflated payload or reassembled message accepted.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Capacity of the channel used by [`ChannelListener`](crate::ChannelListener).
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

// ── Keepalive ───────────────────────────────────────────────────────

/// Client-initiated ping timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct KeepaliveConfig {
    /// Delay after the handshake (and after every Pong) before the next Ping.
    #[cfg_attr(feature = "serde", serde(rename = "ping_interval_ms", with = "millis"))]
    pub ping_interval: Duration,
    /// Time allowed for the Pong before the connection is dropped.
    #[cfg_attr(feature = "serde", serde(rename = "pong_timeout_ms", with = "millis"))]
    pub pong_timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
        }
    }
}

// ── Reconnect ───────────────────────────────────────────────────────

/// Bounded-retry policy of the connect loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
    /// Delay before retrying after an ordinary failure.
    #[cfg_attr(feature = "serde", serde(rename = "retry_delay_ms", with = "millis"))]
    pub retry_delay: Duration,
    /// Delay before retrying after an HTTP 429 upgrade response.
    #[cfg_attr(feature = "serde", serde(rename = "throttled_delay_ms", with = "millis"))]
    pub throttled_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            throttled_delay: DEFAULT_THROTTLED_DELAY,
        }
    }
}

// ── Client ──────────────────────────────────────────────────────────

/// Configuration for a [`WebSocketClient`](crate::WebSocketClient).
///
/// # Example
///
/// ```
/// use deflate_ws_client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::new("wss://pubsub-edge.example.com/v1")
///     .with_header("Origin", "https://example.com")
///     .with_client_pings(true)
///     .with_connect_timeout(Duration::from_secs(5));
///
/// assert!(config.client_pings);
/// assert_eq!(config.reconnect.max_attempts, 20);
/// assert_eq!(config.keepalive.ping_interval, Duration::from_secs(270));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClientConfig {
    /// `ws://` or `wss://` target URL.
    pub url: String,
    /// Extra headers appended to the upgrade request.
    #[cfg_attr(feature = "serde", serde(default))]
    pub headers: BTreeMap<String, String>,
    /// Send keepalive pings and enforce the pong timeout.
    ///
    /// Defaults to **false**. Server pings are answered either way.
    #[cfg_attr(feature = "serde", serde(default))]
    pub client_pings: bool,
    /// Ping timing, used only when `client_pings` is set.
    #[cfg_attr(feature = "serde", serde(default))]
    pub keepalive: KeepaliveConfig,
    /// Retry policy of the connect loop.
    #[cfg_attr(feature = "serde", serde(default))]
    pub reconnect: ReconnectPolicy,
    /// Upper bound for connect + TLS + upgrade. Defaults to **10 seconds**.
    #[cfg_attr(
        feature = "serde",
        serde(
            rename = "connect_timeout_ms",
            default = "defaults::connect_timeout",
            with = "millis"
        )
    )]
    pub connect_timeout: Duration,
    /// Close-handshake wait in `disconnect`. Defaults to **5 seconds**.
    #[cfg_attr(
        feature = "serde",
        serde(
            rename = "close_timeout_ms",
            default = "defaults::close_timeout",
            with = "millis"
        )
    )]
    pub close_timeout: Duration,
    /// Minimum text length for outgoing compression. Defaults to **1024** bytes.
    #[cfg_attr(feature = "serde", serde(default = "defaults::compression_threshold"))]
    pub compression_threshold: usize,
    /// Largest accepted frame or message. Defaults to **16 MiB**.
    #[cfg_attr(feature = "serde", serde(default = "defaults::max_message_size"))]
    pub max_message_size: usize,
    /// Capacity of the event channel created by
    /// [`WebSocketClient::with_events`](crate::WebSocketClient::with_events).
    /// Defaults to **256**. Values below 1 are clamped to 1.
    #[cfg_attr(feature = "serde", serde(default = "defaults::event_channel_capacity"))]
    pub event_channel_capacity: usize,
}

impl ClientConfig {
    /// Create a configuration for `url` with default values.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            client_pings: false,
            keepalive: KeepaliveConfig::default(),
            reconnect: ReconnectPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }

    /// Add an extra upgrade header, replacing any previous value for `name`.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Replace all extra upgrade headers.
    #[must_use]
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Enable or disable client-initiated pings.
    #[must_use]
    pub fn with_client_pings(mut self, enabled: bool) -> Self {
        self.client_pings = enabled;
        self
    }

    /// Set the ping timing.
    #[must_use]
    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the connect + upgrade timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set how long `disconnect` waits for the close handshake.
    #[must_use]
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Set the minimum text length for outgoing compression.
    #[must_use]
    pub fn with_compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = bytes;
        self
    }

    /// Set the largest accepted frame or message.
    #[must_use]
    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Set the event channel capacity. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// Check that every extra header can be written into the upgrade request.
    ///
    /// # Errors
    ///
    /// Returns [`WebSocketError::InvalidHeader`] for an empty name, a name
    /// containing `:` or whitespace, or any CR/LF.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in &self.headers {
            let bad_name = name.is_empty()
                || name
                    .chars()
                    .any(|c| c == ':' || c.is_whitespace() || c.is_control());
            let bad_value = value.contains(['\r', '\n']);
            if bad_name || bad_value {
                return Err(WebSocketError::InvalidHeader { name: name.clone() });
            }
        }
        Ok(())
    }
}

#[cfg(feature = "serde")]
mod defaults {
    use std::time::Duration;

    pub(super) fn connect_timeout() -> Duration {
        super::DEFAULT_CONNECT_TIMEOUT
    }

    pub(super) fn close_timeout() -> Duration {
        super::DEFAULT_CLOSE_TIMEOUT
    }

    pub(super) fn compression_threshold() -> usize {
        super::DEFAULT_COMPRESSION_THRESHOLD
    }

    pub(super) fn max_message_size() -> usize {
        super::DEFAULT_MAX_MESSAGE_SIZE
    }

    pub(super) fn event_channel_capacity() -> usize {
        super::DEFAULT_EVENT_CHANNEL_CAPACITY
    }
}

#[cfg(feature = "serde")]
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
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

    #[test]
    fn config_defaults() {
        let config = ClientConfig::new("wss://example.com/ws");
        assert_eq!(config.url, "wss://example.com/ws");
        assert!(config.headers.is_empty());
        assert!(!config.client_pings);
        assert_eq!(config.keepalive.ping_interval, Duration::from_secs(270));
        assert_eq!(config.keepalive.pong_timeout, Duration::from_secs(10));
        assert_eq!(config.reconnect.max_attempts, 20);
        assert_eq!(config.reconnect.retry_delay, Duration::from_secs(1));
        assert_eq!(config.reconnect.throttled_delay, Duration::from_secs(60));
        assert_eq!(config.close_timeout, Duration::from_secs(5));
        assert_eq!(config.compression_threshold, 1024);
        assert_eq!(config.event_channel_capacity, 256);
    }

    #[test]
    fn builder_methods_override_defaults() {
        let config = ClientConfig::new("ws://localhost:9000")
            .with_header("Authorization", "OAuth abc")
            .with_header("Authorization", "OAuth def")
            .with_client_pings(true)
            .with_close_timeout(Duration::from_millis(250))
            .with_event_channel_capacity(0);
        assert_eq!(config.headers.get("Authorization").map(String::as_str), Some("OAuth def"));
        assert!(config.client_pings);
        assert_eq!(config.close_timeout, Duration::from_millis(250));
        assert_eq!(config.event_channel_capacity, 1);
    }

    #[test]
    fn validate_rejects_header_injection() {
        let injected = ClientConfig::new("wss://example.com")
            .with_header("X-Token", "abc\r\nEvil: 1");
        assert!(matches!(
            injected.validate(),
            Err(WebSocketError::InvalidHeader { ref name }) if name == "X-Token"
        ));

        let bad_name = ClientConfig::new("wss://example.com").with_header("Bad Name", "x");
        assert!(bad_name.validate().is_err());

        let empty = ClientConfig::new("wss://example.com").with_header("", "x");
        assert!(empty.validate().is_err());

        let fine = ClientConfig::new("wss://example.com").with_header("Client-Id", "kimne78");
        assert!(fine.validate().is_ok());
    }
}
