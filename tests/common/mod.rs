#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for the WebSocket client integration tests.
//!
//! Provides an in-memory [`MockConnector`] whose connections are handed to
//! the test as [`ServerConn`]s, so each test plays the server side of the
//! handshake and framing by hand.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use deflate_ws_client::connector::{BoxedStream, Connector};
use deflate_ws_client::frame::{read_frame, Frame};
use deflate_ws_client::handshake::compute_accept_key;
use deflate_ws_client::{
    ChannelListener, ClientConfig, Event, Result, Target, WebSocketClient, WebSocketError,
};
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Largest frame the test server accepts from the client.
pub const SERVER_LIMIT: usize = 16 * 1024 * 1024;

type FailureFn = dyn Fn(u32) -> Option<WebSocketError> + Send + Sync;

// ── MockConnector ───────────────────────────────────────────────────

/// A connector that opens in-memory pipes instead of sockets.
///
/// Every attempt is counted and timestamped. Unless the failure hook returns
/// an error for that attempt, the server half of a fresh pipe is delivered
/// on the channel returned by [`MockConnector::new`].
pub struct MockConnector {
    servers: mpsc::UnboundedSender<ServerConn>,
    /// Number of `connect` calls so far.
    pub attempts: Arc<AtomicU32>,
    /// When each `connect` call happened.
    pub attempt_times: Arc<StdMutex<Vec<Instant>>>,
    failure: Option<Box<FailureFn>>,
}

impl MockConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerConn>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let connector = Self {
            servers,
            attempts: Arc::default(),
            attempt_times: Arc::default(),
            failure: None,
        };
        (connector, rx)
    }

    /// Fail attempts for which `failure(attempt)` returns an error (1-based).
    pub fn failing_with(
        mut self,
        failure: impl Fn(u32) -> Option<WebSocketError> + Send + Sync + 'static,
    ) -> Self {
        self.failure = Some(Box::new(failure));
        self
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _target: &Target) -> Result<BoxedStream> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.attempt_times.lock().unwrap().push(Instant::now());
        if let Some(err) = self.failure.as_ref().and_then(|failure| failure(attempt)) {
            return Err(err);
        }
        let (client, server) = duplex(1 << 20);
        // The test may have stopped listening; the client then sees EOF.
        let _ = self.servers.send(ServerConn::new(server));
        Ok(Box::new(client))
    }
}

// ── ServerConn ──────────────────────────────────────────────────────

/// The server end of one mock connection.
pub struct ServerConn {
    stream: BufReader<DuplexStream>,
}

impl ServerConn {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    /// Read the upgrade request head, including the blank line.
    pub async fn read_request(&mut self) -> String {
        let mut request = String::new();
        loop {
            let mut line = String::new();
            let n = self.stream.read_line(&mut line).await.unwrap();
            assert!(n > 0, "client closed before finishing the request");
            request.push_str(&line);
            if line == "\r\n" {
                return request;
            }
        }
    }

    /// Complete the handshake, optionally agreeing to permessage-deflate.
    /// Returns the request head.
    pub async fn accept(&mut self, deflate: bool) -> String {
        let request = self.read_request().await;
        let key = header(&request, "Sec-WebSocket-Key").unwrap();
        let mut response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n",
            compute_accept_key(&key)
        );
        if deflate {
            response.push_str("Sec-WebSocket-Extensions: permessage-deflate\r\n");
        }
        response.push_str("\r\n");
        self.write_raw(response.as_bytes()).await;
        request
    }

    /// Answer the upgrade with a non-101 status line.
    pub async fn reject(&mut self, status_line: &str) {
        self.read_request().await;
        self.write_raw(format!("{status_line}\r\nContent-Length: 0\r\n\r\n").as_bytes())
            .await;
    }

    /// Send a frame as a server would (unmasked).
    pub async fn send(&mut self, frame: Frame) {
        let bytes = frame.encode(None).unwrap();
        self.write_raw(&bytes).await;
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) {
        let stream = self.stream.get_mut();
        stream.write_all(bytes).await.unwrap();
        stream.flush().await.unwrap();
    }

    /// Next frame from the client, or `None` once the client closed its side.
    pub async fn recv(&mut self) -> Option<Frame> {
        read_frame(&mut self.stream, SERVER_LIMIT).await.unwrap()
    }
}

/// Value of header `name` in a request head (case-insensitive).
pub fn header(request: &str, name: &str) -> Option<String> {
    request.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.eq_ignore_ascii_case(name)
            .then(|| value.trim().to_string())
    })
}

// ── Client helpers ──────────────────────────────────────────────────

/// A client wired to a fresh mock connector and an event channel.
pub struct Harness {
    pub client: WebSocketClient,
    pub events: mpsc::Receiver<Event>,
    pub servers: mpsc::UnboundedReceiver<ServerConn>,
    pub attempts: Arc<AtomicU32>,
    pub attempt_times: Arc<StdMutex<Vec<Instant>>>,
}

pub fn harness(config: ClientConfig) -> Harness {
    let (connector, servers) = MockConnector::new();
    harness_with(config, connector, servers)
}

pub fn harness_with(
    config: ClientConfig,
    connector: MockConnector,
    servers: mpsc::UnboundedReceiver<ServerConn>,
) -> Harness {
    let attempts = Arc::clone(&connector.attempts);
    let attempt_times = Arc::clone(&connector.attempt_times);
    let (listener, events) = ChannelListener::new(config.event_channel_capacity);
    let client =
        WebSocketClient::with_connector(config, Arc::new(listener), Arc::new(connector)).unwrap();
    Harness {
        client,
        events,
        servers,
        attempts,
        attempt_times,
    }
}

/// The default test configuration.
pub fn config() -> ClientConfig {
    ClientConfig::new("wss://irc-ws.chat.twitch.tv:443")
}
