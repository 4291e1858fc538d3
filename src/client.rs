//! WebSocket client with bounded auto-reconnect.
//!
//! [`WebSocketClient`] is a handle to a background task that connects,
//! performs the upgrade, runs the read loop and reconnects on failure. All
//! notifications go to the [`Listener`] supplied at construction. Writes
//! from the handle go straight to the open connection's [`FrameWriter`].
//!
//! # Example
//!
//! ```rust,ignore
//! let config = ClientConfig::new("wss://irc-ws.chat.twitch.tv:443")
//!     .with_client_pings(true);
//! let client = WebSocketClient::new(config, Arc::new(ChatListener::default()))?;
//! client.start();
//!
//! // ... once `on_connect` fired:
//! client.write("CAP REQ :twitch.tv/tags").await?;
//!
//! client.disconnect().await;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::io::BufReader;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::connector::{BoxedStream, Connector};
use crate::connectors::TcpConnector;
use crate::error::{Result, WebSocketError};
use crate::frame::CLOSE_NORMAL;
use crate::handshake::{handshake, Negotiated, Target};
use crate::keepalive::Keepalive;
use crate::listener::{ChannelListener, Event, Listener};
use crate::reconnect::ReconnectState;
use crate::session::{Session, SessionEnd};
use crate::writer::FrameWriter;

/// Lifecycle of the client's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started, or the connect loop has ended.
    Idle,
    /// A connection attempt is in progress.
    Connecting,
    /// The upgrade completed; messages flow.
    Open,
    /// The last connection ended; a retry may follow.
    Closed,
}

struct Shared {
    config: ClientConfig,
    target: Target,
    listener: Arc<dyn Listener>,
    connector: Arc<dyn Connector>,
    writer: Mutex<Option<Arc<FrameWriter>>>,
    state: watch::Sender<ConnectionState>,
    stop: CancellationToken,
    stopping: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "connection state changed");
        }
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire) || self.stop.is_cancelled()
    }
}

/// Handle to a WebSocket connection managed by a background task.
///
/// Created with [`new`](Self::new), [`with_connector`](Self::with_connector)
/// or [`with_events`](Self::with_events); nothing happens on the network
/// until [`start`](Self::start).
///
/// Dropping the handle aborts the background task without a close handshake.
/// Call [`disconnect`](Self::disconnect) first for an orderly shutdown.
pub struct WebSocketClient {
    shared: Arc<Shared>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl WebSocketClient {
    /// Create a client connecting over TCP (and TLS for `wss://`).
    ///
    /// # Errors
    ///
    /// [`WebSocketError::InvalidUrl`] for a bad URL, [`WebSocketError::InvalidHeader`]
    /// for an extra header that cannot be sent, [`WebSocketError::Tls`] if the
    /// TLS configuration cannot be built.
    pub fn new(config: ClientConfig, listener: Arc<dyn Listener>) -> Result<Self> {
        let connector = TcpConnector::new()?;
        Self::with_connector(config, listener, Arc::new(connector))
    }

    /// Create a client that opens its byte streams through `connector`.
    ///
    /// # Errors
    ///
    /// [`WebSocketError::InvalidUrl`] or [`WebSocketError::InvalidHeader`].
    pub fn with_connector(
        config: ClientConfig,
        listener: Arc<dyn Listener>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;
        let target = Target::parse(&config.url)?;
        let (state, _) = watch::channel(ConnectionState::Idle);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                target,
                listener,
                connector,
                writer: Mutex::new(None),
                state,
                stop: CancellationToken::new(),
                stopping: AtomicBool::new(false),
            }),
            task: StdMutex::new(None),
        })
    }

    /// Create a client whose notifications arrive as [`Event`]s on a channel
    /// of `config.event_channel_capacity`.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn with_events(config: ClientConfig) -> Result<(Self, mpsc::Receiver<Event>)> {
        let (listener, events) = ChannelListener::new(config.event_channel_capacity);
        let client = Self::new(config, Arc::new(listener))?;
        Ok((client, events))
    }

    /// Spawn the connect loop onto the current tokio runtime.
    ///
    /// Has no effect if the loop is already running or the client was disconnected.
    pub fn start(&self) {
        if self.shared.is_stopping() {
            warn!("start called after disconnect; ignoring");
            return;
        }
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|running| !running.is_finished()) {
            debug!("connect loop already running");
            return;
        }
        *task = Some(tokio::spawn(run(Arc::clone(&self.shared))));
    }

    /// Send a text message on the open connection.
    ///
    /// # Errors
    ///
    /// [`WebSocketError::NotConnected`] if no connection is open or a close
    /// was already sent; I/O or compression errors from the write itself.
    pub async fn write(&self, text: &str) -> Result<()> {
        let writer = self
            .shared
            .writer
            .lock()
            .await
            .clone()
            .ok_or(WebSocketError::NotConnected)?;
        writer.send_text(text).await
    }

    /// Close the connection with status 1000 and stop reconnecting.
    ///
    /// Waits up to `close_timeout` for the server to answer the Close, then
    /// forces the socket shut. The background task gets another
    /// `close_timeout` to finish before it is aborted.
    /// Must not be awaited from inside a [`Listener`] hook.
    pub async fn disconnect(&self) {
        debug!("disconnect requested");
        self.shared.stopping.store(true, Ordering::Release);

        let writer = self.shared.writer.lock().await.clone();
        if let Some(writer) = writer {
            match writer.send_close(&CLOSE_NORMAL.to_be_bytes()).await {
                Ok(_) => {
                    let mut state = self.shared.state.subscribe();
                    let closed = tokio::time::timeout(
                        self.shared.config.close_timeout,
                        state.wait_for(|state| *state != ConnectionState::Open),
                    )
                    .await
                    .is_ok();
                    if !closed {
                        warn!(
                            timeout = ?self.shared.config.close_timeout,
                            "close handshake timed out, forcing close"
                        );
                    }
                }
                Err(e) => debug!(error = %e, "could not send close frame"),
            }
        }

        self.shared.stop.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut task) = task {
            match tokio::time::timeout(self.shared.config.close_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("connect loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!(
                        timeout = ?self.shared.config.close_timeout,
                        "connect loop did not stop in time, aborting"
                    );
                    task.abort();
                    let _ = task.await;
                    let writer = self.shared.writer.lock().await.take();
                    if let Some(writer) = writer {
                        writer.shutdown().await;
                    }
                    self.shared.set_state(ConnectionState::Closed);
                }
            }
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Returns `true` while a connection is open.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }
}

impl std::fmt::Debug for WebSocketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketClient")
            .field("url", &self.shared.config.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for WebSocketClient {
    fn drop(&mut self) {
        self.shared.stop.cancel();
        let task = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

// ── Connect loop ────────────────────────────────────────────────────

async fn run(shared: Arc<Shared>) {
    let mut reconnect = ReconnectState::new(shared.config.reconnect);
    debug!(url = %shared.config.url, "connect loop started");

    while !shared.is_stopping() {
        let attempt = reconnect.begin_attempt();
        shared.set_state(ConnectionState::Connecting);
        debug!(url = %shared.config.url, attempt, "connecting");

        let opened = tokio::select! {
            biased;
            () = shared.stop.cancelled() => break,
            opened = tokio::time::timeout(shared.config.connect_timeout, open(&shared)) => {
                opened.unwrap_or(Err(WebSocketError::Timeout))
            }
        };

        match opened {
            Ok((stream, negotiated)) => {
                reconnect.connected();
                let end = serve(&shared, stream, negotiated).await;
                let (message, detail) = end.describe();
                shared.set_state(ConnectionState::Closed);
                shared.listener.on_disconnect(message, detail).await;
            }
            Err(err) if err.is_fatal() => {
                error!(url = %shared.config.url, error = %err, "fatal connection error, not retrying");
                shared.set_state(ConnectionState::Idle);
                shared
                    .listener
                    .on_disconnect("connection failed".to_string(), Some(err.to_string()))
                    .await;
                return;
            }
            Err(err) => {
                warn!(url = %shared.config.url, attempt, error = %err, "connection attempt failed");
                reconnect.record_failure(&err);
                shared.set_state(ConnectionState::Closed);
                shared
                    .listener
                    .on_disconnect("connection failed".to_string(), Some(err.to_string()))
                    .await;
            }
        }

        if shared.is_stopping() {
            break;
        }
        let Some(delay) = reconnect.next_delay() else {
            warn!(attempts = reconnect.attempt(), "giving up after repeated connection failures");
            shared.set_state(ConnectionState::Idle);
            return;
        };
        debug!(delay = ?delay, "waiting before reconnect");
        tokio::select! {
            biased;
            () = shared.stop.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    shared.set_state(ConnectionState::Closed);
    debug!("connect loop exited");
}

async fn open(shared: &Shared) -> Result<(BufReader<BoxedStream>, Negotiated)> {
    let stream = shared.connector.connect(&shared.target).await?;
    let mut stream = BufReader::new(stream);
    let negotiated = handshake(&mut stream, &shared.target, &shared.config.headers).await?;
    Ok((stream, negotiated))
}

async fn serve(
    shared: &Shared,
    stream: BufReader<BoxedStream>,
    negotiated: Negotiated,
) -> SessionEnd {
    let (reader, write_half) = tokio::io::split(stream);
    let writer = Arc::new(FrameWriter::new(
        write_half,
        negotiated.compression,
        shared.config.compression_threshold,
    ));
    *shared.writer.lock().await = Some(Arc::clone(&writer));
    shared.set_state(ConnectionState::Open);
    info!(
        url = %shared.config.url,
        compression = negotiated.compression,
        "WebSocket connection established"
    );
    shared.listener.on_connect().await;

    let keepalive = if shared.config.client_pings {
        Keepalive::spawn(Arc::clone(&writer), shared.config.keepalive)
    } else {
        Keepalive::disabled()
    };
    let session = Session::new(
        reader,
        Arc::clone(&writer),
        keepalive,
        Arc::clone(&shared.listener),
        shared.config.max_message_size,
        negotiated.compression,
    );
    let end = session.run(&shared.stop).await;

    *shared.writer.lock().await = None;
    writer.shutdown().await;
    match &end {
        SessionEnd::Error(e) => error!(url = %shared.config.url, error = %e, "connection failed"),
        SessionEnd::PongTimeout => warn!(url = %shared.config.url, "connection timed out"),
        _ => info!(url = %shared.config.url, end = ?end, "WebSocket connection closed"),
    }
    end
}

// ── Tests ───────────────────────────────────────────────────────────

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
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct Refusing {
        attempts: Arc<AtomicU32>,
        fatal: bool,
    }

    #[async_trait]
    impl Connector for Refusing {
        async fn connect(&self, _target: &Target) -> Result<BoxedStream> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fatal {
                Err(WebSocketError::Tls("unknown issuer".into()))
            } else {
                Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into())
            }
        }
    }

    fn client(fatal: bool) -> (WebSocketClient, mpsc::Receiver<Event>, Arc<AtomicU32>) {
        let attempts = Arc::new(AtomicU32::new(0));
        let (listener, events) = ChannelListener::new(64);
        let client = WebSocketClient::with_connector(
            ClientConfig::new("wss://example.invalid/ws"),
            Arc::new(listener),
            Arc::new(Refusing {
                attempts: Arc::clone(&attempts),
                fatal,
            }),
        )
        .unwrap();
        (client, events, attempts)
    }

    #[test]
    fn rejects_invalid_configuration() {
        let listener = Arc::new(ChannelListener::new(1).0);
        let bad_url = WebSocketClient::with_connector(
            ClientConfig::new("http://example.com"),
            listener.clone(),
            Arc::new(Refusing {
                attempts: Arc::default(),
                fatal: false,
            }),
        );
        assert!(matches!(bad_url, Err(WebSocketError::InvalidUrl(_))));

        let bad_header = WebSocketClient::with_connector(
            ClientConfig::new("ws://example.com").with_header("X-A", "1\r\n"),
            listener,
            Arc::new(Refusing {
                attempts: Arc::default(),
                fatal: false,
            }),
        );
        assert!(matches!(bad_header, Err(WebSocketError::InvalidHeader { .. })));
    }

    #[tokio::test]
    async fn write_before_connect_is_not_connected() {
        let (client, _events, _) = client(false);
        assert_eq!(client.state(), ConnectionState::Idle);
        assert!(matches!(
            client.write("hello").await,
            Err(WebSocketError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failure_stops_after_one_attempt() {
        let (client, mut events, attempts) = client(true);
        client.start();

        let event = events.recv().await.unwrap();
        assert!(matches!(event, Event::Disconnected { ref detail, .. }
            if detail.as_deref().is_some_and(|d| d.contains("unknown issuer"))));

        let mut state = client.watch_state();
        state
            .wait_for(|state| *state == ConnectionState::Idle)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_interrupts_backoff() {
        let (client, mut events, attempts) = client(false);
        client.start();
        assert!(matches!(events.recv().await, Some(Event::Disconnected { .. })));

        client.disconnect().await;
        let after = attempts.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), after);
        assert_eq!(client.state(), ConnectionState::Closed);

        client.start();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), after);
    }
}
