//! Callbacks delivered by the client.
//!
//! A [`Listener`] receives three notifications, all from the client's
//! background task: connection opened, text message received, connection
//! ended. Each hook has a no-op default, so consumers implement only what
//! they need.
//!
//! [`ChannelListener`] adapts the hooks into [`Event`]s on a bounded
//! channel for consumers that prefer a receive loop:
//!
//! ```rust,no_run
//! # async fn example() -> deflate_ws_client::Result<()> {
//! use deflate_ws_client::{ClientConfig, Event, WebSocketClient};
//!
//! let (client, mut events) =
//!     WebSocketClient::with_events(ClientConfig::new("wss://irc-ws.chat.twitch.tv"))?;
//! client.start();
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         Event::Connected => client.write("NICK justinfan12345").await?,
//!         Event::Message(text) => println!("{text}"),
//!         Event::Disconnected { message, .. } => eprintln!("disconnected: {message}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Receives connection lifecycle and message notifications.
///
/// Hooks are awaited inline on the read loop, so a slow hook delays reading
/// the next frame. They must not await
/// [`WebSocketClient::disconnect`](crate::WebSocketClient::disconnect);
/// spawn it instead.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// The upgrade completed and the connection is open.
    async fn on_connect(&self) {}

    /// A complete text message arrived.
    async fn on_message(&self, _text: String) {}

    /// A connection ended or a connection attempt failed.
    ///
    /// `detail` carries the underlying error or close code when there is one.
    async fn on_disconnect(&self, _message: String, _detail: Option<String>) {}
}

/// A notification emitted by [`ChannelListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// See [`Listener::on_connect`].
    Connected,
    /// See [`Listener::on_message`].
    Message(String),
    /// See [`Listener::on_disconnect`].
    Disconnected {
        /// Short description of why the connection ended.
        message: String,
        /// Underlying error or close code, if any.
        detail: Option<String>,
    },
}

/// A [`Listener`] that forwards every hook as an [`Event`] on a bounded channel.
///
/// When the channel is full, `Connected` and `Message` events are dropped
/// with a warning. `Disconnected` waits for capacity and is never dropped.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::Sender<Event>,
}

impl ChannelListener {
    /// Create the listener and the receiving end. `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    fn emit(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(
                    "event channel full, dropping event: {:?}",
                    std::mem::discriminant(&dropped)
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("event channel closed, receiver dropped");
            }
        }
    }
}

#[async_trait]
impl Listener for ChannelListener {
    async fn on_connect(&self) {
        self.emit(Event::Connected);
    }

    async fn on_message(&self, text: String) {
        self.emit(Event::Message(text));
    }

    async fn on_disconnect(&self, message: String, detail: Option<String>) {
        let event = Event::Disconnected { message, detail };
        if self.tx.send(event).await.is_err() {
            debug!("event channel closed, receiver dropped");
        }
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

    struct Silent;

    impl Listener for Silent {}

    #[tokio::test]
    async fn default_hooks_are_no_ops() {
        let listener = Silent;
        listener.on_connect().await;
        listener.on_message("ignored".into()).await;
        listener.on_disconnect("gone".into(), None).await;
    }

    #[tokio::test]
    async fn forwards_hooks_in_order() {
        let (listener, mut rx) = ChannelListener::new(8);
        listener.on_connect().await;
        listener.on_message("PING :tmi.twitch.tv".into()).await;
        listener
            .on_disconnect("closed by server".into(), Some("close code 1000".into()))
            .await;

        assert_eq!(rx.recv().await, Some(Event::Connected));
        assert_eq!(rx.recv().await, Some(Event::Message("PING :tmi.twitch.tv".into())));
        assert_eq!(
            rx.recv().await,
            Some(Event::Disconnected {
                message: "closed by server".into(),
                detail: Some("close code 1000".into()),
            })
        );
    }

    #[tokio::test]
    async fn full_channel_drops_messages_but_not_disconnect() {
        let (listener, mut rx) = ChannelListener::new(0);
        listener.on_message("first".into()).await;
        listener.on_message("dropped".into()).await;

        let pending = tokio::spawn({
            let listener = listener.clone();
            async move { listener.on_disconnect("gone".into(), None).await }
        });

        assert_eq!(rx.recv().await, Some(Event::Message("first".into())));
        assert!(matches!(rx.recv().await, Some(Event::Disconnected { .. })));
        pending.await.unwrap();
    }

    #[tokio::test]
    async fn closed_receiver_is_ignored() {
        let (listener, rx) = ChannelListener::new(4);
        drop(rx);
        listener.on_message("nobody listening".into()).await;
        listener.on_disconnect("gone".into(), None).await;
    }
}
