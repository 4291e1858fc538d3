//! # Custom Connector Example
//!
//! Shows how to implement the [`Connector`] trait so the client runs over
//! something other than a TCP socket. Here each connection is an in-memory
//! pipe to a toy echo server living in the same process. Useful for:
//!
//! - **Testing**: drive your protocol consumer without a network
//! - **Custom transports**: proxies, Unix sockets, pre-established tunnels
//!
//! ## Running
//!
//! ```sh
//! cargo run --example custom_connector
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use deflate_ws_client::connector::{BoxedStream, Connector};
use deflate_ws_client::frame::{read_frame, Frame, Opcode};
use deflate_ws_client::handshake::compute_accept_key;
use deflate_ws_client::{ClientConfig, Listener, Target, WebSocketClient};
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;

// ─────────────────────────────────────────────────────────────────────
// Step 1: A connector that hands out in-memory pipes
// ─────────────────────────────────────────────────────────────────────

struct InMemoryConnector;

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(&self, target: &Target) -> deflate_ws_client::Result<BoxedStream> {
        println!("[connector] opening pipe for {}{}", target.host, target.path);
        let (client, server) = duplex(64 * 1024);
        tokio::spawn(echo_server(server));
        Ok(Box::new(client))
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 2: A toy server that upgrades and echoes text frames
// ─────────────────────────────────────────────────────────────────────

async fn echo_server(stream: DuplexStream) {
    let mut stream = BufReader::new(stream);
    let mut key = None;
    loop {
        let mut line = String::new();
        if stream.read_line(&mut line).await.unwrap_or(0) == 0 {
            return;
        }
        if line == "\r\n" {
            break;
        }
        if let Some(value) = line.strip_prefix("Sec-WebSocket-Key:") {
            key = Some(value.trim().to_string());
        }
    }
    let Some(key) = key else { return };
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        compute_accept_key(&key)
    );
    if stream.get_mut().write_all(response.as_bytes()).await.is_err() {
        return;
    }

    while let Ok(Some(frame)) = read_frame(&mut stream, 1 << 20).await {
        let reply = match frame.opcode {
            Opcode::Text => Frame::text(format!(
                "echo: {}",
                String::from_utf8_lossy(&frame.payload)
            )),
            Opcode::Close => Frame::close_raw(frame.payload),
            _ => continue,
        };
        let Ok(bytes) = reply.encode(None) else { return };
        if stream.get_mut().write_all(&bytes).await.is_err() {
            return;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 3: A listener that forwards messages to the main task
// ─────────────────────────────────────────────────────────────────────

struct Forwarder {
    connected: mpsc::UnboundedSender<()>,
    messages: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Listener for Forwarder {
    async fn on_connect(&self) {
        let _ = self.connected.send(());
    }

    async fn on_message(&self, text: String) {
        let _ = self.messages.send(text);
    }

    async fn on_disconnect(&self, message: String, detail: Option<String>) {
        println!("[listener] disconnected: {message} {detail:?}");
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 4: Wire it together
// ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (connected_tx, mut connected_rx) = mpsc::unbounded_channel();
    let (messages_tx, mut messages_rx) = mpsc::unbounded_channel();
    let listener = Forwarder {
        connected: connected_tx,
        messages: messages_tx,
    };

    let client = WebSocketClient::with_connector(
        ClientConfig::new("ws://in-memory.local/echo"),
        Arc::new(listener),
        Arc::new(InMemoryConnector),
    )?;
    client.start();

    connected_rx.recv().await.ok_or("never connected")?;
    for text in ["hello", "over a pipe", "goodbye"] {
        client.write(text).await?;
        let reply = messages_rx.recv().await.ok_or("no reply")?;
        println!("[main] {reply}");
    }

    client.disconnect().await;
    println!("[main] state after disconnect: {:?}", client.state());
    Ok(())
}
