//! Serialized write half of a connection.
//!
//! Application writes, keepalive pings and control replies from the read
//! loop all share one [`FrameWriter`]. Each frame is encoded into a single
//! buffer and written while the sink lock is held, so frames never
//! interleave on the wire.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::deflate;
use crate::error::{Result, WebSocketError};
use crate::frame::{Frame, Opcode};

type Sink = Box<dyn AsyncWrite + Send + Unpin>;

struct Inner {
    sink: Sink,
    close_sent: bool,
}

pub(crate) struct FrameWriter {
    inner: Mutex<Inner>,
    compression: bool,
    compression_threshold: usize,
}

impl FrameWriter {
    pub(crate) fn new<W>(sink: W, compression: bool, compression_threshold: usize) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Mutex::new(Inner {
                sink: Box::new(sink),
                close_sent: false,
            }),
            compression,
            compression_threshold,
        }
    }

    /// Sends a Text message, compressed when negotiated and long enough.
    pub(crate) async fn send_text(&self, text: &str) -> Result<()> {
        let mut frame = Frame::text(text);
        if self.compression && text.len() >= self.compression_threshold {
            frame.payload = deflate::deflate(text.as_bytes())?;
            frame.compressed = true;
        }
        self.send_frame(&frame).await.map(drop)
    }

    pub(crate) async fn send_ping(&self, payload: Vec<u8>) -> Result<()> {
        self.send_frame(&Frame::ping(payload)).await.map(drop)
    }

    pub(crate) async fn send_pong(&self, payload: Vec<u8>) -> Result<()> {
        self.send_frame(&Frame::pong(payload)).await.map(drop)
    }

    /// Sends a Close frame unless one was already sent. Returns whether it was written.
    pub(crate) async fn send_close(&self, payload: &[u8]) -> Result<bool> {
        self.send_frame(&Frame::close_raw(payload.to_vec())).await
    }

    /// Best-effort shutdown of the write direction.
    pub(crate) async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        if let Err(e) = inner.sink.shutdown().await {
            debug!(error = %e, "write half shutdown failed");
        }
    }

    async fn send_frame(&self, frame: &Frame) -> Result<bool> {
        let bytes = frame.encode(Some(rand::random::<[u8; 4]>()))?;
        let mut inner = self.inner.lock().await;
        if inner.close_sent {
            if frame.opcode == Opcode::Close {
                return Ok(false);
            }
            return Err(WebSocketError::NotConnected);
        }
        if frame.opcode == Opcode::Close {
            inner.close_sent = true;
        }
        inner.sink.write_all(&bytes).await?;
        inner.sink.flush().await?;
        Ok(true)
    }
}

impl std::fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter")
            .field("compression", &self.compression)
            .field("compression_threshold", &self.compression_threshold)
            .finish_non_exhaustive()
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
    use crate::frame::{read_frame, CLOSE_NORMAL};
    use std::sync::Arc;
    use tokio::io::duplex;

    const LIMIT: usize = 1 << 20;

    #[tokio::test]
    async fn short_text_is_sent_uncompressed_and_masked() {
        let (client, mut server) = duplex(4096);
        let writer = FrameWriter::new(client, true, 1024);
        writer.send_text("JOIN #channel").await.unwrap();

        let mut header = [0u8; 2];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut header).await.unwrap();
        assert_eq!(header[0], 0x81);
        assert_eq!(header[1] & 0x80, 0x80);
    }

    #[tokio::test]
    async fn long_text_is_compressed_when_negotiated() {
        let (client, mut server) = duplex(64 * 1024);
        let writer = FrameWriter::new(client, true, 1024);
        let text = "{\"type\":\"LISTEN\",\"nonce\":\"abc\"}".repeat(64);
        writer.send_text(&text).await.unwrap();

        let frame = read_frame(&mut server, LIMIT).await.unwrap().unwrap();
        assert!(frame.compressed);
        assert!(frame.payload.len() < text.len());
        assert_eq!(deflate::inflate(&frame.payload, LIMIT).unwrap(), text.as_bytes());
    }

    #[tokio::test]
    async fn compression_starts_at_threshold() {
        let (client, mut server) = duplex(64 * 1024);
        let writer = FrameWriter::new(client, true, 1024);

        let below = "a".repeat(1023);
        writer.send_text(&below).await.unwrap();
        let frame = read_frame(&mut server, LIMIT).await.unwrap().unwrap();
        assert!(!frame.compressed);
        assert_eq!(frame.payload, below.as_bytes());

        let at = "a".repeat(1024);
        writer.send_text(&at).await.unwrap();
        let frame = read_frame(&mut server, LIMIT).await.unwrap().unwrap();
        assert!(frame.compressed);
        assert_eq!(deflate::inflate(&frame.payload, LIMIT).unwrap(), at.as_bytes());
    }

    #[tokio::test]
    async fn long_text_is_plain_without_negotiation() {
        let (client, mut server) = duplex(64 * 1024);
        let writer = FrameWriter::new(client, false, 1024);
        let text = "x".repeat(4096);
        writer.send_text(&text).await.unwrap();

        let frame = read_frame(&mut server, LIMIT).await.unwrap().unwrap();
        assert!(!frame.compressed);
        assert_eq!(frame.payload, text.as_bytes());
    }

    #[tokio::test]
    async fn close_is_sent_once_and_blocks_further_writes() {
        let (client, mut server) = duplex(4096);
        let writer = FrameWriter::new(client, false, 1024);
        assert!(writer.send_close(&CLOSE_NORMAL.to_be_bytes()).await.unwrap());
        assert!(!writer.send_close(&CLOSE_NORMAL.to_be_bytes()).await.unwrap());
        assert!(matches!(
            writer.send_text("late").await,
            Err(WebSocketError::NotConnected)
        ));

        let frame = read_frame(&mut server, LIMIT).await.unwrap().unwrap();
        assert_eq!(frame.close_code(), Some(CLOSE_NORMAL));
        writer.shutdown().await;
        assert!(read_frame(&mut server, LIMIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_writers_never_interleave() {
        let (client, mut server) = duplex(1 << 20);
        let writer = Arc::new(FrameWriter::new(client, false, usize::MAX));

        let mut tasks = Vec::new();
        for id in 0..8u8 {
            let writer = Arc::clone(&writer);
            tasks.push(tokio::spawn(async move {
                let line = char::from(b'a' + id).to_string().repeat(20_000);
                for _ in 0..4 {
                    writer.send_text(&line).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        for _ in 0..32 {
            let frame = read_frame(&mut server, LIMIT).await.unwrap().unwrap();
            let first = frame.payload[0];
            assert!(frame.payload.iter().all(|&b| b == first));
            assert_eq!(frame.payload.len(), 20_000);
        }
    }
}
