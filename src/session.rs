//! Read loop of one open connection.
//!
//! The session is the only reader of the socket and the only owner of the
//! [`MessageAccumulator`]. It answers control frames inline through the
//! shared [`FrameWriter`] and hands completed text messages to the
//! listener. It ends on end of stream, a server Close, a pong timeout, a
//! stop request or an error, and reports which as a [`SessionEnd`].

use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::assembler::MessageAccumulator;
use crate::error::WebSocketError;
use crate::frame::{read_frame, Frame, Opcode};
use crate::keepalive::Keepalive;
use crate::listener::Listener;
use crate::writer::FrameWriter;

#[derive(Debug)]
pub(crate) enum SessionEnd {
    /// The stream ended without a Close frame.
    Eof,
    /// The server sent Close, with its status code if it carried one.
    ServerClosed(Option<u16>),
    PongTimeout,
    /// The client was asked to stop.
    Stopped,
    Error(WebSocketError),
}

impl SessionEnd {
    /// `(message, detail)` for [`Listener::on_disconnect`].
    pub(crate) fn describe(&self) -> (String, Option<String>) {
        match self {
            Self::Eof => ("connection closed".to_string(), None),
            Self::ServerClosed(code) => (
                "closed by server".to_string(),
                code.map(|code| format!("close code {code}")),
            ),
            Self::PongTimeout => (
                "connection lost".to_string(),
                Some(WebSocketError::PongTimeout.to_string()),
            ),
            Self::Stopped => ("disconnected".to_string(), None),
            Self::Error(err) => ("connection lost".to_string(), Some(err.to_string())),
        }
    }
}

pub(crate) struct Session<R> {
    reader: R,
    writer: Arc<FrameWriter>,
    keepalive: Keepalive,
    accumulator: MessageAccumulator,
    listener: Arc<dyn Listener>,
    max_message_size: usize,
}

impl<R> Session<R>
where
    R: AsyncRead + Unpin,
{
    pub(crate) fn new(
        reader: R,
        writer: Arc<FrameWriter>,
        keepalive: Keepalive,
        listener: Arc<dyn Listener>,
        max_message_size: usize,
        compression: bool,
    ) -> Self {
        Self {
            reader,
            writer,
            keepalive,
            accumulator: MessageAccumulator::new(max_message_size, compression),
            listener,
            max_message_size,
        }
    }

    pub(crate) async fn run(mut self, stop: &CancellationToken) -> SessionEnd {
        debug!("read loop started");
        let end = loop {
            let next = tokio::select! {
                biased;
                () = stop.cancelled() => break SessionEnd::Stopped,
                () = self.keepalive.expired() => break SessionEnd::PongTimeout,
                next = read_frame(&mut self.reader, self.max_message_size) => next,
            };
            match next {
                Ok(Some(frame)) => {
                    if let Some(end) = self.handle(frame).await {
                        break end;
                    }
                }
                Ok(None) => {
                    if self.accumulator.is_open() {
                        debug!("stream ended inside a fragmented message");
                    }
                    break SessionEnd::Eof;
                }
                Err(e) => break SessionEnd::Error(e),
            }
        };
        self.keepalive.cancel();
        debug!(end = ?end, "read loop exited");
        end
    }

    async fn handle(&mut self, frame: Frame) -> Option<SessionEnd> {
        match frame.opcode {
            Opcode::Ping => {
                debug!(len = frame.payload.len(), "ping received, replying");
                if let Err(e) = self.writer.send_pong(frame.payload).await {
                    return Some(SessionEnd::Error(e));
                }
            }
            Opcode::Pong => {
                debug!("pong received");
                self.keepalive.pong_received();
            }
            Opcode::Close => {
                let code = frame.close_code();
                let echo = frame.payload.get(..2).unwrap_or_default();
                match self.writer.send_close(echo).await {
                    Ok(true) => debug!(code = ?code, "server closed, close echoed"),
                    Ok(false) => debug!(code = ?code, "server acknowledged our close"),
                    Err(e) => warn!(error = %e, "failed to echo close frame"),
                }
                return Some(SessionEnd::ServerClosed(code));
            }
            Opcode::Text | Opcode::Binary | Opcode::Continuation => {
                match self.accumulator.push(frame) {
                    Ok(Some(text)) => self.listener.on_message(text).await,
                    Ok(None) => {}
                    Err(e) => return Some(SessionEnd::Error(e)),
                }
            }
        }
        None
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
    use crate::listener::{ChannelListener, Event};
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    const LIMIT: usize = 1 << 20;

    struct Harness {
        /// Server writes frames here; the session reads them.
        to_client: DuplexStream,
        /// Frames the session wrote.
        from_client: DuplexStream,
        events: mpsc::Receiver<Event>,
        session: Session<DuplexStream>,
    }

    fn harness(compression: bool) -> Harness {
        let (session_reader, to_client) = duplex(64 * 1024);
        let (session_writer, from_client) = duplex(64 * 1024);
        let (listener, events) = ChannelListener::new(16);
        let session = Session::new(
            session_reader,
            Arc::new(FrameWriter::new(session_writer, compression, 1024)),
            Keepalive::disabled(),
            Arc::new(listener),
            LIMIT,
            compression,
        );
        Harness {
            to_client,
            from_client,
            events,
            session,
        }
    }

    async fn send(stream: &mut DuplexStream, frame: Frame) {
        stream.write_all(&frame.encode(None).unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn ping_gets_identical_pong_and_no_message() {
        let Harness {
            mut to_client,
            mut from_client,
            mut events,
            session,
        } = harness(false);
        let stop = CancellationToken::new();

        send(&mut to_client, Frame::ping(b"keepalive-7".to_vec())).await;
        drop(to_client);
        let end = session.run(&stop).await;
        assert!(matches!(end, SessionEnd::Eof));

        let pong = read_frame(&mut from_client, LIMIT).await.unwrap().unwrap();
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(pong.payload, b"keepalive-7");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_is_echoed_with_status_code() {
        let Harness {
            mut to_client,
            mut from_client,
            session,
            ..
        } = harness(false);
        let stop = CancellationToken::new();

        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        send(&mut to_client, Frame::close_raw(payload)).await;
        let end = session.run(&stop).await;
        assert!(matches!(end, SessionEnd::ServerClosed(Some(1000))));

        let echo = read_frame(&mut from_client, LIMIT).await.unwrap().unwrap();
        assert_eq!(echo.opcode, Opcode::Close);
        assert_eq!(echo.payload, 1000u16.to_be_bytes());
    }

    #[tokio::test]
    async fn fragmented_compressed_message_is_delivered_once() {
        let Harness {
            mut to_client,
            mut events,
            session,
            ..
        } = harness(true);
        let stop = CancellationToken::new();

        let text = "@badge-info=;color=#FF0000 :nick!nick@nick.tmi.twitch.tv PRIVMSG #chan :hi\r\n"
            .repeat(20);
        let compressed = crate::deflate::deflate(text.as_bytes()).unwrap();
        let (head, tail) = compressed.split_at(compressed.len() / 2);
        let mut first = Frame::text(String::new());
        first.payload = head.to_vec();
        first.fin = false;
        first.compressed = true;
        send(&mut to_client, first).await;
        send(&mut to_client, Frame::continuation(tail, true)).await;
        drop(to_client);

        session.run(&stop).await;
        assert_eq!(events.recv().await, Some(Event::Message(text)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn protocol_error_ends_session() {
        let Harness {
            mut to_client,
            session,
            ..
        } = harness(false);
        let stop = CancellationToken::new();

        to_client.write_all(&[0x83, 0x00]).await.unwrap();
        let end = session.run(&stop).await;
        assert!(matches!(end, SessionEnd::Error(WebSocketError::InvalidOpcode(3))));
    }

    #[tokio::test]
    async fn stop_unblocks_pending_read() {
        let Harness {
            to_client, session, ..
        } = harness(false);
        let stop = CancellationToken::new();
        let running = tokio::spawn({
            let stop = stop.clone();
            async move { session.run(&stop).await }
        });

        // Nothing has been written, so the session sits in `read_frame`.
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
        assert!(!running.is_finished());

        stop.cancel();
        let end = running.await.unwrap();
        assert!(matches!(end, SessionEnd::Stopped));
        drop(to_client);
    }

    #[test]
    fn describe_reports_close_code_and_errors() {
        let (message, detail) = SessionEnd::ServerClosed(Some(4000)).describe();
        assert_eq!(message, "closed by server");
        assert_eq!(detail.as_deref(), Some("close code 4000"));

        let (_, detail) = SessionEnd::PongTimeout.describe();
        assert_eq!(detail.as_deref(), Some("pong timeout"));

        let (_, detail) = SessionEnd::Error(WebSocketError::ProtocolViolation("x")).describe();
        assert_eq!(detail.as_deref(), Some("protocol violation: x"));
    }
}
