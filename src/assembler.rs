//! Reassembly of fragmented data frames into text messages.
//!
//! Only the first frame of a message carries RSV1, so the accumulator
//! records it and every continuation inherits it. A compressed message is a
//! single DEFLATE stream split across frames: fragments are concatenated and
//! inflated once, when the final frame arrives.

use tracing::warn;

use crate::deflate;
use crate::error::{Result, WebSocketError};
use crate::frame::{Frame, Opcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Text,
    Binary,
}

/// In-progress message state, owned by the read loop.
#[derive(Debug)]
pub(crate) struct MessageAccumulator {
    buffer: Vec<u8>,
    compressed: bool,
    pending: Option<Pending>,
    deflate_negotiated: bool,
    max_message_size: usize,
}

impl MessageAccumulator {
    pub(crate) fn new(max_message_size: usize, deflate_negotiated: bool) -> Self {
        Self {
            buffer: Vec::new(),
            compressed: false,
            pending: None,
            deflate_negotiated,
            max_message_size,
        }
    }

    /// Feeds one data frame. Returns the decoded text when `frame.fin` completes it.
    pub(crate) fn push(&mut self, frame: Frame) -> Result<Option<String>> {
        let result = self.push_inner(frame);
        if result.is_err() {
            self.clear();
        }
        result
    }

    fn push_inner(&mut self, frame: Frame) -> Result<Option<String>> {
        match frame.opcode {
            Opcode::Text | Opcode::Binary => {
                if self.pending.is_some() {
                    return Err(WebSocketError::ProtocolViolation(
                        "new data frame while a fragmented message is open",
                    ));
                }
                self.pending = Some(if frame.opcode == Opcode::Text {
                    Pending::Text
                } else {
                    Pending::Binary
                });
                self.compressed = self.deflate_negotiated && frame.compressed;
            }
            Opcode::Continuation => {
                if self.pending.is_none() {
                    return Err(WebSocketError::ProtocolViolation(
                        "continuation frame without a message to continue",
                    ));
                }
            }
            Opcode::Close | Opcode::Ping | Opcode::Pong => {
                return Err(WebSocketError::ProtocolViolation(
                    "control frame passed to the message accumulator",
                ));
            }
        }

        if self.pending == Some(Pending::Binary) {
            if frame.fin {
                warn!("skipping unsupported binary message");
                self.clear();
            }
            return Ok(None);
        }

        let total = self.buffer.len() + frame.payload.len();
        if total > self.max_message_size {
            return Err(WebSocketError::PayloadTooLarge {
                size: total as u64,
                max: self.max_message_size,
            });
        }
        self.buffer.extend_from_slice(&frame.payload);

        if !frame.fin {
            return Ok(None);
        }

        let bytes = if self.compressed {
            deflate::inflate(&self.buffer, self.max_message_size)?
        } else {
            std::mem::take(&mut self.buffer)
        };
        self.clear();

        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err.utf8_error(), "text message is not valid UTF-8, replacing invalid sequences");
                String::from_utf8_lossy(err.as_bytes()).into_owned()
            }
        };
        Ok(Some(text))
    }

    /// Whether a fragmented message is in progress.
    pub(crate) fn is_open(&self) -> bool {
        self.pending.is_some()
    }

    fn clear(&mut self) {
        self.buffer.clear();
        self.compressed = false;
        self.pending = None;
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

    const LIMIT: usize = 1 << 20;

    fn data(opcode: Opcode, payload: &[u8], fin: bool, compressed: bool) -> Frame {
        Frame {
            fin,
            compressed,
            opcode,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn single_frame_message() {
        let mut acc = MessageAccumulator::new(LIMIT, false);
        let text = acc.push(Frame::text("PING :tmi.twitch.tv")).unwrap();
        assert_eq!(text.as_deref(), Some("PING :tmi.twitch.tv"));
        assert!(!acc.is_open());
    }

    #[test]
    fn reassembles_fragments_in_order() {
        let mut acc = MessageAccumulator::new(LIMIT, false);
        assert!(acc.push(data(Opcode::Text, b"Hel", false, false)).unwrap().is_none());
        for part in [b"lo".as_slice(), b", ".as_slice(), b"w\xC3".as_slice()] {
            assert!(acc.push(Frame::continuation(part, false)).unwrap().is_none());
            assert!(acc.is_open());
        }
        let text = acc.push(Frame::continuation(b"\xA9rld", true)).unwrap();
        assert_eq!(text.as_deref(), Some("Hello, w\u{e9}rld"));
        assert!(!acc.is_open());
    }

    #[test]
    fn compressed_flag_is_inherited_by_continuations() {
        let message = "{\"type\":\"reward-redeemed\",\"user\":\"someone\"}".repeat(40);
        let compressed = deflate::deflate(message.as_bytes()).unwrap();
        let (head, tail) = compressed.split_at(compressed.len() / 3);
        let (middle, last) = tail.split_at(tail.len() / 2);

        let mut acc = MessageAccumulator::new(LIMIT, true);
        assert!(acc.push(data(Opcode::Text, head, false, true)).unwrap().is_none());
        assert!(acc.push(Frame::continuation(middle, false)).unwrap().is_none());
        let text = acc.push(Frame::continuation(last, true)).unwrap();
        assert_eq!(text.as_deref(), Some(message.as_str()));
    }

    #[test]
    fn flag_is_reset_after_each_message() {
        let mut acc = MessageAccumulator::new(LIMIT, true);
        let compressed = deflate::deflate(b"first").unwrap();
        assert_eq!(
            acc.push(data(Opcode::Text, &compressed, true, true)).unwrap().as_deref(),
            Some("first")
        );
        assert_eq!(
            acc.push(data(Opcode::Text, b"second", true, false)).unwrap().as_deref(),
            Some("second")
        );
    }

    #[test]
    fn rsv1_ignored_without_negotiation() {
        let mut acc = MessageAccumulator::new(LIMIT, false);
        let text = acc.push(data(Opcode::Text, b"plain", true, true)).unwrap();
        assert_eq!(text.as_deref(), Some("plain"));
    }

    #[test]
    fn continuation_without_start_is_rejected() {
        let mut acc = MessageAccumulator::new(LIMIT, false);
        let err = acc.push(Frame::continuation(b"orphan", true)).unwrap_err();
        assert!(matches!(err, WebSocketError::ProtocolViolation(_)));
    }

    #[test]
    fn new_text_while_fragmented_is_rejected_and_state_cleared() {
        let mut acc = MessageAccumulator::new(LIMIT, false);
        acc.push(data(Opcode::Text, b"part", false, false)).unwrap();
        let err = acc.push(Frame::text("interrupt")).unwrap_err();
        assert!(matches!(err, WebSocketError::ProtocolViolation(_)));
        assert!(!acc.is_open());
    }

    #[test]
    fn binary_messages_are_skipped() {
        let mut acc = MessageAccumulator::new(LIMIT, false);
        assert!(acc.push(data(Opcode::Binary, &[1, 2], false, false)).unwrap().is_none());
        assert!(acc.push(Frame::continuation(vec![3u8], true)).unwrap().is_none());
        assert!(!acc.is_open());
        assert_eq!(acc.push(Frame::text("after")).unwrap().as_deref(), Some("after"));
    }

    #[test]
    fn accumulated_size_is_capped() {
        let mut acc = MessageAccumulator::new(8, false);
        acc.push(data(Opcode::Text, b"12345", false, false)).unwrap();
        let err = acc.push(Frame::continuation(b"6789", true)).unwrap_err();
        assert!(matches!(err, WebSocketError::PayloadTooLarge { size: 9, max: 8 }));
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut acc = MessageAccumulator::new(LIMIT, false);
        let text = acc.push(data(Opcode::Text, b"ok\xFF", true, false)).unwrap();
        assert_eq!(text.as_deref(), Some("ok\u{FFFD}"));
    }
}
