//! RFC6455 frame encoding and decoding.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```
//!
//! RSV1 doubles as the permessage-deflate "compressed" bit. Extended lengths
//! are decoded as full `u64` values and checked against the caller's limit
//! before any payload is allocated.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Result, WebSocketError};

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Close status code for a normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

const FIN_BIT: u8 = 0x80;
const RSV1_BIT: u8 = 0x40;
const OPCODE_MASK: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LENGTH_MASK: u8 = 0x7F;
const LENGTH_U16: u8 = 126;
const LENGTH_U64: u8 = 127;

/// WebSocket frame opcode (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Continuation of a fragmented message.
    Continuation = 0x0,
    /// UTF-8 text data.
    Text = 0x1,
    /// Binary data. Decoded so the stream stays in sync, never delivered.
    Binary = 0x2,
    /// Connection close.
    Close = 0x8,
    /// Ping.
    Ping = 0x9,
    /// Pong.
    Pong = 0xA,
}

impl Opcode {
    /// Returns `true` for Close, Ping and Pong.
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Parses the low nibble of the first header byte.
    ///
    /// # Errors
    ///
    /// Returns [`WebSocketError::InvalidOpcode`] for reserved values.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(WebSocketError::InvalidOpcode(other)),
        }
    }
}

/// A single WebSocket frame with its payload already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag.
    pub fin: bool,
    /// RSV1: the payload is permessage-deflate compressed.
    pub compressed: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    fn new(opcode: Opcode, payload: Vec<u8>) -> Self {
        Self {
            fin: true,
            compressed: false,
            opcode,
            payload,
        }
    }

    /// An uncompressed, final text frame.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Opcode::Text, text.into().into_bytes())
    }

    /// A continuation frame.
    #[must_use]
    pub fn continuation(payload: impl Into<Vec<u8>>, fin: bool) -> Self {
        Self {
            fin,
            ..Self::new(Opcode::Continuation, payload.into())
        }
    }

    /// A ping frame.
    #[must_use]
    pub fn ping(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Ping, payload.into())
    }

    /// A pong frame.
    #[must_use]
    pub fn pong(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Pong, payload.into())
    }

    /// A close frame carrying only a status code.
    #[must_use]
    pub fn close(code: u16) -> Self {
        Self::new(Opcode::Close, code.to_be_bytes().to_vec())
    }

    /// A close frame with a raw payload, used to echo the peer's close.
    #[must_use]
    pub fn close_raw(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Close, payload.into())
    }

    /// The status code of a close frame, if it carries one.
    #[must_use]
    pub fn close_code(&self) -> Option<u16> {
        match (self.opcode, self.payload.as_slice()) {
            (Opcode::Close, [hi, lo, ..]) => Some(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }

    /// Serializes the frame.
    ///
    /// With `Some(key)` the mask bit is set, the key is written after the
    /// length and the payload is XOR-ed with it. Clients always pass a key;
    /// `None` produces the unmasked server-side form.
    ///
    /// # Errors
    ///
    /// Returns [`WebSocketError::ControlFrameTooLarge`] for a control frame
    /// whose payload exceeds [`MAX_CONTROL_PAYLOAD`], and
    /// [`WebSocketError::ProtocolViolation`] for a fragmented control frame.
    pub fn encode(&self, mask_key: Option<[u8; 4]>) -> Result<Vec<u8>> {
        let len = self.payload.len();
        if self.opcode.is_control() {
            if len > MAX_CONTROL_PAYLOAD {
                return Err(WebSocketError::ControlFrameTooLarge(len));
            }
            if !self.fin {
                return Err(WebSocketError::ProtocolViolation(
                    "control frames cannot be fragmented",
                ));
            }
        }

        let mut out = Vec::with_capacity(len + 14);
        let mut first = self.opcode as u8;
        if self.fin {
            first |= FIN_BIT;
        }
        if self.compressed {
            first |= RSV1_BIT;
        }
        out.push(first);

        let mask = if mask_key.is_some() { MASK_BIT } else { 0 };
        if len <= usize::from(LENGTH_U16 - 1) {
            out.push(mask | len as u8);
        } else if let Ok(short) = u16::try_from(len) {
            out.push(mask | LENGTH_U16);
            out.extend_from_slice(&short.to_be_bytes());
        } else {
            out.push(mask | LENGTH_U64);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }

        match mask_key {
            Some(key) => {
                out.extend_from_slice(&key);
                let start = out.len();
                out.extend_from_slice(&self.payload);
                if let Some(body) = out.get_mut(start..) {
                    apply_mask(body, key);
                }
            }
            None => out.extend_from_slice(&self.payload),
        }
        Ok(out)
    }
}

/// XORs `payload` with `key`, cycling through the key bytes.
///
/// Applying the same key twice restores the original bytes.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (byte, k) in payload.iter_mut().zip(key.iter().cycle()) {
        *byte ^= k;
    }
}

/// Reads one frame from `reader`.
///
/// Returns `Ok(None)` when the stream ends cleanly before the first header
/// byte. Partial reads are retried until the frame is complete; EOF in the
/// middle of a frame is an error.
///
/// # Errors
///
/// Fails on I/O errors, reserved opcodes, oversized or fragmented control
/// frames, and payloads declared larger than `max_payload`.
pub async fn read_frame<R>(reader: &mut R, max_payload: usize) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut first = [0u8; 1];
    if reader.read(&mut first).await? == 0 {
        return Ok(None);
    }
    let [first] = first;
    let second = reader.read_u8().await?;

    let fin = first & FIN_BIT != 0;
    let compressed = first & RSV1_BIT != 0;
    let opcode = Opcode::from_u8(first & OPCODE_MASK)?;
    let masked = second & MASK_BIT != 0;

    let declared = match second & LENGTH_MASK {
        LENGTH_U16 => u64::from(reader.read_u16().await?),
        LENGTH_U64 => reader.read_u64().await?,
        literal => u64::from(literal),
    };

    if opcode.is_control() {
        if !fin {
            return Err(WebSocketError::ProtocolViolation(
                "control frames cannot be fragmented",
            ));
        }
        if declared > MAX_CONTROL_PAYLOAD as u64 {
            return Err(WebSocketError::ControlFrameTooLarge(
                usize::try_from(declared).unwrap_or(usize::MAX),
            ));
        }
    }

    let too_large = || WebSocketError::PayloadTooLarge {
        size: declared,
        max: max_payload,
    };
    if declared > max_payload as u64 {
        return Err(too_large());
    }
    let len = usize::try_from(declared).map_err(|_| too_large())?;

    let mask_key = if masked {
        let mut key = [0u8; 4];
        reader.read_exact(&mut key).await?;
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    if let Some(key) = mask_key {
        apply_mask(&mut payload, key);
    }

    Ok(Some(Frame {
        fin,
        compressed,
        opcode,
        payload,
    }))
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

    const KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];
    const LIMIT: usize = 1 << 20;

    async fn decode(bytes: &[u8]) -> Result<Option<Frame>> {
        let mut reader = bytes;
        read_frame(&mut reader, LIMIT).await
    }

    #[tokio::test]
    async fn text_round_trip_across_length_tiers() {
        for len in [0usize, 1, 125, 126, 65535, 65536] {
            let payload: Vec<u8> = (0..len).map(|i| b'a' + (i % 26) as u8).collect();
            let frame = Frame {
                fin: true,
                compressed: false,
                opcode: Opcode::Text,
                payload: payload.clone(),
            };
            let bytes = frame.encode(Some(KEY)).unwrap();
            let decoded = decode(&bytes).await.unwrap().unwrap();
            assert_eq!(decoded.payload, payload, "length {len}");
            assert_eq!(decoded.opcode, Opcode::Text);
            assert!(decoded.fin);
        }
    }

    #[test]
    fn length_code_tiers() {
        let short = Frame::text("a".repeat(125)).encode(Some(KEY)).unwrap();
        assert_eq!(short[1], MASK_BIT | 125);
        assert_eq!(short.len(), 2 + 4 + 125);

        let medium = Frame::text("a".repeat(126)).encode(Some(KEY)).unwrap();
        assert_eq!(medium[1], MASK_BIT | 126);
        assert_eq!(&medium[2..4], &126u16.to_be_bytes());

        let edge = Frame::text("a".repeat(65535)).encode(Some(KEY)).unwrap();
        assert_eq!(edge[1], MASK_BIT | 126);
        assert_eq!(&edge[2..4], &[0xFF, 0xFF]);

        let long = Frame::text("a".repeat(65536)).encode(Some(KEY)).unwrap();
        assert_eq!(long[1], MASK_BIT | 127);
        assert_eq!(&long[2..10], &65536u64.to_be_bytes());
    }

    #[test]
    fn masking_is_involutive() {
        let original = b"The quick brown fox jumps over the lazy dog".to_vec();
        let mut data = original.clone();
        apply_mask(&mut data, KEY);
        assert_ne!(data, original);
        apply_mask(&mut data, KEY);
        assert_eq!(data, original);
    }

    #[test]
    fn encoded_client_frame_is_masked() {
        let bytes = Frame::text("Hello").encode(Some(KEY)).unwrap();
        assert_eq!(bytes[0], FIN_BIT | 0x1);
        assert_eq!(bytes[1], MASK_BIT | 5);
        assert_eq!(&bytes[2..6], &KEY);
        let mut body = bytes[6..].to_vec();
        apply_mask(&mut body, KEY);
        assert_eq!(body, b"Hello");
    }

    #[tokio::test]
    async fn decodes_rfc6455_unmasked_hello() {
        let frame = decode(&[0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload, b"Hello");
    }

    #[tokio::test]
    async fn decodes_rfc6455_masked_hello() {
        let bytes = [
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];
        let frame = decode(&bytes).await.unwrap().unwrap();
        assert_eq!(frame.payload, b"Hello");
    }

    #[tokio::test]
    async fn rsv1_sets_compressed_flag() {
        let frame = decode(&[0xC1, 0x01, 0x00]).await.unwrap().unwrap();
        assert!(frame.compressed);
        assert!(frame.fin);
    }

    #[tokio::test]
    async fn clean_eof_before_header_is_none() {
        assert!(decode(&[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_frame_is_error() {
        let err = decode(&[0x81, 0x05, b'H', b'e']).await.unwrap_err();
        assert!(matches!(err, WebSocketError::Io(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn survives_partial_reads() {
        let bytes = Frame::text("fragmented transport").encode(None).unwrap();
        let mut builder = tokio_test::io::Builder::new();
        for chunk in bytes.chunks(3) {
            builder.read(chunk);
        }
        let mut reader = builder.build();
        let frame = read_frame(&mut reader, LIMIT).await.unwrap().unwrap();
        assert_eq!(frame.payload, b"fragmented transport");
    }

    #[tokio::test]
    async fn rejects_reserved_opcode() {
        let err = decode(&[0x83, 0x00]).await.unwrap_err();
        assert!(matches!(err, WebSocketError::InvalidOpcode(0x3)));
    }

    #[tokio::test]
    async fn rejects_fragmented_control_frame() {
        let err = decode(&[0x09, 0x00]).await.unwrap_err();
        assert!(matches!(err, WebSocketError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn rejects_oversized_control_frame() {
        let mut bytes = vec![0x89, 126];
        bytes.extend_from_slice(&126u16.to_be_bytes());
        bytes.extend(std::iter::repeat(0).take(126));
        let err = decode(&bytes).await.unwrap_err();
        assert!(matches!(err, WebSocketError::ControlFrameTooLarge(126)));
    }

    #[tokio::test]
    async fn rejects_payload_over_limit_before_allocating() {
        let mut bytes = vec![0x81, 127];
        bytes.extend_from_slice(&(1u64 << 40).to_be_bytes());
        let err = decode(&bytes).await.unwrap_err();
        assert!(matches!(
            err,
            WebSocketError::PayloadTooLarge { size, .. } if size == 1u64 << 40
        ));
    }

    #[test]
    fn refuses_to_encode_oversized_control_frame() {
        let err = Frame::ping(vec![0u8; 126]).encode(Some(KEY)).unwrap_err();
        assert!(matches!(err, WebSocketError::ControlFrameTooLarge(126)));
    }

    #[test]
    fn close_code_reads_first_two_bytes() {
        assert_eq!(Frame::close(CLOSE_NORMAL).close_code(), Some(1000));
        assert_eq!(Frame::close_raw(vec![0x03]).close_code(), None);
        let mut payload = 1001u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"going away");
        assert_eq!(Frame::close_raw(payload).close_code(), Some(1001));
    }

    #[tokio::test]
    async fn decodes_back_to_back_frames() {
        let mut bytes = Frame::ping(b"abc".to_vec()).encode(None).unwrap();
        bytes.extend(Frame::text("next").encode(None).unwrap());
        let mut reader = bytes.as_slice();
        let ping = read_frame(&mut reader, LIMIT).await.unwrap().unwrap();
        let text = read_frame(&mut reader, LIMIT).await.unwrap().unwrap();
        assert_eq!(ping.opcode, Opcode::Ping);
        assert_eq!(ping.payload, b"abc");
        assert_eq!(text.payload, b"next");
        assert!(read_frame(&mut reader, LIMIT).await.unwrap().is_none());
    }
}
