//! permessage-deflate (RFC7692) payload transforms.
//!
//! Both directions run without context takeover: every message gets a
//! fresh raw-DEFLATE (no zlib header) compressor or decompressor.
//!
//! Outgoing payloads are compressed with a sync flush, which always ends
//! the stream with an empty stored block `00 00 FF FF`. Those four bytes are
//! removed before framing, as RFC7692 §7.2.1 requires. If the tail is ever
//! missing (a stream ended by a final block), a single `0x00` is appended
//! instead; that is the same empty stored block appended and then trimmed.
//!
//! Incoming payloads get the trailer restored before inflating.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Result, WebSocketError};

/// The tail that a sync flush leaves on the stream and that the receiver restores.
pub const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

const CHUNK: usize = 4096;

fn to_usize(total: u64) -> usize {
    usize::try_from(total).unwrap_or(usize::MAX)
}

/// Compresses one message payload.
///
/// # Errors
///
/// Returns [`WebSocketError::Compression`] if the deflate stream fails.
pub fn deflate(payload: &[u8]) -> Result<Vec<u8>> {
    let mut compressor = Compress::new(Compression::default(), false);
    let mut out = Vec::with_capacity(payload.len() / 2 + CHUNK);

    loop {
        let input = payload
            .get(to_usize(compressor.total_in())..)
            .unwrap_or_default();
        compressor
            .compress_vec(input, &mut out, FlushCompress::Sync)
            .map_err(|e| WebSocketError::Compression(e.to_string()))?;

        let consumed = to_usize(compressor.total_in()) >= payload.len();
        if consumed && out.len() < out.capacity() {
            break;
        }
        out.reserve(CHUNK);
    }

    if out.ends_with(&DEFLATE_TRAILER) {
        out.truncate(out.len() - DEFLATE_TRAILER.len());
    } else {
        out.push(0x00);
    }
    Ok(out)
}

/// Decompresses one message payload, refusing output larger than `max_size`.
///
/// # Errors
///
/// Returns [`WebSocketError::Compression`] for corrupt or truncated input and
/// [`WebSocketError::PayloadTooLarge`] when the inflated size exceeds `max_size`.
pub fn inflate(payload: &[u8], max_size: usize) -> Result<Vec<u8>> {
    let mut input = Vec::with_capacity(payload.len() + DEFLATE_TRAILER.len());
    input.extend_from_slice(payload);
    input.extend_from_slice(&DEFLATE_TRAILER);

    let mut decompressor = Decompress::new(false);
    let mut out = Vec::with_capacity(payload.len().saturating_mul(3).clamp(CHUNK, max_size.max(CHUNK)));

    loop {
        let before_in = decompressor.total_in();
        let before_out = decompressor.total_out();
        let remaining = input
            .get(to_usize(before_in)..)
            .unwrap_or_default();

        let status = decompressor
            .decompress_vec(remaining, &mut out, FlushDecompress::Sync)
            .map_err(|e| WebSocketError::Compression(e.to_string()))?;

        if out.len() > max_size {
            return Err(WebSocketError::PayloadTooLarge {
                size: decompressor.total_out(),
                max: max_size,
            });
        }

        let drained = to_usize(decompressor.total_in()) >= input.len();
        if matches!(status, Status::StreamEnd) || (drained && out.len() < out.capacity()) {
            break;
        }
        let stalled =
            decompressor.total_in() == before_in && decompressor.total_out() == before_out;
        if stalled && out.len() < out.capacity() {
            return Err(WebSocketError::Compression(
                "truncated deflate stream".to_string(),
            ));
        }
        if out.len() == out.capacity() {
            out.reserve(CHUNK);
        }
    }

    Ok(out)
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

    const LIMIT: usize = 16 * 1024 * 1024;

    #[test]
    fn inflates_rfc7692_hello() {
        // RFC7692 §7.2.3.1
        let out = inflate(&[0xf2, 0x48, 0xcd, 0xc9, 0xc9, 0x07, 0x00], LIMIT).unwrap();
        assert_eq!(out, b"Hello");
    }

    #[test]
    fn inflates_rfc7692_final_block() {
        // Same payload with BFINAL set; the restored trailer is ignored.
        let out = inflate(&[0xf3, 0x48, 0xcd, 0xc9, 0xc9, 0x07, 0x00], LIMIT).unwrap();
        assert_eq!(out, b"Hello");
    }

    #[test]
    fn inflates_rfc7692_stored_block() {
        // RFC7692 §7.2.3.3
        let out = inflate(
            &[0x00, 0x05, 0x00, 0xfa, 0xff, 0x48, 0x65, 0x6c, 0x6c, 0x6f, 0x00],
            LIMIT,
        )
        .unwrap();
        assert_eq!(out, b"Hello");
    }

    #[test]
    fn sync_flush_tail_is_stripped() {
        let out = deflate(b"Hello").unwrap();
        assert!(!out.ends_with(&DEFLATE_TRAILER));
        assert_eq!(inflate(&out, LIMIT).unwrap(), b"Hello");
    }

    #[test]
    fn round_trip_arbitrary_bytes() {
        let mut seed = 0x2545_f491_u32;
        let noise: Vec<u8> = (0..50_000)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                seed as u8
            })
            .collect();
        let repetitive = "PRIVMSG #channel :hello chat\r\n".repeat(2000).into_bytes();

        for sample in [Vec::new(), vec![0u8], noise, repetitive] {
            let compressed = deflate(&sample).unwrap();
            assert_eq!(inflate(&compressed, LIMIT).unwrap(), sample);
        }
    }

    #[test]
    fn repetitive_payload_shrinks() {
        let payload = "{\"type\":\"MESSAGE\",\"data\":{}}".repeat(100);
        let compressed = deflate(payload.as_bytes()).unwrap();
        assert!(compressed.len() < payload.len() / 4);
    }

    #[test]
    fn each_message_is_independent() {
        let first = deflate(b"same words, same words").unwrap();
        let second = deflate(b"same words, same words").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn inflate_enforces_size_limit() {
        let payload = vec![b'z'; 100_000];
        let compressed = deflate(&payload).unwrap();
        let err = inflate(&compressed, 10_000).unwrap_err();
        assert!(matches!(err, WebSocketError::PayloadTooLarge { max: 10_000, .. }));
    }

    #[test]
    fn inflate_rejects_garbage() {
        let err = inflate(&[0xff, 0xff, 0xff, 0xff, 0xff], LIMIT).unwrap_err();
        assert!(matches!(err, WebSocketError::Compression(_)));
    }
}
