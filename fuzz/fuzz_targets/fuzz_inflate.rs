#![no_main]

use deflate_ws_client::deflate::{deflate, inflate};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must never panic the inflater or overrun the limit.
    if let Ok(out) = inflate(data, 1 << 20) {
        assert!(out.len() <= 1 << 20);
    }

    // And arbitrary payloads must survive compression.
    if let Ok(compressed) = deflate(data) {
        assert_eq!(inflate(&compressed, usize::MAX).ok().as_deref(), Some(data));
    }
});
