#![no_main]

use deflate_ws_client::frame::read_frame;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(runtime) = tokio::runtime::Builder::new_current_thread().build() else {
        return;
    };
    runtime.block_on(async {
        // Decode back-to-back frames until the input runs out or is rejected.
        let mut input = data;
        while let Ok(Some(frame)) = read_frame(&mut input, 64 * 1024).await {
            // Whatever decodes must encode again.
            let _ = frame.encode(None);
        }
    });
});
