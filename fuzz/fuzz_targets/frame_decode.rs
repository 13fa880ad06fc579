//! Fuzz target for `FrameDecoder::push`/`next_frame`.
//!
//! Feeds arbitrary byte chunks through the streaming length-prefixed decoder
//! to find parser panics, integer overflows in the length prefix, or buffer
//! over-reads. The decoder should never panic; invalid lengths return
//! `ProtocolError::FrameTooLarge` and poison the decoder instead.

#![no_main]

use libfuzzer_sys::fuzz_target;
use qwormhole_proto::FrameDecoder;

fuzz_target!(|data: &[u8]| {
    let mut decoder = FrameDecoder::with_default_max_frame_length();
    if decoder.push(data).is_err() {
        return;
    }
    while let Ok(Some(_payload)) = decoder.next_frame() {
        // Keep draining; a single chunk may contain many frames.
    }
});
