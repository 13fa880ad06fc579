//! Fuzz target for length-prefix boundary conditions.
//!
//! # Strategy
//!
//! - Length prefix: zero, small, exactly at `max_frame_length`, just over,
//!   way over, `u32::MAX`.
//! - Payload content: arbitrary bytes, independent of the declared length.
//! - Delivery: fed in a single chunk, and split across many small chunks, to
//!   exercise the decoder's accumulation path the same way a slow socket
//!   would.
//!
//! # Invariants
//!
//! - A length prefix over `max_frame_length` MUST yield
//!   `ProtocolError::FrameTooLarge` and poison the decoder: every call after
//!   that returns the same error until `reset`.
//! - Chunked delivery of the same bytes MUST reach the same outcome as
//!   delivering them whole.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use qwormhole_proto::{DEFAULT_MAX_FRAME_LENGTH, FrameDecoder};

#[derive(Debug, Clone, Arbitrary)]
struct BoundaryFrame {
    length: DeclaredLength,
    payload: Vec<u8>,
    split_into: u8,
}

#[derive(Debug, Clone, Arbitrary)]
enum DeclaredLength {
    Zero,
    Small(u8),
    AtMaxBoundary,
    JustOverMax,
    WayOverMax,
    MaxU32,
    MatchesPayload,
}

fn whole_bytes(boundary: &BoundaryFrame) -> Vec<u8> {
    let declared: u32 = match boundary.length {
        DeclaredLength::Zero => 0,
        DeclaredLength::Small(n) => u32::from(n),
        DeclaredLength::AtMaxBoundary => DEFAULT_MAX_FRAME_LENGTH,
        DeclaredLength::JustOverMax => DEFAULT_MAX_FRAME_LENGTH.saturating_add(1),
        DeclaredLength::WayOverMax => DEFAULT_MAX_FRAME_LENGTH.saturating_add(1_000_000),
        DeclaredLength::MaxU32 => u32::MAX,
        #[allow(clippy::cast_possible_truncation)]
        DeclaredLength::MatchesPayload => boundary.payload.len() as u32,
    };

    let mut bytes = Vec::with_capacity(4 + boundary.payload.len());
    bytes.extend_from_slice(&declared.to_be_bytes());
    bytes.extend_from_slice(&boundary.payload);
    bytes
}

fn drain(decoder: &mut FrameDecoder) -> bool {
    loop {
        match decoder.next_frame() {
            Ok(Some(_)) => continue,
            Ok(None) => return false,
            Err(_) => return true,
        }
    }
}

fuzz_target!(|boundary: BoundaryFrame| {
    let bytes = whole_bytes(&boundary);

    let mut whole = FrameDecoder::with_default_max_frame_length();
    let whole_errored = whole.push(&bytes).is_err() || drain(&mut whole);

    let chunk_count = (boundary.split_into % 8).max(1) as usize;
    let mut chunked = FrameDecoder::with_default_max_frame_length();
    let mut chunked_errored = false;
    for chunk in bytes.chunks(bytes.len().div_ceil(chunk_count).max(1)) {
        if chunked.push(chunk).is_err() {
            chunked_errored = true;
            break;
        }
        if drain(&mut chunked) {
            chunked_errored = true;
            break;
        }
    }

    assert_eq!(whole_errored, chunked_errored, "chunked delivery must reach the same outcome as whole delivery");
    if whole_errored {
        assert!(whole.is_poisoned());
    }
});
