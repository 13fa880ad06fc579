//! Fuzz target for `HandshakePayload` JSON (de)serialization.
//!
//! Runs two passes per input: raw arbitrary bytes straight at
//! `from_json_bytes` (looking for panics on malformed JSON), and an
//! `Arbitrary`-generated `HandshakePayload` round-tripped through
//! `to_json_bytes`/`from_json_bytes` (looking for lossy or panicking
//! encoding of edge-case field values like NaN/infinite `n_index` or empty
//! strings).

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use qwormhole_proto::HandshakePayload;

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    raw: Vec<u8>,
    kind: String,
    version: Option<String>,
    n_index: Option<f64>,
    neg_hash: Option<String>,
    public_key: Option<String>,
    signature: Option<String>,
}

fuzz_target!(|input: FuzzInput| {
    let _ = HandshakePayload::from_json_bytes(&input.raw);

    let payload = HandshakePayload {
        kind: input.kind,
        n_index: input.n_index,
        neg_hash: input.neg_hash,
        public_key: input.public_key,
        signature: input.signature,
        ..HandshakePayload::new(input.version)
    };

    let Ok(encoded) = payload.to_json_bytes() else {
        return;
    };

    match HandshakePayload::from_json_bytes(&encoded) {
        Ok(decoded) => {
            assert_eq!(decoded.kind, payload.kind);
            assert_eq!(decoded.version, payload.version);
        },
        Err(_) => panic!("payload that was just successfully encoded must decode"),
    }
});
