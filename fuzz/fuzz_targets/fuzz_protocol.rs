//! Fuzz target for frame decoding.
//!
//! Arbitrary bytes must never panic the decoder, and anything that decodes
//! must re-encode.

#![no_main]

use ccr::protocol::Frame;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = Frame::decode(data) {
        let _ = frame.encode();
    }
});
