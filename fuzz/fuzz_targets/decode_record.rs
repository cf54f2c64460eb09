//! Fuzz target for scaler record decoding.
//!
//! Tests:
//! - Arbitrary bytes never panic the decoder
//! - Anything that decodes re-encodes to the same bytes

#![no_main]

use libfuzzer_sys::fuzz_target;
use sndaq::payload::codec;

fuzz_target!(|data: &[u8]| {
    if let Ok(record) = codec::decode(data) {
        let bytes = codec::encode(&record).expect("decoded record re-encodes");
        assert_eq!(&bytes[..], data);
    }
});
