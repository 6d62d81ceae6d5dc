//! Fuzz target for decrypted payload framing
//!
//! Decrypted bytes are attacker-influenced when a sender is malicious, so
//! the backref header parser sees arbitrary input in both framings.
//!
//! # Invariants
//!
//! - Decoding never panics
//! - Anything that decodes re-encodes and decodes to the same value

#![no_main]

use libfuzzer_sys::fuzz_target;
use strongvelope_proto::{BackRefFraming, Plaintext};

fuzz_target!(|data: &[u8]| {
    for framing in [BackRefFraming::Raw, BackRefFraming::CharPerByte] {
        let Ok(plaintext) = Plaintext::decode(data, framing) else {
            continue;
        };
        let Ok(encoded) = plaintext.encode(framing) else {
            continue;
        };
        let again = Plaintext::decode(&encoded, framing);
        assert_eq!(again.as_ref(), Ok(&plaintext), "{framing:?} framing is not stable");
    }
});
