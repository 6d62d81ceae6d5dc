//! Fuzz target for envelope decoding
//!
//! Arbitrary bytes are decoded as a message envelope of any version, then
//! interpreted as an API management record.
//!
//! # Invariants
//!
//! - Decoding never panics
//! - The signed content of a decoded envelope lies within the input
//! - Management decoding of any decoded envelope never panics

#![no_main]

use libfuzzer_sys::fuzz_target;
use strongvelope_client::ManagementRecord;
use strongvelope_proto::Envelope;

fuzz_target!(|data: &[u8]| {
    let Ok(envelope) = Envelope::decode(data) else {
        return;
    };
    assert!(envelope.signed_content().len() <= data.len());

    if let Ok(record) = ManagementRecord::decode(&envelope) {
        let _ = record.encode();
    }
});
