//! Fuzz target for TLV record iteration
//!
//! Both record layouts are read from an arbitrary start offset. Records must
//! stay inside the buffer and the reader must terminate.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use strongvelope_proto::{TlvMode, TlvReader};

#[derive(Debug, Arbitrary)]
struct Input {
    legacy: bool,
    offset: u8,
    bytes: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let mode = if input.legacy { TlvMode::Legacy } else { TlvMode::Current };
    let offset = usize::from(input.offset).min(input.bytes.len());

    let mut previous_end = offset;
    for record in TlvReader::new(&input.bytes, offset, mode) {
        let Ok(record) = record else {
            break;
        };
        assert!(record.offset >= previous_end);
        assert!(record.end <= input.bytes.len());
        previous_end = record.end;
    }
});
