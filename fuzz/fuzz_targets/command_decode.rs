//! Fuzz target for chat command decoding
//!
//! Feeds arbitrary bytes to the command stream decoder to find:
//! - Panics on truncated or oversized length fields
//! - Over-reads past the end of the buffer
//! - Commands that decode but do not encode back to the same bytes
//!
//! The fuzzer should NEVER panic. All invalid inputs should return an error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use strongvelope_proto::Command;

fuzz_target!(|data: &[u8]| {
    let mut rest = data;
    while !rest.is_empty() {
        let Ok((command, consumed)) = Command::decode(rest) else {
            return;
        };
        assert!(consumed > 0 && consumed <= rest.len());

        let mut wire = Vec::new();
        if command.encode(&mut wire).is_ok() {
            assert_eq!(&wire[..], &rest[..consumed], "decoded command re-encodes differently");
        }
        rest = &rest[consumed..];
    }
});
