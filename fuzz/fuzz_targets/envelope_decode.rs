//! Fuzz target for mailbox value decoding
//!
//! Relay values are untrusted text written by any peer. Decoding must never
//! panic, and anything it accepts must re-encode to an equal envelope.

#![no_main]

use callframe_proto::{decode, encode};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(Some(envelope)) = decode(Some(text)) {
        let wire = encode(&envelope).expect("decoded envelope must encode");
        let again = decode(Some(wire.as_str())).expect("re-decode").expect("not empty");
        assert_eq!(again, envelope);
    }
});
