#![no_main]

use libfuzzer_sys::fuzz_target;
use jury::network::decode_event;

fuzz_target!(|data: &[u8]| {
    // decode_event parses a 4-byte LE length prefix followed by a bincode
    // ProtocolEvent carrying transactions, committee proofs and adapter
    // answers. It must return None for anything it cannot decode.
    if let Some(event) = decode_event(data) {
        let _ = event.request_id();
    }
});
