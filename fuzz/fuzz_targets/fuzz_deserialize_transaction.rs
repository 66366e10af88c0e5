#![no_main]

use libfuzzer_sys::fuzz_target;
use jury::transaction::Transaction;

fuzz_target!(|data: &[u8]| {
    // Transaction nests payments, contract requests and results, and
    // signature lists with variable-length Dilithium keys. Deserialization
    // must never panic on arbitrary bytes.
    let _ = jury::deserialize::<Transaction>(data);
});
