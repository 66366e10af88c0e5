#![no_main]

use libfuzzer_sys::fuzz_target;
use jury::consensus::election::request_contract;
use jury::contract::is_system_contract;
use jury::transaction::Transaction;

fuzz_target!(|data: &[u8]| {
    // Deserialize a transaction, then run the shape checks and hashing the
    // processor applies to every inbound event.
    if let Ok(tx) = jury::deserialize::<Transaction>(data) {
        if tx.validate_shape().is_ok() {
            let _ = tx.request_id();
            let _ = tx.sign_hash();
            let _ = tx.request_tx();
            let _ = is_system_contract(&tx);
            let _ = request_contract(&tx);
        }
    }
});
