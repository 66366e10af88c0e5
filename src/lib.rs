//! # Jury
//!
//! Committee-based contract execution for a permissioned DAG ledger:
//! - **VRF sortition** elects a per-contract committee ("jury") without a coordinator
//! - **Signature quorum** collects juror signatures over one deterministic result
//! - **Deterministic broadcaster** picks exactly one committer per quorum (smallest signature)
//! - **Request lifecycle** tracks in-flight requests and reaps stale ones
//! - **Adapter bridge** answers cross-chain consultations once enough jurors agree

pub mod config;
pub mod consensus;
pub mod contract;
pub mod crypto;
pub mod demo;
pub mod network;
pub mod node;
pub mod state;
pub mod transaction;

/// Protocol constants
pub mod constants {
    /// Signatures required before a user-contract result may be committed
    pub const CONTRACT_SIG_NUM: usize = 3;
    /// Committee members an election must gather before execution starts
    pub const CONTRACT_ELECTION_NUM: usize = 4;
    /// Reaper wake-up interval in seconds
    pub const REAPER_INTERVAL_SECS: u64 = 5;
    /// Lifetime of a record that never became valid (seconds)
    pub const INVALID_RECORD_TTL_SECS: u64 = 120;
    /// Lifetime of a valid record awaiting the ledger-construction stage (seconds)
    pub const VALID_RECORD_TTL_SECS: u64 = 600;
    /// Default deadline for an adapter consultation in milliseconds
    pub const ADAPTER_TIMEOUT_MS: u64 = 10_000;
    /// Default deadline for gathering an election in milliseconds
    pub const ELECTION_TIMEOUT_MS: u64 = 10_000;
    /// Maximum tolerated difference between a claimed and the local jury count (percent)
    pub const JURY_COUNT_TOLERANCE_PERCENT: u64 = 10;
    /// Maximum network message size (16 MiB)
    pub const MAX_NETWORK_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
    /// Maximum messages carried by one transaction
    pub const MAX_MESSAGES_PER_TX: usize = 64;
    /// Depth of each subscriber queue on the event network
    pub const EVENT_CHANNEL_CAPACITY: usize = 1_024;
}

/// 32-byte hash used throughout the protocol
pub type Hash = [u8; 32];

/// Compute a domain-separated BLAKE3 hash.
///
/// Domains are ASCII byte literals (`b"jury.vrf.output"`). A domain that is
/// not valid UTF-8 is a programming error; it falls back to a keyed hash of
/// the raw domain bytes so the result stays domain-bound.
pub fn hash_domain(domain: &[u8], data: &[u8]) -> Hash {
    match std::str::from_utf8(domain) {
        Ok(domain_str) => {
            let mut hasher = blake3::Hasher::new_derive_key(domain_str);
            hasher.update(data);
            *hasher.finalize().as_bytes()
        }
        Err(_) => hash_concat(&[domain, data]),
    }
}

/// Compute BLAKE3 hash of length-prefixed concatenated slices.
///
/// Each part is prefixed with its length as a little-endian u64, preventing
/// ambiguous concatenation (e.g., `["AB","C"]` vs `["A","BC"]`).
pub fn hash_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Constant-time comparison of two byte slices.
///
/// The length comparison is not constant-time; every caller compares
/// fixed-size digests.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Short hex prefix of an identifier, for log fields.
pub fn short_id(id: &Hash) -> String {
    hex::encode(&id[..8])
}

/// Serialize a value using bincode with legacy (v1-compatible) encoding.
pub fn serialize<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::serde::encode_to_vec(val, bincode::config::legacy())
}

/// Deserialize a value using bincode with legacy (v1-compatible) encoding.
///
/// Rejects inputs larger than `MAX_NETWORK_MESSAGE_BYTES`.
pub fn deserialize<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, bincode::error::DecodeError> {
    if bytes.len() > constants::MAX_NETWORK_MESSAGE_BYTES {
        return Err(bincode::error::DecodeError::LimitExceeded);
    }
    let (val, _len) = bincode::serde::decode_from_slice(bytes, bincode::config::legacy())?;
    Ok(val)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_domain_deterministic() {
        let a = hash_domain(b"jury.test", b"hello");
        let b = hash_domain(b"jury.test", b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn hash_domain_different_domains() {
        let a = hash_domain(b"jury.domain_a", b"data");
        let b = hash_domain(b"jury.domain_b", b"data");
        assert_ne!(a, b);
    }

    #[test]
    fn hash_domain_non_utf8_domain_still_separates() {
        let a = hash_domain(&[0xff, 0xfe], b"data");
        let b = hash_domain(&[0xff, 0xfd], b"data");
        assert_ne!(a, b);
    }

    #[test]
    fn hash_concat_length_prefix_prevents_ambiguity() {
        let ab_c = hash_concat(&[b"ab", b"c"]);
        let a_bc = hash_concat(&[b"a", b"bc"]);
        assert_ne!(ab_c, a_bc);
    }

    #[test]
    fn constant_time_eq_works() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"short", b"longer"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn short_id_is_sixteen_hex_chars() {
        let id = [0xabu8; 32];
        assert_eq!(short_id(&id), "abababababababab");
    }

    #[test]
    fn deserialize_rejects_oversized_input() {
        let oversized = vec![0u8; constants::MAX_NETWORK_MESSAGE_BYTES + 1];
        let result = deserialize::<Vec<u8>>(&oversized);
        assert!(result.is_err(), "oversized input should be rejected");
    }

    #[test]
    fn serialize_deserialize_roundtrip() {
        let original: Vec<u8> = vec![1, 2, 3, 4, 5];
        let bytes = serialize(&original).unwrap();
        let restored: Vec<u8> = deserialize(&bytes).unwrap();
        assert_eq!(original, restored);
    }
}
