//! Wire events exchanged between jury nodes.
//!
//! Every event is a self-contained broadcast. Contract events carry the
//! committee proof so a receiver can validate a user request without having
//! seen its election.

use serde::{Deserialize, Serialize};

use crate::consensus::election::{ElectionInfo, ElectionNode};
use crate::crypto::keys::{Signature, SigningPublicKey};
use crate::transaction::{Address, Transaction};
use crate::Hash;

/// A peer identifier (fingerprint of the node's first signing key).
pub type PeerId = Hash;

/// Phase of a contract event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractEventKind {
    /// Execute the request
    Exec,
    /// A juror's signed candidate result
    Sig,
    /// Quorum-signed result ready for inclusion
    Commit,
}

impl std::fmt::Display for ContractEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ContractEventKind::Exec => "EXEC",
            ContractEventKind::Sig => "SIG",
            ContractEventKind::Commit => "COMMIT",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractEvent {
    pub kind: ContractEventKind,
    /// Committee proof, required for user contracts
    pub committee: Option<ElectionNode>,
    pub tx: Transaction,
}

/// Election round messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionEvent {
    /// Ask active jurors to run sortition for a request.
    Request {
        request_id: Hash,
        expected: u64,
        jury_count: u64,
        seed: Hash,
    },
    /// A selected juror's evidence, collected by the requester.
    Result { request_id: Hash, info: ElectionInfo },
}

/// A juror's signed answer to a cross-chain consultation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterEvent {
    pub request_id: Hash,
    pub contract_id: Address,
    pub msg_type: u32,
    pub consult: Vec<u8>,
    pub answer: Vec<u8>,
    pub signature: Signature,
    pub public_key: SigningPublicKey,
}

/// Network protocol events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolEvent {
    Contract(ContractEvent),
    Election(ElectionEvent),
    Adapter(AdapterEvent),
}

impl ProtocolEvent {
    /// Request the event is about.
    pub fn request_id(&self) -> Hash {
        match self {
            ProtocolEvent::Contract(ev) => ev.tx.request_id(),
            ProtocolEvent::Election(ElectionEvent::Request { request_id, .. })
            | ProtocolEvent::Election(ElectionEvent::Result { request_id, .. }) => *request_id,
            ProtocolEvent::Adapter(ev) => ev.request_id,
        }
    }
}

/// Network errors.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    #[error("event serialization failed: {0}")]
    SerializationFailed(String),
    #[error(
        "event exceeds maximum size ({} bytes)",
        crate::constants::MAX_NETWORK_MESSAGE_BYTES
    )]
    MessageTooLarge,
    #[error("network shut down")]
    Shutdown,
}

/// Size-limited bincode config used for both serialization and deserialization.
fn bincode_config() -> bincode::config::Configuration<
    bincode::config::LittleEndian,
    bincode::config::Fixint,
    bincode::config::Limit<{ 16 * 1024 * 1024 }>,
> {
    bincode::config::legacy().with_limit::<{ 16 * 1024 * 1024 }>()
}

/// Serialize an event to bytes (length-prefixed).
pub fn encode_event(event: &ProtocolEvent) -> Result<Vec<u8>, NetworkError> {
    let payload = bincode::serde::encode_to_vec(event, bincode_config())
        .map_err(|e| NetworkError::SerializationFailed(e.to_string()))?;
    if payload.len() > crate::constants::MAX_NETWORK_MESSAGE_BYTES {
        return Err(NetworkError::MessageTooLarge);
    }
    let len = (payload.len() as u32).to_le_bytes();
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Deserialize a length-prefixed event. Returns `None` for anything that
/// does not decode, including declared lengths above the size cap.
pub fn decode_event(data: &[u8]) -> Option<ProtocolEvent> {
    if data.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes(data[..4].try_into().ok()?) as usize;
    if len > crate::constants::MAX_NETWORK_MESSAGE_BYTES {
        return None;
    }
    if data.len() < 4usize.saturating_add(len) {
        return None;
    }
    let (event, _) = bincode::serde::decode_from_slice(&data[4..4 + len], bincode_config()).ok()?;
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::SigningKeypair;
    use crate::transaction::builder::RequestBuilder;

    fn sample_contract_event() -> ProtocolEvent {
        let tx = RequestBuilder::new()
            .add_data(b"memo".to_vec())
            .invoke(
                Address::contract_from_request(&[3u8; 32]),
                vec![b"get".to_vec()],
            )
            .build()
            .unwrap();
        ProtocolEvent::Contract(ContractEvent {
            kind: ContractEventKind::Exec,
            committee: Some(ElectionNode::new(4, 3)),
            tx,
        })
    }

    #[test]
    fn contract_event_survives_the_wire() {
        let event = sample_contract_event();
        let bytes = encode_event(&event).unwrap();
        assert_eq!(decode_event(&bytes), Some(event));
    }

    #[test]
    fn adapter_event_survives_the_wire() {
        let kp = SigningKeypair::generate();
        let event = ProtocolEvent::Adapter(AdapterEvent {
            request_id: [7u8; 32],
            contract_id: Address::contract_from_request(&[7u8; 32]),
            msg_type: 2,
            consult: b"balance?".to_vec(),
            answer: b"42".to_vec(),
            signature: kp.sign(b"x"),
            public_key: kp.public.clone(),
        });
        let decoded = decode_event(&encode_event(&event).unwrap()).unwrap();
        assert_eq!(decoded.request_id(), [7u8; 32]);
        assert_eq!(decoded, event);
    }

    #[test]
    fn request_id_of_contract_event_matches_tx() {
        let event = sample_contract_event();
        let ProtocolEvent::Contract(ev) = &event else {
            unreachable!()
        };
        assert_eq!(event.request_id(), ev.tx.request_id());
    }

    #[test]
    fn decode_rejects_short_and_truncated_input() {
        assert!(decode_event(&[]).is_none());
        assert!(decode_event(&[1, 0]).is_none());
        let bytes = encode_event(&sample_contract_event()).unwrap();
        assert!(decode_event(&bytes[..bytes.len() - 1]).is_none());
    }

    #[test]
    fn decode_rejects_oversized_length_prefix() {
        let mut data = ((crate::constants::MAX_NETWORK_MESSAGE_BYTES + 1) as u32)
            .to_le_bytes()
            .to_vec();
        data.extend_from_slice(&[0u8; 16]);
        assert!(decode_event(&data).is_none());
    }

    #[test]
    fn decode_rejects_garbage() {
        let mut data = 8u32.to_le_bytes().to_vec();
        data.extend_from_slice(&[0xFF; 8]);
        assert!(decode_event(&data).is_none());
    }
}
