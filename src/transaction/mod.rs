//! Contract request and result transactions.
//!
//! A transaction is an ordered list of typed messages. A request carries
//! payments and exactly one contract-operation message; execution appends
//! result messages and, for user contracts, a signature message. The request
//! identifier only covers the messages up to and including the operation, so
//! it stays stable as results and signatures are appended.

pub mod builder;

use serde::{Deserialize, Serialize};

use crate::crypto::keys::{Signature, SigningPublicKey};
use crate::Hash;

/// Errors from transaction shape checks.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TxShapeError {
    #[error("transaction has no messages")]
    Empty,
    #[error("transaction has {0} messages, above the limit")]
    TooManyMessages(usize),
    #[error("no contract-operation message found")]
    NoContractRequest,
    #[error("more than one contract-operation message")]
    MultipleContractRequests,
}

// ── Addresses ──

/// What an address refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AddressKind {
    Account,
    Contract,
    /// Contract carrying the reserved system marker; executed by mediators only
    SystemContract,
}

/// A 20-byte address with its kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub kind: AddressKind,
    pub hash: [u8; 20],
}

impl Address {
    /// Account address owned by a signing key.
    pub fn from_public_key(public_key: &SigningPublicKey) -> Self {
        let fp = public_key.fingerprint();
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&fp[..20]);
        Address {
            kind: AddressKind::Account,
            hash,
        }
    }

    /// Address of the contract created by the deploy request `request_id`.
    pub fn contract_from_request(request_id: &Hash) -> Self {
        let digest = crate::hash_domain(b"jury.contract.address", request_id);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest[..20]);
        Address {
            kind: AddressKind::Contract,
            hash,
        }
    }

    /// Reserved system contract number `index`.
    pub fn system_contract(index: u8) -> Self {
        let mut hash = [0u8; 20];
        hash[19] = index;
        Address {
            kind: AddressKind::SystemContract,
            hash,
        }
    }

    pub fn is_system(&self) -> bool {
        self.kind == AddressKind::SystemContract
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.hash
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.kind {
            AddressKind::Account => "P1",
            AddressKind::Contract => "PC",
            AddressKind::SystemContract => "PS",
        };
        write!(f, "{}{}", prefix, hex::encode(self.hash))
    }
}

// ── Payments ──

/// Reference to an output of an earlier transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub tx_hash: Hash,
    pub index: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub value: u64,
    pub asset: String,
    pub recipient: Address,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentPayload {
    pub inputs: Vec<OutPoint>,
    pub outputs: Vec<Output>,
}

// ── Contract operations ──

/// The four contract operations a request may carry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractRequest {
    Install {
        template_name: String,
        bytecode: Vec<u8>,
        version: String,
    },
    Deploy {
        template_id: Hash,
        args: Vec<Vec<u8>>,
    },
    Invoke {
        contract_id: Address,
        args: Vec<Vec<u8>>,
    },
    Stop {
        contract_id: Address,
    },
}

/// Discriminant of a [`ContractRequest`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractRequestKind {
    Install,
    Deploy,
    Invoke,
    Stop,
}

impl std::fmt::Display for ContractRequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ContractRequestKind::Install => "install",
            ContractRequestKind::Deploy => "deploy",
            ContractRequestKind::Invoke => "invoke",
            ContractRequestKind::Stop => "stop",
        };
        f.write_str(name)
    }
}

impl ContractRequest {
    pub fn kind(&self) -> ContractRequestKind {
        match self {
            ContractRequest::Install { .. } => ContractRequestKind::Install,
            ContractRequest::Deploy { .. } => ContractRequestKind::Deploy,
            ContractRequest::Invoke { .. } => ContractRequestKind::Invoke,
            ContractRequest::Stop { .. } => ContractRequestKind::Stop,
        }
    }

    /// Target contract for invoke and stop. Deploy targets the address
    /// derived from its own request id, which the caller must supply.
    pub fn target(&self) -> Option<Address> {
        match self {
            ContractRequest::Invoke { contract_id, .. } | ContractRequest::Stop { contract_id } => {
                Some(*contract_id)
            }
            ContractRequest::Install { .. } | ContractRequest::Deploy { .. } => None,
        }
    }
}

/// One key read during execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRead {
    pub key: String,
    pub version: u64,
}

/// One key written during execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateWrite {
    pub key: String,
    pub value: Vec<u8>,
    pub is_delete: bool,
}

/// Result payloads produced by the contract VM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractResult {
    Template {
        template_id: Hash,
        name: String,
        version: String,
    },
    Deploy {
        contract_id: Address,
        template_id: Hash,
        read_set: Vec<StateRead>,
        write_set: Vec<StateWrite>,
    },
    Invoke {
        contract_id: Address,
        args: Vec<Vec<u8>>,
        read_set: Vec<StateRead>,
        write_set: Vec<StateWrite>,
        payload: Vec<u8>,
    },
    Stop {
        contract_id: Address,
        write_set: Vec<StateWrite>,
    },
}

/// A (public key, signature) pair on a result transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEntry {
    pub public_key: SigningPublicKey,
    pub signature: Signature,
}

/// A typed transaction message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Payment(PaymentPayload),
    ContractRequest(ContractRequest),
    ContractResult(ContractResult),
    Signature(Vec<SignatureEntry>),
    Data(Vec<u8>),
}

impl Message {
    pub fn is_signature(&self) -> bool {
        matches!(self, Message::Signature(_))
    }
}

// ── Transaction ──

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub messages: Vec<Message>,
}

impl Transaction {
    pub fn new(messages: Vec<Message>) -> Self {
        Transaction { messages }
    }

    /// Check the request shape: non-empty, bounded, exactly one operation.
    pub fn validate_shape(&self) -> Result<(), TxShapeError> {
        if self.messages.is_empty() {
            return Err(TxShapeError::Empty);
        }
        if self.messages.len() > crate::constants::MAX_MESSAGES_PER_TX {
            return Err(TxShapeError::TooManyMessages(self.messages.len()));
        }
        self.contract_request().map(|_| ())
    }

    fn request_position(&self) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| matches!(m, Message::ContractRequest(_)))
    }

    /// The single contract-operation message.
    pub fn contract_request(&self) -> Result<&ContractRequest, TxShapeError> {
        let mut found = None;
        for msg in &self.messages {
            if let Message::ContractRequest(req) = msg {
                if found.is_some() {
                    return Err(TxShapeError::MultipleContractRequests);
                }
                found = Some(req);
            }
        }
        found.ok_or(TxShapeError::NoContractRequest)
    }

    /// First result payload, if execution has run.
    pub fn contract_result(&self) -> Option<&ContractResult> {
        self.messages.iter().find_map(|m| match m {
            Message::ContractResult(r) => Some(r),
            _ => None,
        })
    }

    pub fn first_payment(&self) -> Option<&PaymentPayload> {
        self.messages.iter().find_map(|m| match m {
            Message::Payment(p) => Some(p),
            _ => None,
        })
    }

    /// Identifier of the request this transaction belongs to.
    pub fn request_id(&self) -> Hash {
        let end = self
            .request_position()
            .map(|p| p + 1)
            .unwrap_or(self.messages.len());
        hash_messages("jury.request_id", &self.messages[..end], false)
    }

    /// The request part of a (possibly executed) transaction.
    pub fn request_tx(&self) -> Transaction {
        let end = self
            .request_position()
            .map(|p| p + 1)
            .unwrap_or(self.messages.len());
        Transaction::new(self.messages[..end].to_vec())
    }

    /// Hash over every message.
    pub fn hash(&self) -> Hash {
        hash_messages("jury.tx_hash", &self.messages, false)
    }

    /// Hash signed by jurors: every message except signatures.
    pub fn sign_hash(&self) -> Hash {
        hash_messages("jury.tx_sign_hash", &self.messages, true)
    }

    /// Signature entries of the first signature message.
    pub fn signatures(&self) -> &[SignatureEntry] {
        self.messages
            .iter()
            .find_map(|m| match m {
                Message::Signature(sigs) => Some(sigs.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    /// Mutable signature list, creating the signature message if absent.
    pub fn signatures_mut(&mut self) -> &mut Vec<SignatureEntry> {
        let pos = match self.messages.iter().position(Message::is_signature) {
            Some(pos) => pos,
            None => {
                self.messages.push(Message::Signature(Vec::new()));
                self.messages.len() - 1
            }
        };
        match &mut self.messages[pos] {
            Message::Signature(sigs) => sigs,
            _ => unreachable!("position points at a signature message"),
        }
    }
}

// ── Hashing ──

fn update_bytes(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn hash_address_into(addr: &Address, hasher: &mut blake3::Hasher) {
    let tag: u8 = match addr.kind {
        AddressKind::Account => 0,
        AddressKind::Contract => 1,
        AddressKind::SystemContract => 2,
    };
    hasher.update(&[tag]);
    hasher.update(&addr.hash);
}

fn hash_args_into(args: &[Vec<u8>], hasher: &mut blake3::Hasher) {
    hasher.update(&(args.len() as u64).to_le_bytes());
    for arg in args {
        update_bytes(hasher, arg);
    }
}

fn hash_state_into(reads: &[StateRead], writes: &[StateWrite], hasher: &mut blake3::Hasher) {
    hasher.update(&(reads.len() as u64).to_le_bytes());
    for r in reads {
        update_bytes(hasher, r.key.as_bytes());
        hasher.update(&r.version.to_le_bytes());
    }
    hasher.update(&(writes.len() as u64).to_le_bytes());
    for w in writes {
        update_bytes(hasher, w.key.as_bytes());
        update_bytes(hasher, &w.value);
        hasher.update(&[w.is_delete as u8]);
    }
}

fn hash_message_into(msg: &Message, hasher: &mut blake3::Hasher) {
    match msg {
        Message::Payment(p) => {
            hasher.update(&[0]);
            hasher.update(&(p.inputs.len() as u64).to_le_bytes());
            for input in &p.inputs {
                hasher.update(&input.tx_hash);
                hasher.update(&input.index.to_le_bytes());
            }
            hasher.update(&(p.outputs.len() as u64).to_le_bytes());
            for output in &p.outputs {
                hasher.update(&output.value.to_le_bytes());
                update_bytes(hasher, output.asset.as_bytes());
                hash_address_into(&output.recipient, hasher);
            }
        }
        Message::ContractRequest(req) => {
            hasher.update(&[1]);
            match req {
                ContractRequest::Install {
                    template_name,
                    bytecode,
                    version,
                } => {
                    hasher.update(&[0]);
                    update_bytes(hasher, template_name.as_bytes());
                    update_bytes(hasher, bytecode);
                    update_bytes(hasher, version.as_bytes());
                }
                ContractRequest::Deploy { template_id, args } => {
                    hasher.update(&[1]);
                    hasher.update(template_id);
                    hash_args_into(args, hasher);
                }
                ContractRequest::Invoke { contract_id, args } => {
                    hasher.update(&[2]);
                    hash_address_into(contract_id, hasher);
                    hash_args_into(args, hasher);
                }
                ContractRequest::Stop { contract_id } => {
                    hasher.update(&[3]);
                    hash_address_into(contract_id, hasher);
                }
            }
        }
        Message::ContractResult(res) => {
            hasher.update(&[2]);
            match res {
                ContractResult::Template {
                    template_id,
                    name,
                    version,
                } => {
                    hasher.update(&[0]);
                    hasher.update(template_id);
                    update_bytes(hasher, name.as_bytes());
                    update_bytes(hasher, version.as_bytes());
                }
                ContractResult::Deploy {
                    contract_id,
                    template_id,
                    read_set,
                    write_set,
                } => {
                    hasher.update(&[1]);
                    hash_address_into(contract_id, hasher);
                    hasher.update(template_id);
                    hash_state_into(read_set, write_set, hasher);
                }
                ContractResult::Invoke {
                    contract_id,
                    args,
                    read_set,
                    write_set,
                    payload,
                } => {
                    hasher.update(&[2]);
                    hash_address_into(contract_id, hasher);
                    hash_args_into(args, hasher);
                    hash_state_into(read_set, write_set, hasher);
                    update_bytes(hasher, payload);
                }
                ContractResult::Stop {
                    contract_id,
                    write_set,
                } => {
                    hasher.update(&[3]);
                    hash_address_into(contract_id, hasher);
                    hash_state_into(&[], write_set, hasher);
                }
            }
        }
        Message::Signature(sigs) => {
            hasher.update(&[3]);
            hasher.update(&(sigs.len() as u64).to_le_bytes());
            for entry in sigs {
                update_bytes(hasher, entry.public_key.as_bytes());
                update_bytes(hasher, entry.signature.as_bytes());
            }
        }
        Message::Data(data) => {
            hasher.update(&[4]);
            update_bytes(hasher, data);
        }
    }
}

fn hash_messages(domain: &str, messages: &[Message], skip_signatures: bool) -> Hash {
    let mut hasher = blake3::Hasher::new_derive_key(domain);
    for msg in messages {
        if skip_signatures && msg.is_signature() {
            continue;
        }
        hash_message_into(msg, &mut hasher);
    }
    *hasher.finalize().as_bytes()
}
