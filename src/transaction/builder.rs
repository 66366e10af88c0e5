//! Builder for contract request transactions.
//!
//! Usage:
//! ```ignore
//! let tx = RequestBuilder::new()
//!     .add_input(outpoint)
//!     .add_output(100, "PTN", contract_address)
//!     .invoke(contract_address, vec![b"transfer".to_vec()])
//!     .build()?;
//! ```
//!
//! Message order is fixed: payment, data, then the contract operation. Every
//! message therefore falls inside the request identifier.

use crate::transaction::{
    Address, ContractRequest, Message, OutPoint, Output, PaymentPayload, Transaction,
};
use crate::Hash;

/// Errors from building a request.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TxBuildError {
    #[error("no contract operation set")]
    MissingOperation,
    #[error("contract operation already set")]
    OperationAlreadySet,
    #[error("too many messages ({0})")]
    TooManyMessages(usize),
}

/// Builder for constructing contract requests.
#[derive(Default)]
pub struct RequestBuilder {
    inputs: Vec<OutPoint>,
    outputs: Vec<Output>,
    data: Vec<Vec<u8>>,
    operation: Option<ContractRequest>,
    duplicate_operation: bool,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spend an earlier output. The first input identifies the caller.
    pub fn add_input(mut self, outpoint: OutPoint) -> Self {
        self.inputs.push(outpoint);
        self
    }

    /// Pay `value` of `asset` to `recipient`.
    pub fn add_output(mut self, value: u64, asset: &str, recipient: Address) -> Self {
        self.outputs.push(Output {
            value,
            asset: asset.to_string(),
            recipient,
        });
        self
    }

    /// Attach an opaque data message.
    pub fn add_data(mut self, data: Vec<u8>) -> Self {
        self.data.push(data);
        self
    }

    /// Attach a random nonce so otherwise identical requests get distinct ids.
    pub fn with_random_nonce(self) -> Self {
        let nonce: u64 = rand::random();
        self.add_data(nonce.to_le_bytes().to_vec())
    }

    fn set_operation(mut self, op: ContractRequest) -> Self {
        if self.operation.is_some() {
            self.duplicate_operation = true;
        }
        self.operation = Some(op);
        self
    }

    pub fn install(self, template_name: &str, bytecode: Vec<u8>, version: &str) -> Self {
        self.set_operation(ContractRequest::Install {
            template_name: template_name.to_string(),
            bytecode,
            version: version.to_string(),
        })
    }

    pub fn deploy(self, template_id: Hash, args: Vec<Vec<u8>>) -> Self {
        self.set_operation(ContractRequest::Deploy { template_id, args })
    }

    pub fn invoke(self, contract_id: Address, args: Vec<Vec<u8>>) -> Self {
        self.set_operation(ContractRequest::Invoke { contract_id, args })
    }

    pub fn stop(self, contract_id: Address) -> Self {
        self.set_operation(ContractRequest::Stop { contract_id })
    }

    /// Build the request transaction.
    pub fn build(self) -> Result<Transaction, TxBuildError> {
        if self.duplicate_operation {
            return Err(TxBuildError::OperationAlreadySet);
        }
        let operation = self.operation.ok_or(TxBuildError::MissingOperation)?;

        let mut messages = Vec::with_capacity(2 + self.data.len());
        if !self.inputs.is_empty() || !self.outputs.is_empty() {
            messages.push(Message::Payment(PaymentPayload {
                inputs: self.inputs,
                outputs: self.outputs,
            }));
        }
        messages.extend(self.data.into_iter().map(Message::Data));
        messages.push(Message::ContractRequest(operation));

        if messages.len() > crate::constants::MAX_MESSAGES_PER_TX {
            return Err(TxBuildError::TooManyMessages(messages.len()));
        }
        Ok(Transaction::new(messages))
    }
}
