//! Execution adapter between requests and the contract VM.
//!
//! [`run`] decodes the single contract operation of a request, calls the VM
//! and returns the emitted messages. Invoke calls get a synthesized metadata
//! argument (caller, inbound tokens, fee) in front of the user arguments.
//! VM failures are wrapped with the request id and never retried here.

use serde::{Deserialize, Serialize};

use crate::state::{LedgerError, LedgerQuery};
use crate::transaction::{
    Address, ContractRequest, ContractRequestKind, Message, Transaction, TxShapeError,
};
use crate::Hash;

/// Failure reported by the VM.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct VmError(pub String);

/// Errors from running a request.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("invalid request shape: {0}")]
    InvalidShape(#[from] TxShapeError),
    #[error("request {}: caller cannot be resolved", crate::short_id(.0))]
    UnknownCaller(Hash),
    #[error("request {}: fee: {source}", crate::short_id(.request_id))]
    Fee {
        request_id: Hash,
        source: LedgerError,
    },
    #[error("request {}: metadata encoding: {source}", crate::short_id(.request_id))]
    Metadata {
        request_id: Hash,
        source: serde_json::Error,
    },
    #[error("request {}: contract vm: {source}", crate::short_id(.request_id))]
    Vm { request_id: Hash, source: VmError },
}

/// The external contract VM.
///
/// Implementations must be deterministic: every juror runs the same request
/// and their outputs are compared message by message.
pub trait ContractVm: Send + Sync {
    fn install(
        &self,
        template_name: &str,
        bytecode: &[u8],
        version: &str,
    ) -> Result<Vec<Message>, VmError>;

    fn deploy(
        &self,
        contract_id: &Address,
        template_id: &Hash,
        args: &[Vec<u8>],
    ) -> Result<Vec<Message>, VmError>;

    fn invoke(&self, contract_id: &Address, args: &[Vec<u8>]) -> Result<Vec<Message>, VmError>;

    fn stop(&self, contract_id: &Address) -> Result<Vec<Message>, VmError>;
}

/// Tokens sent along with an invoke to someone other than the caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeTokens {
    pub amount: u64,
    pub asset: String,
    pub address: String,
}

/// Metadata prepended to invoke arguments (JSON).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeInfo {
    pub invoke_address: String,
    pub invoke_tokens: Vec<InvokeTokens>,
    pub invoke_fees: u64,
}

/// Output of a successful run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub kind: ContractRequestKind,
    pub messages: Vec<Message>,
}

/// Classify a request as system (mediator-executed) or user (jury-executed).
///
/// Install and operations on a system-marked contract are system. A
/// transaction without any contract operation is treated as system so it can
/// only take the mediator path.
pub fn is_system_contract(tx: &Transaction) -> bool {
    let request = tx.messages.iter().find_map(|m| match m {
        Message::ContractRequest(req) => Some(req),
        _ => None,
    });
    match request {
        Some(ContractRequest::Install { .. }) => true,
        Some(ContractRequest::Invoke { contract_id, .. })
        | Some(ContractRequest::Stop { contract_id }) => contract_id.is_system(),
        Some(ContractRequest::Deploy { .. }) => false,
        None => true,
    }
}

/// Build the invocation metadata from the first payment of `tx`.
pub fn invoke_info(ledger: &dyn LedgerQuery, tx: &Transaction) -> Result<InvokeInfo, ExecutionError> {
    let request_id = tx.request_id();
    let payment = tx
        .first_payment()
        .ok_or(ExecutionError::UnknownCaller(request_id))?;
    let first_input = payment
        .inputs
        .first()
        .ok_or(ExecutionError::UnknownCaller(request_id))?;
    let caller = ledger
        .addr_by_outpoint(first_input)
        .ok_or(ExecutionError::UnknownCaller(request_id))?;

    let invoke_tokens = payment
        .outputs
        .iter()
        .filter(|o| o.recipient != caller)
        .map(|o| InvokeTokens {
            amount: o.value,
            asset: o.asset.clone(),
            address: o.recipient.to_string(),
        })
        .collect();
    let invoke_fees = ledger
        .tx_fee(&tx.request_tx())
        .map_err(|source| ExecutionError::Fee { request_id, source })?;

    Ok(InvokeInfo {
        invoke_address: caller.to_string(),
        invoke_tokens,
        invoke_fees,
    })
}

/// Execute the contract operation of `request_tx`.
pub fn run(
    ledger: &dyn LedgerQuery,
    vm: &dyn ContractVm,
    request_tx: &Transaction,
) -> Result<ExecutionOutput, ExecutionError> {
    let request = request_tx.contract_request()?;
    let request_id = request_tx.request_id();
    let vm_err = |source| ExecutionError::Vm { request_id, source };

    let messages = match request {
        ContractRequest::Install {
            template_name,
            bytecode,
            version,
        } => vm.install(template_name, bytecode, version).map_err(vm_err)?,
        ContractRequest::Deploy { template_id, args } => {
            let contract_id = Address::contract_from_request(&request_id);
            vm.deploy(&contract_id, template_id, args).map_err(vm_err)?
        }
        ContractRequest::Invoke { contract_id, args } => {
            let info = invoke_info(ledger, request_tx)?;
            let meta = serde_json::to_vec(&info)
                .map_err(|source| ExecutionError::Metadata { request_id, source })?;
            let mut full_args = Vec::with_capacity(args.len() + 1);
            full_args.push(meta);
            full_args.extend(args.iter().cloned());
            vm.invoke(contract_id, &full_args).map_err(vm_err)?
        }
        ContractRequest::Stop { contract_id } => vm.stop(contract_id).map_err(vm_err)?,
    };

    tracing::debug!(
        request = %crate::short_id(&request_id),
        kind = %request.kind(),
        messages = messages.len(),
        "Contract executed"
    );
    Ok(ExecutionOutput {
        kind: request.kind(),
        messages,
    })
}

/// The request followed by its execution output.
pub fn result_transaction(request_tx: &Transaction, output: &ExecutionOutput) -> Transaction {
    let mut tx = request_tx.request_tx();
    tx.messages.extend(output.messages.iter().cloned());
    tx
}
