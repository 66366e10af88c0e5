//! Ledger query surface consumed by the jury core.
//!
//! The DAG, UTXO set and membership registry live elsewhere; the processor
//! only asks questions through [`LedgerQuery`]. [`MemoryLedger`] answers them
//! from in-memory tables for the demo and tests.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::consensus::election::ElectionNode;
use crate::transaction::{Address, OutPoint, Transaction};
use crate::Hash;

/// Errors from ledger queries.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("unknown output {0:?}")]
    UnknownOutput(OutPoint),
    #[error("outputs {outputs} exceed inputs {inputs}")]
    Overspend { inputs: u64, outputs: u64 },
    #[error("amount overflow")]
    Overflow,
}

/// An unspent output as seen by the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub value: u64,
    pub asset: String,
    pub owner: Address,
}

/// Read-only ledger questions asked by the processor.
pub trait LedgerQuery: Send + Sync {
    fn utxo_entry(&self, outpoint: &OutPoint) -> Option<UtxoEntry>;

    fn is_active_jury(&self, address: &Address) -> bool;

    fn is_active_mediator(&self, address: &Address) -> bool;

    /// Number of active jurors, the total weight for sortition.
    fn jury_count(&self) -> u64;

    /// Jury stored for a deployed contract, if any.
    fn contract_jury(&self, contract_id: &Address) -> Option<ElectionNode>;

    /// Whether the ledger already holds a transaction for this request.
    fn is_request_committed(&self, request_id: &Hash) -> bool;

    /// Owner of a previous output.
    fn addr_by_outpoint(&self, outpoint: &OutPoint) -> Option<Address> {
        self.utxo_entry(outpoint).map(|u| u.owner)
    }

    /// Fee paid by a transaction: spent input value minus output value,
    /// summed over every payment message.
    fn tx_fee(&self, tx: &Transaction) -> Result<u64, LedgerError> {
        let mut inputs = 0u64;
        let mut outputs = 0u64;
        for msg in &tx.messages {
            if let crate::transaction::Message::Payment(p) = msg {
                for input in &p.inputs {
                    let utxo = self
                        .utxo_entry(input)
                        .ok_or(LedgerError::UnknownOutput(*input))?;
                    inputs = inputs.checked_add(utxo.value).ok_or(LedgerError::Overflow)?;
                }
                for output in &p.outputs {
                    outputs = outputs
                        .checked_add(output.value)
                        .ok_or(LedgerError::Overflow)?;
                }
            }
        }
        inputs
            .checked_sub(outputs)
            .ok_or(LedgerError::Overspend { inputs, outputs })
    }
}

#[derive(Default)]
struct LedgerTables {
    utxos: HashMap<OutPoint, UtxoEntry>,
    jurors: HashSet<Address>,
    mediators: HashSet<Address>,
    contract_juries: HashMap<Address, ElectionNode>,
    committed: HashSet<Hash>,
}

/// In-memory ledger.
#[derive(Default)]
pub struct MemoryLedger {
    tables: RwLock<LedgerTables>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, LedgerTables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, LedgerTables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_utxo(&self, outpoint: OutPoint, entry: UtxoEntry) {
        self.write().utxos.insert(outpoint, entry);
    }

    pub fn add_jury(&self, address: Address) {
        self.write().jurors.insert(address);
    }

    pub fn add_mediator(&self, address: Address) {
        self.write().mediators.insert(address);
    }

    pub fn set_contract_jury(&self, contract_id: Address, jury: ElectionNode) {
        self.write().contract_juries.insert(contract_id, jury);
    }

    pub fn mark_committed(&self, request_id: Hash) {
        self.write().committed.insert(request_id);
    }
}

impl LedgerQuery for MemoryLedger {
    fn utxo_entry(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        self.read().utxos.get(outpoint).cloned()
    }

    fn is_active_jury(&self, address: &Address) -> bool {
        self.read().jurors.contains(address)
    }

    fn is_active_mediator(&self, address: &Address) -> bool {
        self.read().mediators.contains(address)
    }

    fn jury_count(&self) -> u64 {
        self.read().jurors.len() as u64
    }

    fn contract_jury(&self, contract_id: &Address) -> Option<ElectionNode> {
        self.read().contract_juries.get(contract_id).cloned()
    }

    fn is_request_committed(&self, request_id: &Hash) -> bool {
        self.read().committed.contains(request_id)
    }
}
