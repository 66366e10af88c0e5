//! Signature aggregation over a user-contract result.
//!
//! Every juror executes the request, signs the result's sign hash and
//! broadcasts its candidate. Candidates that match the local result message
//! for message (signatures excluded) contribute their first signature entry
//! to the local aggregate. The signature list behaves as a set: an entry with
//! the same public key and signature bytes is never added twice.
//!
//! Committer tie-break: once quorum is reached, only the juror whose own
//! signature is the lexicographically smallest in the set emits COMMIT.

use std::collections::HashSet;

use crate::consensus::election::ElectionNode;
use crate::crypto::keys::SigningKeypair;
use crate::transaction::{Address, Message, SignatureEntry, Transaction};

/// Reasons a candidate cannot be merged.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AggregateError {
    #[error("candidate result differs from the local result")]
    Divergent,
    #[error("candidate carries no signature")]
    MissingSignature,
}

fn non_signature_messages(tx: &Transaction) -> impl Iterator<Item = &Message> {
    tx.messages.iter().filter(|m| !m.is_signature())
}

/// Structural equality of two results, ignoring signature messages.
pub fn same_result(a: &Transaction, b: &Transaction) -> bool {
    non_signature_messages(a).eq(non_signature_messages(b))
}

/// Merge the candidate's first signature into `aggregate`.
///
/// Returns `Ok(true)` when a new entry was appended and `Ok(false)` when the
/// entry was already present.
pub fn merge_signature(
    aggregate: &mut Transaction,
    candidate: &Transaction,
) -> Result<bool, AggregateError> {
    if !same_result(aggregate, candidate) {
        return Err(AggregateError::Divergent);
    }
    let entry = candidate
        .signatures()
        .first()
        .ok_or(AggregateError::MissingSignature)?;
    let sigs = aggregate.signatures_mut();
    if sigs.iter().any(|s| s == entry) {
        return Ok(false);
    }
    sigs.push(entry.clone());
    Ok(true)
}

pub fn count_signatures(tx: &Transaction) -> usize {
    tx.signatures().len()
}

pub fn quorum_reached(tx: &Transaction, sig_num: usize) -> bool {
    count_signatures(tx) >= sig_num
}

/// Whether the first (local) signature is strictly the smallest on `tx`.
pub fn is_local_minimum_signature(tx: &Transaction) -> bool {
    let sigs = tx.signatures();
    let Some((local, rest)) = sigs.split_first() else {
        return false;
    };
    rest.iter()
        .filter(|other| other.public_key != local.public_key)
        .all(|other| local.signature < other.signature)
}

/// Build the local aggregate: `result` plus a signature message holding only
/// the local entry.
pub fn sign_result(result: &Transaction, keypair: &SigningKeypair) -> Transaction {
    let mut aggregate = Transaction::new(
        result
            .messages
            .iter()
            .filter(|m| !m.is_signature())
            .cloned()
            .collect(),
    );
    let signature = keypair.sign(&aggregate.sign_hash());
    aggregate.messages.push(Message::Signature(vec![SignatureEntry {
        public_key: keypair.public.clone(),
        signature,
    }]));
    aggregate
}

/// Check one entry against the transaction's sign hash.
pub fn verify_signature_entry(tx: &Transaction, entry: &SignatureEntry) -> bool {
    entry.public_key.verify(&tx.sign_hash(), &entry.signature)
}

/// Count entries that verify and belong to distinct committee members.
pub fn count_valid_signatures(tx: &Transaction, committee: &ElectionNode) -> usize {
    let sign_hash = tx.sign_hash();
    let mut signers = HashSet::new();
    for entry in tx.signatures() {
        let address = Address::from_public_key(&entry.public_key);
        if !committee.contains(&address) || signers.contains(&address) {
            continue;
        }
        if entry.public_key.verify(&sign_hash, &entry.signature) {
            signers.insert(address);
        }
    }
    signers.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::election::ElectionInfo;
    use crate::transaction::{Address, ContractRequest, ContractResult, StateWrite};

    fn result_tx(payload: &[u8]) -> Transaction {
        let contract = Address::contract_from_request(&[1u8; 32]);
        Transaction::new(vec![
            Message::ContractRequest(ContractRequest::Invoke {
                contract_id: contract,
                args: vec![b"inc".to_vec()],
            }),
            Message::ContractResult(ContractResult::Invoke {
                contract_id: contract,
                args: vec![b"inc".to_vec()],
                read_set: vec![],
                write_set: vec![StateWrite {
                    key: "counter".into(),
                    value: b"1".to_vec(),
                    is_delete: false,
                }],
                payload: payload.to_vec(),
            }),
        ])
    }

    #[test]
    fn same_result_ignores_signatures() {
        let a = sign_result(&result_tx(b"ok"), &SigningKeypair::generate());
        let b = sign_result(&result_tx(b"ok"), &SigningKeypair::generate());
        assert_ne!(a, b);
        assert!(same_result(&a, &b));
        assert!(same_result(&a, &result_tx(b"ok")));
    }

    #[test]
    fn same_result_detects_payload_difference() {
        assert!(!same_result(&result_tx(b"ok"), &result_tx(b"ko")));
    }

    #[test]
    fn merge_appends_and_is_idempotent() {
        let mut agg = sign_result(&result_tx(b"ok"), &SigningKeypair::generate());
        let cand = sign_result(&result_tx(b"ok"), &SigningKeypair::generate());
        assert_eq!(merge_signature(&mut agg, &cand), Ok(true));
        let once = agg.clone();
        assert_eq!(merge_signature(&mut agg, &cand), Ok(false));
        assert_eq!(agg, once);
        assert_eq!(count_signatures(&agg), 2);
    }

    #[test]
    fn merge_divergent_leaves_aggregate_untouched() {
        let mut agg = sign_result(&result_tx(b"ok"), &SigningKeypair::generate());
        let before = agg.clone();
        let cand = sign_result(&result_tx(b"bad"), &SigningKeypair::generate());
        assert_eq!(
            merge_signature(&mut agg, &cand),
            Err(AggregateError::Divergent)
        );
        assert_eq!(agg, before);
    }

    #[test]
    fn merge_requires_candidate_signature() {
        let mut agg = sign_result(&result_tx(b"ok"), &SigningKeypair::generate());
        assert_eq!(
            merge_signature(&mut agg, &result_tx(b"ok")),
            Err(AggregateError::MissingSignature)
        );
    }

    #[test]
    fn quorum_threshold() {
        let mut agg = sign_result(&result_tx(b"ok"), &SigningKeypair::generate());
        assert!(!quorum_reached(&agg, 2));
        let cand = sign_result(&result_tx(b"ok"), &SigningKeypair::generate());
        merge_signature(&mut agg, &cand).unwrap();
        assert!(quorum_reached(&agg, 2));
    }

    #[test]
    fn exactly_one_local_minimum() {
        let keys: Vec<_> = (0..3).map(|_| SigningKeypair::generate()).collect();
        let locals: Vec<_> = keys.iter().map(|k| sign_result(&result_tx(b"ok"), k)).collect();

        // every juror merges every other candidate
        let mut finals = Vec::new();
        for (i, local) in locals.iter().enumerate() {
            let mut agg = local.clone();
            for (j, other) in locals.iter().enumerate() {
                if i != j {
                    merge_signature(&mut agg, other).unwrap();
                }
            }
            finals.push(agg);
        }
        let committers = finals
            .iter()
            .filter(|agg| is_local_minimum_signature(agg))
            .count();
        assert_eq!(committers, 1);
    }

    #[test]
    fn no_signatures_is_not_minimum() {
        assert!(!is_local_minimum_signature(&result_tx(b"ok")));
    }

    #[test]
    fn valid_signature_count_filters_outsiders() {
        let member = SigningKeypair::generate();
        let outsider = SigningKeypair::generate();
        let mut agg = sign_result(&result_tx(b"ok"), &member);
        merge_signature(&mut agg, &sign_result(&result_tx(b"ok"), &outsider)).unwrap();

        let mut committee = ElectionNode::new(4, 4);
        committee.add_member(ElectionInfo {
            address: Address::from_public_key(&member.public),
            public_key: member.public.clone(),
            proof: vec![],
        });
        assert_eq!(count_signatures(&agg), 2);
        assert_eq!(count_valid_signatures(&agg, &committee), 1);
        assert!(verify_signature_entry(&agg, &agg.signatures()[0]));
    }
}
