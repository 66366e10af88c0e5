//! Jury election by VRF sortition.
//!
//! Each active juror evaluates its VRF on the contract's election seed and
//! runs [`selected`]. Winners publish an [`ElectionInfo`]; a requester gathers
//! them into an [`ElectionNode`] that every later event carries. Anyone can
//! re-check an `ElectionNode` from the public keys and proofs alone.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::crypto::keys::{SigningKeypair, SigningPublicKey};
use crate::crypto::sortition::{election_weight_value, selected, SortitionError};
use crate::crypto::vrf::VrfOutput;
use crate::state::LedgerQuery;
use crate::transaction::{Address, Transaction, TxShapeError};
use crate::Hash;

/// Errors from committee validation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ElectionError {
    #[error("committee has {got} members, {need} required")]
    TooFewMembers { got: usize, need: usize },
    #[error("duplicate committee member {0}")]
    DuplicateMember(Address),
    #[error("address {0} does not belong to its public key")]
    AddressMismatch(Address),
    #[error("{0} is not an active juror")]
    InactiveJuror(Address),
    #[error("VRF proof of {0} does not verify")]
    InvalidProof(Address),
    #[error("{0} was not selected by sortition")]
    NotSelected(Address),
    #[error("claimed jury count {claimed} too far from local count {local}")]
    JuryCountMismatch { claimed: u64, local: u64 },
    #[error("committee size parameter {claimed} differs from expected {expected}")]
    ExpectedSizeMismatch { claimed: u64, expected: u64 },
    #[error("sortition: {0}")]
    Sortition(#[from] SortitionError),
}

/// One elected juror and the evidence of its election.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionInfo {
    pub address: Address,
    pub public_key: SigningPublicKey,
    /// VRF proof over the election seed
    pub proof: Vec<u8>,
}

/// The committee proof attached to user-contract events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionNode {
    /// Active jury count the election was run against (total weight)
    pub jury_count: u64,
    /// Expected committee size used by sortition
    pub expected: u64,
    pub members: Vec<ElectionInfo>,
}

impl ElectionNode {
    pub fn new(jury_count: u64, expected: u64) -> Self {
        ElectionNode {
            jury_count,
            expected,
            members: Vec::new(),
        }
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.members.iter().any(|m| &m.address == address)
    }

    /// Add a member unless its address is already present.
    pub fn add_member(&mut self, info: ElectionInfo) -> bool {
        if self.contains(&info.address) {
            return false;
        }
        self.members.push(info);
        true
    }
}

/// Election seed for a contract.
pub fn election_seed(contract_id: &Address) -> Hash {
    crate::hash_concat(&[b"jury.election.seed", contract_id.as_bytes()])
}

/// Contract whose jury handles a request.
///
/// A deploy creates the contract at the address derived from its own request
/// id; invoke and stop name their target. Install has no contract yet and
/// also maps to the derived address.
pub fn request_contract(tx: &Transaction) -> Result<Address, TxShapeError> {
    Ok(tx
        .contract_request()?
        .target()
        .unwrap_or_else(|| Address::contract_from_request(&tx.request_id())))
}

/// Expected committee size: the configured value, or the weight table.
pub fn expected_committee_size(configured: u64, jury_count: u64) -> u64 {
    if configured > 0 {
        configured
    } else {
        election_weight_value(jury_count)
    }
}

/// Run sortition for one local juror.
///
/// Returns the election evidence when the juror wins at least one seat.
pub fn elect(
    keypair: &SigningKeypair,
    seed: &Hash,
    expected: u64,
    jury_count: u64,
) -> Result<Option<ElectionInfo>, ElectionError> {
    let vrf = VrfOutput::evaluate(keypair, seed);
    let seats = selected(expected, 1, jury_count, &vrf.value)?;
    if seats == 0 {
        return Ok(None);
    }
    Ok(Some(ElectionInfo {
        address: Address::from_public_key(&keypair.public),
        public_key: keypair.public.clone(),
        proof: vrf.proof,
    }))
}

/// Check one member's election evidence against the seed.
pub fn verify_member(
    info: &ElectionInfo,
    seed: &Hash,
    expected: u64,
    jury_count: u64,
    ledger: &dyn LedgerQuery,
) -> Result<(), ElectionError> {
    if Address::from_public_key(&info.public_key) != info.address {
        return Err(ElectionError::AddressMismatch(info.address));
    }
    if !ledger.is_active_jury(&info.address) {
        return Err(ElectionError::InactiveJuror(info.address));
    }
    let vrf = VrfOutput::from_proof(&info.public_key, seed, &info.proof)
        .ok_or(ElectionError::InvalidProof(info.address))?;
    if selected(expected, 1, jury_count, &vrf.value)? == 0 {
        return Err(ElectionError::NotSelected(info.address));
    }
    Ok(())
}

/// Whether a claimed jury count is within tolerance of the local count.
pub fn jury_count_valid(claimed: u64, local: u64) -> bool {
    if local == 0 {
        return false;
    }
    // widened so a peer-supplied count cannot overflow the percentage
    u128::from(claimed.abs_diff(local)) * 100
        <= u128::from(local) * u128::from(crate::constants::JURY_COUNT_TOLERANCE_PERCENT)
}

/// Validate a full committee proof.
pub fn validate_election(
    node: &ElectionNode,
    seed: &Hash,
    election_num: usize,
    configured_size: u64,
    ledger: &dyn LedgerQuery,
) -> Result<(), ElectionError> {
    if node.members.len() < election_num {
        return Err(ElectionError::TooFewMembers {
            got: node.members.len(),
            need: election_num,
        });
    }
    let local = ledger.jury_count();
    if !jury_count_valid(node.jury_count, local) {
        return Err(ElectionError::JuryCountMismatch {
            claimed: node.jury_count,
            local,
        });
    }
    let expected = expected_committee_size(configured_size, node.jury_count);
    if node.expected != expected {
        return Err(ElectionError::ExpectedSizeMismatch {
            claimed: node.expected,
            expected,
        });
    }
    let mut seen = HashSet::new();
    for member in &node.members {
        if !seen.insert(member.address) {
            return Err(ElectionError::DuplicateMember(member.address));
        }
        verify_member(member, seed, node.expected, node.jury_count, ledger)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryLedger;
    use crate::transaction::builder::RequestBuilder;

    /// Generate jurors until `n` of them win a seat for `seed`.
    fn elected_jurors(
        ledger: &MemoryLedger,
        seed: &Hash,
        n: usize,
        expected: u64,
        total: u64,
    ) -> Vec<(SigningKeypair, ElectionInfo)> {
        let mut out = Vec::new();
        while out.len() < n {
            let kp = SigningKeypair::generate();
            if let Some(info) = elect(&kp, seed, expected, total).unwrap() {
                ledger.add_jury(info.address);
                out.push((kp, info));
            }
        }
        out
    }

    fn padded_ledger(total: u64) -> MemoryLedger {
        let ledger = MemoryLedger::new();
        // filler jurors so jury_count() matches `total`
        for i in 0..total as u8 {
            ledger.add_jury(Address {
                kind: crate::transaction::AddressKind::Account,
                hash: [0xf0u8.wrapping_add(i); 20],
            });
        }
        ledger
    }

    #[test]
    fn valid_committee_passes() {
        let seed = election_seed(&Address::contract_from_request(&[1u8; 32]));
        let ledger = padded_ledger(0);
        let jurors = elected_jurors(&ledger, &seed, 3, 2, 4);
        // 3 elected jurors plus one filler keeps the count at 4
        ledger.add_jury(Address {
            kind: crate::transaction::AddressKind::Account,
            hash: [0xee; 20],
        });
        let mut node = ElectionNode::new(4, 2);
        for (_, info) in &jurors {
            assert!(node.add_member(info.clone()));
        }
        assert_eq!(validate_election(&node, &seed, 3, 2, &ledger), Ok(()));
    }

    #[test]
    fn too_few_members_rejected() {
        let ledger = padded_ledger(4);
        let node = ElectionNode::new(4, 2);
        assert_eq!(
            validate_election(&node, &[0u8; 32], 1, 2, &ledger),
            Err(ElectionError::TooFewMembers { got: 0, need: 1 })
        );
    }

    #[test]
    fn wrong_seed_rejected() {
        let seed = election_seed(&Address::system_contract(3));
        let ledger = padded_ledger(0);
        let jurors = elected_jurors(&ledger, &seed, 1, 4, 4);
        let (_, info) = &jurors[0];
        let res = verify_member(info, &[9u8; 32], 4, 4, &ledger);
        assert_eq!(res, Err(ElectionError::InvalidProof(info.address)));
    }

    #[test]
    fn inactive_juror_rejected() {
        let kp = SigningKeypair::generate();
        let seed = [5u8; 32];
        let info = ElectionInfo {
            address: Address::from_public_key(&kp.public),
            public_key: kp.public.clone(),
            proof: VrfOutput::evaluate(&kp, &seed).proof,
        };
        let ledger = MemoryLedger::new();
        assert_eq!(
            verify_member(&info, &seed, 4, 4, &ledger),
            Err(ElectionError::InactiveJuror(info.address))
        );
    }

    #[test]
    fn address_mismatch_rejected() {
        let kp = SigningKeypair::generate();
        let other = SigningKeypair::generate();
        let seed = [6u8; 32];
        let info = ElectionInfo {
            address: Address::from_public_key(&other.public),
            public_key: kp.public.clone(),
            proof: VrfOutput::evaluate(&kp, &seed).proof,
        };
        let ledger = MemoryLedger::new();
        assert_eq!(
            verify_member(&info, &seed, 4, 4, &ledger),
            Err(ElectionError::AddressMismatch(info.address))
        );
    }

    #[test]
    fn duplicate_member_rejected() {
        let seed = [7u8; 32];
        let ledger = padded_ledger(3);
        let jurors = elected_jurors(&ledger, &seed, 1, 4, 4);
        let mut node = ElectionNode::new(4, 4);
        node.members.push(jurors[0].1.clone());
        node.members.push(jurors[0].1.clone());
        assert_eq!(
            validate_election(&node, &seed, 2, 4, &ledger),
            Err(ElectionError::DuplicateMember(jurors[0].1.address))
        );
    }

    #[test]
    fn expected_size_must_match_local_parameter() {
        let ledger = padded_ledger(4);
        let mut node = ElectionNode::new(4, 4);
        node.members.push(ElectionInfo {
            address: Address::system_contract(1),
            public_key: SigningKeypair::generate().public,
            proof: vec![],
        });
        assert_eq!(
            validate_election(&node, &[0u8; 32], 1, 2, &ledger),
            Err(ElectionError::ExpectedSizeMismatch {
                claimed: 4,
                expected: 2
            })
        );
    }

    #[test]
    fn jury_count_tolerance() {
        assert!(jury_count_valid(100, 100));
        assert!(jury_count_valid(110, 100));
        assert!(jury_count_valid(90, 100));
        assert!(!jury_count_valid(112, 100));
        assert!(!jury_count_valid(5, 0));
    }

    #[test]
    fn jury_count_tolerance_rejects_huge_claims() {
        assert!(!jury_count_valid(u64::MAX, 10));
        assert!(!jury_count_valid(10 + 184_467_440_737_095_517, 10));
        assert!(!jury_count_valid(0, u64::MAX));
        assert!(jury_count_valid(u64::MAX, u64::MAX));
    }

    #[test]
    fn expected_size_falls_back_to_weight_table() {
        assert_eq!(expected_committee_size(3, 1000), 3);
        assert_eq!(expected_committee_size(0, 30), 7);
    }

    #[test]
    fn deploy_contract_derives_from_request_id() {
        let tx = RequestBuilder::new()
            .deploy([1u8; 32], vec![])
            .build()
            .unwrap();
        assert_eq!(
            request_contract(&tx).unwrap(),
            Address::contract_from_request(&tx.request_id())
        );

        let target = Address::contract_from_request(&[8u8; 32]);
        let invoke = RequestBuilder::new().invoke(target, vec![]).build().unwrap();
        assert_eq!(request_contract(&invoke).unwrap(), target);

        let stop = RequestBuilder::new().stop(target).build().unwrap();
        assert_eq!(request_contract(&stop).unwrap(), target);
        let install = RequestBuilder::new()
            .install("t", b"code".to_vec(), "1")
            .build()
            .unwrap();
        assert_eq!(
            request_contract(&install).unwrap(),
            Address::contract_from_request(&install.request_id())
        );
    }
}
