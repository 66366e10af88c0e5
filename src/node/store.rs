//! Per-request lifecycle records and their expiry.
//!
//! One [`ExecutionRecord`] exists per request identifier. Records are created
//! by whichever event arrives first (EXEC, SIG, COMMIT, an adapter answer or
//! a local submission) and removed by [`RequestTable::reap`] once their TTL
//! runs out: a short TTL while the record is not valid, a long one after.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{oneshot, Mutex, MutexGuard};

use crate::consensus::aggregate;
use crate::consensus::election::ElectionNode;
use crate::crypto::keys::{Signature, SigningPublicKey};
use crate::transaction::{Address, Transaction};
use crate::Hash;

/// Adapter answers are grouped by message type and consultation content.
pub type AdapterKey = (u32, Vec<u8>);

/// One juror's signed answer to a consultation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdapterAnswer {
    pub public_key: SigningPublicKey,
    pub answer: Vec<u8>,
    pub signature: Signature,
}

/// Entry of the JSON document returned by an adapter result query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct JuryAnswer {
    pub address: String,
    /// Hex-encoded answer bytes
    pub answer: String,
}

/// An election the local node started and is still collecting.
#[derive(Clone, Debug)]
pub struct PendingElection {
    pub seed: Hash,
    pub node: ElectionNode,
}

/// Lifecycle of one request.
pub struct ExecutionRecord {
    pub request_tx: Option<Transaction>,
    /// Local execution output (system results carry the mediator signature)
    pub result_tx: Option<Transaction>,
    /// Local result plus merged juror signatures
    pub aggregate_tx: Option<Transaction>,
    /// SIG candidates received before local execution finished
    pub pending_candidates: Vec<Transaction>,
    pub committee: Option<ElectionNode>,
    pub election: Option<PendingElection>,
    pub created_at: Instant,
    /// Whether the record expires on the long TTL
    pub valid: bool,
    pub exec_relayed: bool,
    pub executing: bool,
    pub committed: bool,
    /// Handed to the ledger-construction stage
    pub packaged: bool,
    pub error: Option<String>,
    pub adapter_answers: HashMap<AdapterKey, Vec<AdapterAnswer>>,
    pub adapter_waiters: HashMap<AdapterKey, oneshot::Sender<Vec<u8>>>,
}

impl ExecutionRecord {
    pub fn new(created_at: Instant) -> Self {
        ExecutionRecord {
            request_tx: None,
            result_tx: None,
            aggregate_tx: None,
            pending_candidates: Vec::new(),
            committee: None,
            election: None,
            created_at,
            valid: false,
            exec_relayed: false,
            executing: false,
            committed: false,
            packaged: false,
            error: None,
            adapter_answers: HashMap::new(),
            adapter_waiters: HashMap::new(),
        }
    }

    /// Claim the execution slot. Returns false if execution is running,
    /// finished, or failed.
    pub fn try_start_execution(&mut self) -> bool {
        if self.executing
            || self.result_tx.is_some()
            || self.aggregate_tx.is_some()
            || self.error.is_some()
        {
            return false;
        }
        self.executing = true;
        true
    }

    /// Record an execution failure; the record then expires on the short TTL.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.executing = false;
        self.valid = false;
        self.error = Some(error.into());
    }

    /// JSON result for a consultation once `threshold` answers are present.
    pub fn adapter_result(
        &self,
        key: &AdapterKey,
        threshold: usize,
    ) -> Result<Option<Vec<u8>>, serde_json::Error> {
        match self.adapter_answers.get(key) {
            Some(answers) if answers.len() >= threshold => encode_answers(answers).map(Some),
            _ => Ok(None),
        }
    }

    pub fn phase(&self, sig_num: usize) -> RecordPhase {
        if self.committed {
            RecordPhase::Committed
        } else if self.error.is_some() {
            RecordPhase::Failed
        } else if self.election.is_some() {
            RecordPhase::Electing
        } else if self.executing {
            RecordPhase::Executing
        } else if let Some(agg) = &self.aggregate_tx {
            if aggregate::quorum_reached(agg, sig_num) {
                RecordPhase::QuorumReached
            } else {
                RecordPhase::CollectingSignatures
            }
        } else if self.result_tx.is_some() {
            RecordPhase::Executed
        } else {
            RecordPhase::Pending
        }
    }

    fn expires_after(&self, invalid_ttl: Duration, valid_ttl: Duration) -> Duration {
        if self.valid {
            valid_ttl
        } else {
            invalid_ttl
        }
    }
}

/// Encode collected answers as `[{"address", "answer"}]`.
pub fn encode_answers(answers: &[AdapterAnswer]) -> Result<Vec<u8>, serde_json::Error> {
    let entries: Vec<JuryAnswer> = answers
        .iter()
        .map(|a| JuryAnswer {
            address: Address::from_public_key(&a.public_key).to_string(),
            answer: hex::encode(&a.answer),
        })
        .collect();
    serde_json::to_vec(&entries)
}

/// Coarse state of a record, for inspection and logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordPhase {
    /// Known but nothing has happened locally yet
    Pending,
    Electing,
    Executing,
    /// Executed without a signature round (system contracts)
    Executed,
    CollectingSignatures,
    QuorumReached,
    Committed,
    Failed,
}

/// Read-only copy of a record's observable state.
#[derive(Clone, Debug)]
pub struct RecordSnapshot {
    pub request_id: Hash,
    pub phase: RecordPhase,
    pub valid: bool,
    pub committed: bool,
    pub packaged: bool,
    pub signature_count: usize,
    pub pending_candidates: usize,
    pub result_tx: Option<Transaction>,
    pub aggregate_tx: Option<Transaction>,
    pub committee: Option<ElectionNode>,
    pub error: Option<String>,
    pub adapter_waiters: usize,
}

/// The request table shared by every event task.
#[derive(Default)]
pub struct RequestTable {
    records: Mutex<HashMap<Hash, ExecutionRecord>>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> MutexGuard<'_, HashMap<Hash, ExecutionRecord>> {
        self.records.lock().await
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    pub async fn snapshot(&self, request_id: &Hash, sig_num: usize) -> Option<RecordSnapshot> {
        let records = self.records.lock().await;
        let rec = records.get(request_id)?;
        Some(RecordSnapshot {
            request_id: *request_id,
            phase: rec.phase(sig_num),
            valid: rec.valid,
            committed: rec.committed,
            packaged: rec.packaged,
            signature_count: rec
                .aggregate_tx
                .as_ref()
                .map(aggregate::count_signatures)
                .unwrap_or(0),
            pending_candidates: rec.pending_candidates.len(),
            result_tx: rec.result_tx.clone(),
            aggregate_tx: rec.aggregate_tx.clone(),
            committee: rec.committee.clone(),
            error: rec.error.clone(),
            adapter_waiters: rec.adapter_waiters.len(),
        })
    }

    /// Remove every record older than its TTL. Returns how many were removed.
    pub async fn reap(&self, now: Instant, invalid_ttl: Duration, valid_ttl: Duration) -> usize {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, rec| {
            now.saturating_duration_since(rec.created_at) < rec.expires_after(invalid_ttl, valid_ttl)
        });
        before - records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::SigningKeypair;

    const SHORT: Duration = Duration::from_secs(120);
    const LONG: Duration = Duration::from_secs(600);

    #[tokio::test]
    async fn reap_uses_short_ttl_for_invalid_records() {
        let table = RequestTable::new();
        let start = Instant::now();
        {
            let mut records = table.lock().await;
            records.insert([1u8; 32], ExecutionRecord::new(start));
            let mut valid = ExecutionRecord::new(start);
            valid.valid = true;
            records.insert([2u8; 32], valid);
        }

        assert_eq!(table.reap(start + Duration::from_secs(119), SHORT, LONG).await, 0);
        assert_eq!(table.reap(start + SHORT, SHORT, LONG).await, 1);
        assert!(table.snapshot(&[1u8; 32], 3).await.is_none());
        assert!(table.snapshot(&[2u8; 32], 3).await.is_some());

        assert_eq!(table.reap(start + Duration::from_secs(599), SHORT, LONG).await, 0);
        assert_eq!(table.reap(start + LONG, SHORT, LONG).await, 1);
        assert!(table.is_empty().await);
    }

    #[test]
    fn execution_slot_claimed_once() {
        let mut rec = ExecutionRecord::new(Instant::now());
        assert!(rec.try_start_execution());
        assert!(!rec.try_start_execution());
        rec.fail("vm crashed");
        assert!(!rec.try_start_execution());
        assert!(!rec.valid);
        assert_eq!(rec.phase(3), RecordPhase::Failed);
    }

    #[test]
    fn adapter_result_requires_threshold() {
        let kp = SigningKeypair::generate();
        let mut rec = ExecutionRecord::new(Instant::now());
        let key: AdapterKey = (1, b"price".to_vec());
        rec.adapter_answers.entry(key.clone()).or_default().push(AdapterAnswer {
            public_key: kp.public.clone(),
            answer: b"42".to_vec(),
            signature: Signature::empty(),
        });
        assert_eq!(rec.adapter_result(&key, 2).unwrap(), None);

        let json = rec.adapter_result(&key, 1).unwrap().unwrap();
        let parsed: Vec<JuryAnswer> = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].answer, "3432");
        assert_eq!(
            parsed[0].address,
            Address::from_public_key(&kp.public).to_string()
        );
    }

    #[test]
    fn phase_follows_flags() {
        let mut rec = ExecutionRecord::new(Instant::now());
        assert_eq!(rec.phase(3), RecordPhase::Pending);
        rec.election = Some(PendingElection {
            seed: [0u8; 32],
            node: ElectionNode::new(4, 3),
        });
        assert_eq!(rec.phase(3), RecordPhase::Electing);
        rec.election = None;
        rec.executing = true;
        assert_eq!(rec.phase(3), RecordPhase::Executing);
        rec.executing = false;
        rec.committed = true;
        assert_eq!(rec.phase(3), RecordPhase::Committed);
    }
}
