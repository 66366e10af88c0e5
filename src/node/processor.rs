//! Request coordinator.
//!
//! A [`Processor`] drives every request through its lifecycle:
//!
//! 1. **Dispatch.** System requests (Install, system-marked contracts) go to
//!    the mediators. User requests go to a committee, either the jury stored
//!    for the contract or one gathered by an election round.
//! 2. **EXEC.** Each committee member executes the request once, signs the
//!    result and broadcasts it as a SIG candidate. The first EXEC a node
//!    sees is relayed once.
//! 3. **SIG.** Candidates that match the local result contribute their
//!    signature to the local aggregate. Candidates that arrive before local
//!    execution finishes are buffered and replayed.
//! 4. **COMMIT.** Once the aggregate holds `contract_sig_num` signatures, the
//!    juror holding the smallest signature broadcasts COMMIT. The other
//!    committee members adopt the verified aggregate. Mediators keep it until
//!    the ledger-construction stage picks it up through
//!    [`Processor::build_contract_txs`].
//!
//! Events are processed concurrently; all per-request state lives in one
//! [`RequestTable`] guarded by a single async mutex. Broadcasts are
//! fire-and-forget and are never sent while the table is locked.

use std::sync::Arc;
use std::time::Instant;

use super::adapter::AdapterError;
use super::store::{ExecutionRecord, PendingElection, RecordSnapshot, RequestTable};
use crate::config::ProcessorConfig;
use crate::consensus::aggregate::{self, AggregateError};
use crate::consensus::election::{self, ElectionError, ElectionInfo, ElectionNode};
use crate::contract::{self, ContractVm, ExecutionError, ExecutionOutput};
use crate::crypto::keys::SigningKeypair;
use crate::network::{
    ContractEvent, ContractEventKind, ElectionEvent, EventHandle, NetworkError, ProtocolEvent,
};
use crate::state::LedgerQuery;
use crate::transaction::{Address, Transaction, TxShapeError};
use crate::{short_id, Hash};

/// Errors surfaced by event processing. Events that are simply not addressed
/// to this node are dropped without an error.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("malformed request: {0}")]
    Malformed(#[from] TxShapeError),
    #[error("invalid committee: {0}")]
    InvalidCommittee(#[from] ElectionError),
    #[error("user contract event for request {} carries no committee", short_id(.0))]
    MissingCommittee(Hash),
    #[error(
        "commit for request {} carries {valid} valid signatures, {required} required",
        short_id(.request_id)
    )]
    InsufficientSignatures {
        request_id: Hash,
        valid: usize,
        required: usize,
    },
    #[error("election parameters rejected: jury count {jury_count}, expected size {expected}")]
    ElectionParameters { jury_count: u64, expected: u64 },
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("execution task failed: {0}")]
    TaskFailed(String),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// A signing account held by this node.
#[derive(Clone, Debug)]
pub struct LocalAccount {
    pub address: Address,
    pub keypair: SigningKeypair,
}

impl LocalAccount {
    pub fn new(keypair: SigningKeypair) -> Self {
        LocalAccount {
            address: Address::from_public_key(&keypair.public),
            keypair,
        }
    }
}

struct Inner {
    config: ProcessorConfig,
    accounts: Vec<LocalAccount>,
    ledger: Arc<dyn LedgerQuery>,
    vm: Arc<dyn ContractVm>,
    network: EventHandle,
    table: RequestTable,
}

/// The per-node request coordinator. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Processor {
    inner: Arc<Inner>,
}

impl Processor {
    pub fn new(
        config: ProcessorConfig,
        keypairs: Vec<SigningKeypair>,
        ledger: Arc<dyn LedgerQuery>,
        vm: Arc<dyn ContractVm>,
        network: EventHandle,
    ) -> Self {
        Processor {
            inner: Arc::new(Inner {
                config,
                accounts: keypairs.into_iter().map(LocalAccount::new).collect(),
                ledger,
                vm,
                network,
                table: RequestTable::new(),
            }),
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.inner.config
    }

    pub fn accounts(&self) -> &[LocalAccount] {
        &self.inner.accounts
    }

    pub(super) fn table(&self) -> &RequestTable {
        &self.inner.table
    }

    /// First local account registered as an active mediator.
    pub fn local_mediator(&self) -> Option<&LocalAccount> {
        self.inner
            .accounts
            .iter()
            .find(|a| self.inner.ledger.is_active_mediator(&a.address))
    }

    /// First local account registered as an active juror.
    pub fn local_juror(&self) -> Option<&LocalAccount> {
        self.inner
            .accounts
            .iter()
            .find(|a| self.inner.ledger.is_active_jury(&a.address))
    }

    fn local_member(&self, committee: &ElectionNode) -> Option<&LocalAccount> {
        self.inner
            .accounts
            .iter()
            .find(|a| committee.contains(&a.address))
    }

    /// Send without waiting. Failures only mean the hub is gone.
    pub(super) fn broadcast(&self, event: ProtocolEvent) {
        let network = self.inner.network.clone();
        tokio::spawn(async move {
            if let Err(e) = network.broadcast(&event).await {
                tracing::warn!(
                    request = %short_id(&event.request_id()),
                    error = %e,
                    "Broadcast failed"
                );
            }
        });
    }

    /// Route an inbound network event.
    pub async fn handle_event(&self, event: ProtocolEvent) -> Result<(), ProcessorError> {
        match event {
            ProtocolEvent::Contract(ev) => self.process_contract_event(ev).await,
            ProtocolEvent::Election(ev) => self.process_election_event(ev).await,
            ProtocolEvent::Adapter(ev) => self.process_adapter_event(ev).await,
        }
    }

    // ── Submission ──

    /// Accept a request from a local client and start its lifecycle.
    pub async fn submit_request(&self, tx: Transaction) -> Result<Hash, ProcessorError> {
        tx.validate_shape()?;
        let request_id = tx.request_id();
        let request_tx = tx.request_tx();
        if self.inner.ledger.is_request_committed(&request_id) {
            tracing::debug!(request = %short_id(&request_id), "Request already on the ledger");
            return Ok(request_id);
        }

        if contract::is_system_contract(&request_tx) {
            tracing::info!(request = %short_id(&request_id), "System request submitted");
            self.begin_exec(request_id, request_tx, None).await?;
            return Ok(request_id);
        }

        let contract_id = election::request_contract(&request_tx)?;
        if let Some(jury) = self.inner.ledger.contract_jury(&contract_id) {
            tracing::info!(
                request = %short_id(&request_id),
                contract = %contract_id,
                "User request submitted to stored jury"
            );
            self.begin_exec(request_id, request_tx, Some(jury)).await?;
        } else {
            self.start_election(request_id, contract_id, request_tx)
                .await?;
        }
        Ok(request_id)
    }

    /// Process EXEC locally, then broadcast it. The record is marked relayed
    /// first so local processing does not broadcast a second copy.
    async fn begin_exec(
        &self,
        request_id: Hash,
        request_tx: Transaction,
        committee: Option<ElectionNode>,
    ) -> Result<(), ProcessorError> {
        {
            let mut table = self.inner.table.lock().await;
            table
                .entry(request_id)
                .or_insert_with(|| ExecutionRecord::new(Instant::now()))
                .exec_relayed = true;
        }
        let event = ContractEvent {
            kind: ContractEventKind::Exec,
            committee,
            tx: request_tx,
        };
        self.process_contract_event(event.clone()).await?;
        self.broadcast(ProtocolEvent::Contract(event));
        Ok(())
    }

    // ── Election ──

    async fn start_election(
        &self,
        request_id: Hash,
        contract_id: Address,
        request_tx: Transaction,
    ) -> Result<(), ProcessorError> {
        let jury_count = self.inner.ledger.jury_count();
        let expected =
            election::expected_committee_size(self.inner.config.committee_size, jury_count);
        let seed = election::election_seed(&contract_id);
        {
            let mut table = self.inner.table.lock().await;
            let rec = table
                .entry(request_id)
                .or_insert_with(|| ExecutionRecord::new(Instant::now()));
            if rec.election.is_some() || rec.committee.is_some() {
                tracing::debug!(request = %short_id(&request_id), "Election already under way");
                return Ok(());
            }
            rec.request_tx = Some(request_tx);
            rec.election = Some(PendingElection {
                seed,
                node: ElectionNode::new(jury_count, expected),
            });
        }
        tracing::info!(
            request = %short_id(&request_id),
            contract = %contract_id,
            jury_count,
            expected,
            "Election started"
        );
        self.broadcast(ProtocolEvent::Election(ElectionEvent::Request {
            request_id,
            expected,
            jury_count,
            seed,
        }));
        self.spawn_election_timeout(request_id);

        for info in self.run_local_sortition(&seed, expected, jury_count) {
            self.add_election_result(request_id, info).await?;
        }
        Ok(())
    }

    fn spawn_election_timeout(&self, request_id: Hash) {
        let this = self.clone();
        let timeout = self.inner.config.election_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut table = this.inner.table.lock().await;
            if let Some(rec) = table.get_mut(&request_id) {
                if let Some(pending) = rec.election.take() {
                    tracing::warn!(
                        request = %short_id(&request_id),
                        collected = pending.node.members.len(),
                        needed = this.inner.config.election_num,
                        "Election timed out"
                    );
                    rec.fail("election timed out");
                }
            }
        });
    }

    fn run_local_sortition(&self, seed: &Hash, expected: u64, jury_count: u64) -> Vec<ElectionInfo> {
        self.inner
            .accounts
            .iter()
            .filter(|a| self.inner.ledger.is_active_jury(&a.address))
            .filter_map(
                |a| match election::elect(&a.keypair, seed, expected, jury_count) {
                    Ok(info) => info,
                    Err(e) => {
                        tracing::warn!(account = %a.address, error = %e, "Sortition failed");
                        None
                    }
                },
            )
            .collect()
    }

    /// Handle an election request from a peer or a result for our own election.
    pub async fn process_election_event(&self, event: ElectionEvent) -> Result<(), ProcessorError> {
        match event {
            ElectionEvent::Request {
                request_id,
                expected,
                jury_count,
                seed,
            } => {
                let local = self.inner.ledger.jury_count();
                let want =
                    election::expected_committee_size(self.inner.config.committee_size, jury_count);
                if !election::jury_count_valid(jury_count, local) || expected != want {
                    return Err(ProcessorError::ElectionParameters {
                        jury_count,
                        expected,
                    });
                }
                for info in self.run_local_sortition(&seed, expected, jury_count) {
                    tracing::debug!(
                        request = %short_id(&request_id),
                        juror = %info.address,
                        "Selected by sortition"
                    );
                    self.broadcast(ProtocolEvent::Election(ElectionEvent::Result {
                        request_id,
                        info,
                    }));
                }
                Ok(())
            }
            ElectionEvent::Result { request_id, info } => {
                self.add_election_result(request_id, info).await
            }
        }
    }

    /// Add one verified member to a pending election. When the election has
    /// enough members the committee is fixed and EXEC is dispatched.
    async fn add_election_result(
        &self,
        request_id: Hash,
        info: ElectionInfo,
    ) -> Result<(), ProcessorError> {
        let (request_tx, committee) = {
            let mut table = self.inner.table.lock().await;
            let Some(rec) = table.get_mut(&request_id) else {
                return Ok(());
            };
            let Some(pending) = rec.election.as_mut() else {
                return Ok(());
            };
            election::verify_member(
                &info,
                &pending.seed,
                pending.node.expected,
                pending.node.jury_count,
                self.inner.ledger.as_ref(),
            )?;
            if !pending.node.add_member(info) {
                return Ok(());
            }
            if pending.node.members.len() < self.inner.config.election_num {
                return Ok(());
            }
            let Some(done) = rec.election.take() else {
                return Ok(());
            };
            rec.committee = Some(done.node.clone());
            let Some(request_tx) = rec.request_tx.clone() else {
                return Ok(());
            };
            (request_tx, done.node)
        };
        tracing::info!(
            request = %short_id(&request_id),
            members = committee.members.len(),
            "Committee formed"
        );
        self.begin_exec(request_id, request_tx, Some(committee))
            .await
    }

    // ── Contract events ──

    fn validate_committee(
        &self,
        tx: &Transaction,
        committee: &ElectionNode,
    ) -> Result<(), ProcessorError> {
        let contract_id = election::request_contract(tx)?;
        let seed = election::election_seed(&contract_id);
        election::validate_election(
            committee,
            &seed,
            self.inner.config.election_num,
            self.inner.config.committee_size,
            self.inner.ledger.as_ref(),
        )?;
        Ok(())
    }

    fn event_executable(
        &self,
        kind: ContractEventKind,
        system: bool,
        committee: Option<&ElectionNode>,
    ) -> bool {
        match (kind, system) {
            (ContractEventKind::Exec, true) => self.local_mediator().is_some(),
            (ContractEventKind::Exec, false) | (ContractEventKind::Sig, false) => {
                committee.and_then(|c| self.local_member(c)).is_some()
            }
            (ContractEventKind::Sig, true) => false,
            (ContractEventKind::Commit, true) => self.local_mediator().is_some(),
            // committee members adopt the final aggregate so every juror ends at quorum
            (ContractEventKind::Commit, false) => {
                self.local_mediator().is_some()
                    || committee.and_then(|c| self.local_member(c)).is_some()
            }
        }
    }

    /// Whether this node should act on an event of `kind` for `tx`.
    ///
    /// EXEC on a system request needs a local mediator. EXEC and SIG on a user
    /// request need a local account in a valid committee. COMMIT on a system
    /// request needs a local mediator; on a user request it needs a valid
    /// committee and either a local mediator or a local member.
    pub fn contract_event_executable(
        &self,
        kind: ContractEventKind,
        tx: &Transaction,
        committee: Option<&ElectionNode>,
    ) -> bool {
        let system = contract::is_system_contract(tx);
        if !system {
            match committee {
                Some(c) if self.validate_committee(tx, c).is_ok() => {}
                _ => return false,
            }
        }
        self.event_executable(kind, system, committee)
    }

    /// Validate and apply one EXEC, SIG or COMMIT event.
    pub async fn process_contract_event(&self, event: ContractEvent) -> Result<(), ProcessorError> {
        let ContractEvent { kind, committee, tx } = event;
        tx.validate_shape()?;
        let request_id = tx.request_id();
        let system = contract::is_system_contract(&tx);
        if !system {
            let node = committee
                .as_ref()
                .ok_or(ProcessorError::MissingCommittee(request_id))?;
            self.validate_committee(&tx, node)?;
        }
        if self.inner.ledger.is_request_committed(&request_id) {
            tracing::debug!(request = %short_id(&request_id), %kind, "Request already on the ledger");
            return Ok(());
        }
        if !self.event_executable(kind, system, committee.as_ref()) {
            tracing::debug!(request = %short_id(&request_id), %kind, "Event not addressed to this node");
            return Ok(());
        }
        match kind {
            ContractEventKind::Exec => self.process_exec(request_id, tx, committee, system).await,
            ContractEventKind::Sig => self.process_sig(request_id, tx, committee).await,
            ContractEventKind::Commit => {
                self.process_commit(request_id, tx, committee, system)
                    .await
            }
        }
    }

    async fn process_exec(
        &self,
        request_id: Hash,
        tx: Transaction,
        committee: Option<ElectionNode>,
        system: bool,
    ) -> Result<(), ProcessorError> {
        let request_tx = tx.request_tx();
        let (relay, start) = {
            let mut table = self.inner.table.lock().await;
            let rec = table
                .entry(request_id)
                .or_insert_with(|| ExecutionRecord::new(Instant::now()));
            if rec.committed {
                return Ok(());
            }
            rec.valid = rec.error.is_none();
            if rec.request_tx.is_none() {
                rec.request_tx = Some(request_tx.clone());
            }
            if rec.committee.is_none() {
                rec.committee = committee.clone();
            }
            let relay = !rec.exec_relayed;
            rec.exec_relayed = true;
            // system requests run at ledger-construction time
            let start = !system && rec.try_start_execution();
            (relay, start)
        };
        tracing::debug!(request = %short_id(&request_id), system, relay, start, "EXEC accepted");
        if relay {
            self.broadcast(ProtocolEvent::Contract(ContractEvent {
                kind: ContractEventKind::Exec,
                committee,
                tx: request_tx.clone(),
            }));
        }
        if start {
            self.spawn_execution(request_id, request_tx);
        }
        Ok(())
    }

    fn spawn_execution(&self, request_id: Hash, request_tx: Transaction) {
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = this.execute(&request_tx).await;
            this.on_execution_complete(request_id, &request_tx, outcome)
                .await;
        });
    }

    /// Run the VM on the blocking pool.
    async fn execute(&self, request_tx: &Transaction) -> Result<ExecutionOutput, ProcessorError> {
        let ledger = Arc::clone(&self.inner.ledger);
        let vm = Arc::clone(&self.inner.vm);
        let tx = request_tx.clone();
        tokio::task::spawn_blocking(move || contract::run(ledger.as_ref(), vm.as_ref(), &tx))
            .await
            .map_err(|e| ProcessorError::TaskFailed(e.to_string()))?
            .map_err(ProcessorError::from)
    }

    async fn on_execution_complete(
        &self,
        request_id: Hash,
        request_tx: &Transaction,
        outcome: Result<ExecutionOutput, ProcessorError>,
    ) {
        let sig_num = self.inner.config.contract_sig_num;
        let mut table = self.inner.table.lock().await;
        let Some(rec) = table.get_mut(&request_id) else {
            tracing::debug!(request = %short_id(&request_id), "Record expired before execution finished");
            return;
        };
        rec.executing = false;
        if rec.committed {
            return;
        }
        let output = match outcome {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(request = %short_id(&request_id), error = %e, "Contract execution failed");
                rec.fail(e.to_string());
                return;
            }
        };
        let result = contract::result_transaction(request_tx, &output);
        let Some(account) = rec.committee.as_ref().and_then(|c| self.local_member(c)) else {
            tracing::warn!(request = %short_id(&request_id), "No local committee member to sign the result");
            rec.fail("no local committee member");
            return;
        };

        let mut signed = aggregate::sign_result(&result, &account.keypair);
        rec.result_tx = Some(result);
        let committee = rec.committee.clone();
        for candidate in std::mem::take(&mut rec.pending_candidates) {
            if aggregate::quorum_reached(&signed, sig_num) {
                break;
            }
            self.merge_candidate(request_id, &mut signed, &candidate, committee.as_ref());
        }
        let commit = aggregate::quorum_reached(&signed, sig_num)
            && aggregate::is_local_minimum_signature(&signed);
        rec.aggregate_tx = Some(signed.clone());
        rec.committed = commit;
        drop(table);

        let kind = if commit {
            ContractEventKind::Commit
        } else {
            ContractEventKind::Sig
        };
        tracing::info!(
            request = %short_id(&request_id),
            signatures = aggregate::count_signatures(&signed),
            %kind,
            "Result signed"
        );
        self.broadcast(ProtocolEvent::Contract(ContractEvent {
            kind,
            committee,
            tx: signed,
        }));
    }

    /// Verify and merge one candidate into `aggregate`. Returns whether a new
    /// signature was added.
    fn merge_candidate(
        &self,
        request_id: Hash,
        aggregate: &mut Transaction,
        candidate: &Transaction,
        committee: Option<&ElectionNode>,
    ) -> bool {
        let Some(entry) = candidate.signatures().first() else {
            return false;
        };
        let signer = Address::from_public_key(&entry.public_key);
        if !committee.is_some_and(|c| c.contains(&signer)) {
            tracing::warn!(request = %short_id(&request_id), %signer, "Candidate signer is not a committee member");
            return false;
        }
        if !aggregate::verify_signature_entry(candidate, entry) {
            tracing::warn!(request = %short_id(&request_id), %signer, "Candidate signature does not verify");
            return false;
        }
        match aggregate::merge_signature(aggregate, candidate) {
            Ok(added) => added,
            Err(AggregateError::Divergent) => {
                tracing::warn!(request = %short_id(&request_id), %signer, "Candidate result diverges from local result");
                false
            }
            Err(AggregateError::MissingSignature) => false,
        }
    }

    async fn process_sig(
        &self,
        request_id: Hash,
        tx: Transaction,
        committee: Option<ElectionNode>,
    ) -> Result<(), ProcessorError> {
        let sig_num = self.inner.config.contract_sig_num;
        let mut table = self.inner.table.lock().await;
        let rec = table
            .entry(request_id)
            .or_insert_with(|| ExecutionRecord::new(Instant::now()));
        if rec.committed {
            return Ok(());
        }
        if rec.committee.is_none() {
            rec.committee = committee;
        }
        if rec.request_tx.is_none() {
            rec.request_tx = Some(tx.request_tx());
        }
        rec.valid = rec.error.is_none();

        let Some(agg) = rec.aggregate_tx.as_mut() else {
            if !rec.pending_candidates.contains(&tx) {
                rec.pending_candidates.push(tx);
            }
            let start = rec.try_start_execution();
            let request_tx = rec.request_tx.clone();
            drop(table);
            tracing::debug!(request = %short_id(&request_id), start, "SIG buffered until local execution finishes");
            if let (true, Some(request_tx)) = (start, request_tx) {
                self.spawn_execution(request_id, request_tx);
            }
            return Ok(());
        };

        if aggregate::quorum_reached(agg, sig_num) {
            tracing::debug!(request = %short_id(&request_id), "Quorum already reached, SIG ignored");
            return Ok(());
        }
        if !self.merge_candidate(request_id, agg, &tx, rec.committee.as_ref()) {
            return Ok(());
        }
        let signatures = aggregate::count_signatures(agg);
        let commit_tx = (aggregate::quorum_reached(agg, sig_num)
            && aggregate::is_local_minimum_signature(agg))
        .then(|| agg.clone());
        if commit_tx.is_some() {
            rec.committed = true;
        }
        let committee = rec.committee.clone();
        drop(table);

        tracing::debug!(request = %short_id(&request_id), signatures, "SIG merged");
        if let Some(tx) = commit_tx {
            tracing::info!(request = %short_id(&request_id), signatures, "Quorum reached, committing");
            self.broadcast(ProtocolEvent::Contract(ContractEvent {
                kind: ContractEventKind::Commit,
                committee,
                tx,
            }));
        }
        Ok(())
    }

    async fn process_commit(
        &self,
        request_id: Hash,
        tx: Transaction,
        committee: Option<ElectionNode>,
        system: bool,
    ) -> Result<(), ProcessorError> {
        if !system {
            let required = self.inner.config.contract_sig_num;
            let valid = committee
                .as_ref()
                .map(|c| aggregate::count_valid_signatures(&tx, c))
                .unwrap_or(0);
            if valid < required {
                return Err(ProcessorError::InsufficientSignatures {
                    request_id,
                    valid,
                    required,
                });
            }
        }
        let mut table = self.inner.table.lock().await;
        let rec = table
            .entry(request_id)
            .or_insert_with(|| ExecutionRecord::new(Instant::now()));
        if rec.committed {
            tracing::debug!(request = %short_id(&request_id), "Duplicate COMMIT ignored");
            return Ok(());
        }
        if rec.request_tx.is_none() {
            rec.request_tx = Some(tx.request_tx());
        }
        if rec.committee.is_none() {
            rec.committee = committee;
        }
        rec.valid = true;
        rec.error = None;
        rec.committed = true;
        rec.pending_candidates.clear();
        if system {
            rec.result_tx = Some(tx);
        } else {
            rec.aggregate_tx = Some(tx);
        }
        tracing::info!(request = %short_id(&request_id), system, "COMMIT accepted");
        Ok(())
    }

    // ── Ledger construction ──

    /// Collect contract transactions ready for inclusion.
    ///
    /// A mediator first executes pending system requests and signs their
    /// results with its own key. Committed user aggregates are returned as
    /// they are. Each record is handed out once.
    pub async fn build_contract_txs(&self) -> Vec<Transaction> {
        let Some(mediator) = self.local_mediator() else {
            return Vec::new();
        };

        let to_run: Vec<(Hash, Transaction)> = {
            let mut table = self.inner.table.lock().await;
            table
                .iter_mut()
                .filter_map(|(id, rec)| {
                    let request_tx = rec.request_tx.clone()?;
                    if !rec.valid
                        || rec.packaged
                        || rec.committed
                        || !contract::is_system_contract(&request_tx)
                        || !rec.try_start_execution()
                    {
                        return None;
                    }
                    Some((*id, request_tx))
                })
                .collect()
        };

        for (request_id, request_tx) in to_run {
            let outcome = self.execute(&request_tx).await;
            let mut table = self.inner.table.lock().await;
            let Some(rec) = table.get_mut(&request_id) else {
                continue;
            };
            rec.executing = false;
            match outcome {
                Ok(output) => {
                    let result = contract::result_transaction(&request_tx, &output);
                    rec.result_tx = Some(aggregate::sign_result(&result, &mediator.keypair));
                    tracing::debug!(request = %short_id(&request_id), "System request executed");
                }
                Err(e) => {
                    tracing::warn!(request = %short_id(&request_id), error = %e, "System request failed");
                    rec.fail(e.to_string());
                }
            }
        }

        let mut ready: Vec<(Hash, Transaction)> = Vec::new();
        let mut table = self.inner.table.lock().await;
        for (id, rec) in table.iter_mut() {
            if rec.packaged || !rec.valid {
                continue;
            }
            let tx = match &rec.request_tx {
                Some(req) if contract::is_system_contract(req) => rec.result_tx.clone(),
                Some(_) if rec.committed => rec.aggregate_tx.clone(),
                _ => None,
            };
            if let Some(tx) = tx {
                rec.packaged = true;
                ready.push((*id, tx));
            }
        }
        drop(table);
        ready.sort_by(|a, b| a.0.cmp(&b.0));
        if !ready.is_empty() {
            tracing::info!(count = ready.len(), "Contract transactions built");
        }
        ready.into_iter().map(|(_, tx)| tx).collect()
    }

    // ── Inspection & expiry ──

    pub async fn record_snapshot(&self, request_id: &Hash) -> Option<RecordSnapshot> {
        self.inner
            .table
            .snapshot(request_id, self.inner.config.contract_sig_num)
            .await
    }

    pub async fn record_count(&self) -> usize {
        self.inner.table.len().await
    }

    /// Drop records past their TTL.
    pub async fn reap_expired(&self, now: Instant) -> usize {
        let removed = self
            .inner
            .table
            .reap(now, self.inner.config.invalid_ttl, self.inner.config.valid_ttl)
            .await;
        if removed > 0 {
            tracing::debug!(removed, "Expired requests reaped");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::VmError;
    use crate::network::hub::start_hub;
    use crate::state::MemoryLedger;
    use crate::transaction::builder::RequestBuilder;
    use crate::transaction::{ContractResult, Message, StateWrite};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    // ── Helpers ──

    struct EchoVm;

    impl ContractVm for EchoVm {
        fn install(&self, name: &str, _: &[u8], version: &str) -> Result<Vec<Message>, VmError> {
            Ok(vec![Message::ContractResult(ContractResult::Template {
                template_id: crate::hash_domain(b"jury.test.template", name.as_bytes()),
                name: name.into(),
                version: version.into(),
            })])
        }

        fn deploy(&self, _: &Address, _: &Hash, _: &[Vec<u8>]) -> Result<Vec<Message>, VmError> {
            Err(VmError("deploy unsupported".into()))
        }

        fn invoke(&self, contract_id: &Address, args: &[Vec<u8>]) -> Result<Vec<Message>, VmError> {
            Ok(vec![Message::ContractResult(ContractResult::Invoke {
                contract_id: *contract_id,
                args: args.to_vec(),
                read_set: vec![],
                write_set: vec![StateWrite {
                    key: "last".into(),
                    value: args.last().cloned().unwrap_or_default(),
                    is_delete: false,
                }],
                payload: vec![],
            })])
        }

        fn stop(&self, _: &Address) -> Result<Vec<Message>, VmError> {
            Ok(vec![])
        }
    }

    fn test_config() -> ProcessorConfig {
        ProcessorConfig {
            contract_sig_num: 2,
            election_num: 2,
            committee_size: 2,
            ..ProcessorConfig::default()
        }
    }

    struct Harness {
        processor: Processor,
        observer: mpsc::Receiver<ProtocolEvent>,
        ledger: Arc<MemoryLedger>,
        shutdown: CancellationToken,
    }

    async fn harness(keypairs: Vec<SigningKeypair>, ledger: Arc<MemoryLedger>) -> Harness {
        let shutdown = CancellationToken::new();
        let hub = start_hub(shutdown.clone());
        let (network, _own_rx) = hub.join([1u8; 32]).await.unwrap();
        let (_observer_handle, observer) = hub.join([2u8; 32]).await.unwrap();
        let processor = Processor::new(test_config(), keypairs, ledger.clone(), Arc::new(EchoVm), network);
        Harness {
            processor,
            observer,
            ledger,
            shutdown,
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<ProtocolEvent>) -> Option<ProtocolEvent> {
        tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .ok()
            .flatten()
    }

    fn install_request() -> Transaction {
        RequestBuilder::new()
            .install("counter", b"wasm".to_vec(), "1.0")
            .with_random_nonce()
            .build()
            .unwrap()
    }

    // ── Tests ──

    #[tokio::test]
    async fn system_request_is_mediator_only() {
        let mediator = SigningKeypair::generate();
        let ledger = Arc::new(MemoryLedger::new());
        ledger.add_mediator(Address::from_public_key(&mediator.public));
        let mut h = harness(vec![mediator], ledger).await;

        let request_id = h.processor.submit_request(install_request()).await.unwrap();

        match next_event(&mut h.observer).await {
            Some(ProtocolEvent::Contract(ev)) => {
                assert_eq!(ev.kind, ContractEventKind::Exec);
                assert!(ev.committee.is_none());
            }
            other => panic!("expected EXEC broadcast, got {other:?}"),
        }

        let txs = h.processor.build_contract_txs().await;
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].request_id(), request_id);
        assert_eq!(txs[0].signatures().len(), 1);
        assert!(aggregate::verify_signature_entry(&txs[0], &txs[0].signatures()[0]));
        assert!(matches!(
            txs[0].contract_result(),
            Some(ContractResult::Template { .. })
        ));

        let snap = h.processor.record_snapshot(&request_id).await.unwrap();
        assert!(snap.packaged);
        assert_eq!(snap.signature_count, 0);
        assert!(next_event(&mut h.observer).await.is_none(), "no SIG for system requests");
        assert!(h.processor.build_contract_txs().await.is_empty());
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn non_mediator_ignores_system_exec() {
        let juror = SigningKeypair::generate();
        let ledger = Arc::new(MemoryLedger::new());
        ledger.add_jury(Address::from_public_key(&juror.public));
        let h = harness(vec![juror], ledger).await;

        let event = ContractEvent {
            kind: ContractEventKind::Exec,
            committee: None,
            tx: install_request(),
        };
        assert!(!h
            .processor
            .contract_event_executable(event.kind, &event.tx, None));
        h.processor.process_contract_event(event.clone()).await.unwrap();
        assert!(h.processor.record_snapshot(&event.tx.request_id()).await.is_none());
        assert!(h.processor.build_contract_txs().await.is_empty());
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn user_event_without_committee_is_rejected() {
        let h = harness(vec![SigningKeypair::generate()], Arc::new(MemoryLedger::new())).await;
        let tx = RequestBuilder::new()
            .invoke(Address::contract_from_request(&[5u8; 32]), vec![b"x".to_vec()])
            .build()
            .unwrap();
        let err = h
            .processor
            .process_contract_event(ContractEvent {
                kind: ContractEventKind::Exec,
                committee: None,
                tx,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::MissingCommittee(_)));
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn committed_request_is_a_no_op() {
        let mediator = SigningKeypair::generate();
        let ledger = Arc::new(MemoryLedger::new());
        ledger.add_mediator(Address::from_public_key(&mediator.public));
        let mut h = harness(vec![mediator], ledger).await;
        let tx = install_request();
        h.ledger.mark_committed(tx.request_id());

        h.processor
            .process_contract_event(ContractEvent {
                kind: ContractEventKind::Exec,
                committee: None,
                tx: tx.clone(),
            })
            .await
            .unwrap();
        assert!(h.processor.record_snapshot(&tx.request_id()).await.is_none());
        assert!(next_event(&mut h.observer).await.is_none());
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn reaper_drops_invalid_records_first() {
        let mediator = SigningKeypair::generate();
        let ledger = Arc::new(MemoryLedger::new());
        ledger.add_mediator(Address::from_public_key(&mediator.public));
        let h = harness(vec![mediator], ledger).await;
        let request_id = h.processor.submit_request(install_request()).await.unwrap();
        assert_eq!(h.processor.record_count().await, 1);

        let config = h.processor.config().clone();
        let now = Instant::now();
        assert_eq!(h.processor.reap_expired(now + config.invalid_ttl).await, 0);
        assert_eq!(h.processor.reap_expired(now + config.valid_ttl).await, 1);
        assert!(h.processor.record_snapshot(&request_id).await.is_none());
        h.shutdown.cancel();
    }
}
