//! End-to-end tests for the jury core.
//!
//! These tests start jurors and a mediator on the in-process hub and drive
//! complete flows through the public API: a user invoke through election,
//! execution, signature aggregation and commit; a system install through the
//! mediator path; and an adapter consultation.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use jury::config::{JuryConfig, ProcessorConfig};
use jury::consensus::aggregate::count_valid_signatures;
use jury::crypto::keys::SigningKeypair;
use jury::demo::{run_demo, wait_until, DemoOptions, DemoReport, DemoVm};
use jury::network::start_hub;
use jury::node::{load_or_generate_keypair, Node, Processor, RecordPhase};
use jury::state::{LedgerQuery, MemoryLedger, UtxoEntry};
use jury::transaction::builder::RequestBuilder;
use jury::transaction::{Address, OutPoint};

// ── Helpers ─────────────────────────────────────────────────────────────

const STEP: Duration = Duration::from_secs(30);

struct Network {
    jurors: Vec<Processor>,
    mediator: Processor,
    mediator_addr: Address,
    ledger: Arc<MemoryLedger>,
    shutdown: CancellationToken,
}

/// Start `jurors` jurors and one mediator, each running its node loop.
async fn start_network(jurors: usize, config: ProcessorConfig) -> Network {
    let shutdown = CancellationToken::new();
    let hub = start_hub(shutdown.clone());
    let ledger = Arc::new(MemoryLedger::new());

    let mut processors = Vec::new();
    for _ in 0..jurors {
        let kp = SigningKeypair::generate();
        ledger.add_jury(Address::from_public_key(&kp.public));
        let node = Node::start(config.clone(), vec![kp], ledger.clone(), Arc::new(DemoVm), &hub)
            .await
            .unwrap();
        processors.push(node.processor());
        tokio::spawn(node.run(shutdown.child_token()));
    }

    let mediator_kp = SigningKeypair::generate();
    let mediator_addr = Address::from_public_key(&mediator_kp.public);
    ledger.add_mediator(mediator_addr);
    let node = Node::start(config, vec![mediator_kp], ledger.clone(), Arc::new(DemoVm), &hub)
        .await
        .unwrap();
    let mediator = node.processor();
    tokio::spawn(node.run(shutdown.child_token()));

    Network {
        jurors: processors,
        mediator,
        mediator_addr,
        ledger,
        shutdown,
    }
}

fn funded_invoke(ledger: &MemoryLedger, caller: Address, contract: Address, seed: &[u8]) -> jury::transaction::Transaction {
    let funding = OutPoint {
        tx_hash: jury::hash_domain(b"jury.test.funding", seed),
        index: 0,
    };
    ledger.add_utxo(
        funding,
        UtxoEntry {
            value: 100,
            asset: "PTN".into(),
            owner: caller,
        },
    );
    RequestBuilder::new()
        .add_input(funding)
        .add_output(95, "PTN", caller)
        .invoke(contract, vec![b"put".to_vec(), b"k".to_vec(), seed.to_vec()])
        .build()
        .unwrap()
}

// ── Demo ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_demo_full_flow() {
    let report = run_demo(DemoOptions::default()).await.unwrap();
    assert_eq!(
        report,
        DemoReport {
            committee_size: 3,
            user_signatures: 3,
            contract_txs: 2,
            adapter_answers: 3,
        }
    );
}

#[tokio::test]
async fn test_demo_with_spare_jurors() {
    let report = run_demo(DemoOptions {
        jurors: 5,
        sig_num: 3,
        step_timeout: STEP,
    })
    .await
    .unwrap();
    assert_eq!(report.committee_size, 3);
    assert_eq!(report.user_signatures, 3);
    assert_eq!(report.contract_txs, 2);
}

// ── Stored jury path ────────────────────────────────────────────────────

#[tokio::test]
async fn test_stored_jury_skips_election() {
    let config = ProcessorConfig {
        contract_sig_num: 2,
        election_num: 2,
        committee_size: 2,
        ..ProcessorConfig::default()
    };
    let net = start_network(2, config).await;

    // Build the contract's jury up front: with the expected size equal to the
    // jury count every juror is selected.
    let contract = Address::contract_from_request(&jury::hash_domain(b"jury.test", b"stored"));
    let seed = jury::consensus::election::election_seed(&contract);
    let mut committee = jury::consensus::election::ElectionNode::new(2, 2);
    for juror in &net.jurors {
        let info = jury::consensus::election::elect(&juror.accounts()[0].keypair, &seed, 2, 2)
            .unwrap()
            .unwrap();
        assert!(committee.add_member(info));
    }
    net.ledger.set_contract_jury(contract, committee.clone());

    let tx = funded_invoke(&net.ledger, net.mediator_addr, contract, b"stored");
    let request_id = net.mediator.submit_request(tx).await.unwrap();

    let mediator = net.mediator.clone();
    assert!(
        wait_until(STEP, move || {
            let mediator = mediator.clone();
            async move {
                mediator
                    .record_snapshot(&request_id)
                    .await
                    .is_some_and(|s| s.committed)
            }
        })
        .await
    );
    let snapshot = net.mediator.record_snapshot(&request_id).await.unwrap();
    assert_eq!(snapshot.phase, RecordPhase::Committed);
    assert_eq!(snapshot.committee.as_ref(), Some(&committee));
    let agg = snapshot.aggregate_tx.unwrap();
    assert_eq!(count_valid_signatures(&agg, &committee), 2);

    let txs = net.mediator.build_contract_txs().await;
    assert_eq!(txs, vec![agg]);
    // handed out once
    assert!(net.mediator.build_contract_txs().await.is_empty());
    net.shutdown.cancel();
}

#[tokio::test]
async fn test_failed_execution_never_commits() {
    let config = ProcessorConfig {
        contract_sig_num: 2,
        election_num: 2,
        committee_size: 2,
        ..ProcessorConfig::default()
    };
    let net = start_network(2, config).await;
    let contract = Address::contract_from_request(&jury::hash_domain(b"jury.test", b"fail"));

    let funding = OutPoint {
        tx_hash: jury::hash_domain(b"jury.test.funding", b"fail"),
        index: 0,
    };
    net.ledger.add_utxo(
        funding,
        UtxoEntry {
            value: 10,
            asset: "PTN".into(),
            owner: net.mediator_addr,
        },
    );
    let tx = RequestBuilder::new()
        .add_input(funding)
        .invoke(contract, vec![b"fail".to_vec()])
        .build()
        .unwrap();
    let request_id = net.mediator.submit_request(tx).await.unwrap();

    let jurors = net.jurors.clone();
    assert!(
        wait_until(STEP, move || {
            let jurors = jurors.clone();
            async move {
                for juror in &jurors {
                    match juror.record_snapshot(&request_id).await {
                        Some(s) if s.phase == RecordPhase::Failed => {}
                        _ => return false,
                    }
                }
                true
            }
        })
        .await
    );
    for juror in &net.jurors {
        let snapshot = juror.record_snapshot(&request_id).await.unwrap();
        assert!(!snapshot.valid);
        assert!(snapshot.error.unwrap().contains("contract requested failure"));
    }
    let mediator = net.mediator.record_snapshot(&request_id).await;
    assert!(mediator.map_or(true, |s| !s.committed));
    assert!(net.mediator.build_contract_txs().await.is_empty());
    assert!(!net.ledger.is_request_committed(&request_id));
    net.shutdown.cancel();
}

// ── Configuration and keys ──────────────────────────────────────────────

#[test]
fn test_config_and_keys_from_data_dir() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("jury.toml"),
        "[jury]\ncontract_sig_num = 2\naccounts = [\"a.key\", \"b.key\"]\n",
    )
    .unwrap();
    let config = JuryConfig::load(dir.path());
    assert_eq!(config.processor_config().contract_sig_num, 2);

    let keys: Vec<SigningKeypair> = config
        .jury
        .accounts
        .iter()
        .map(|f| load_or_generate_keypair(&dir.path().join(f)).unwrap())
        .collect();
    assert_eq!(keys.len(), 2);
    assert_ne!(keys[0].public.fingerprint(), keys[1].public.fingerprint());

    let reloaded = load_or_generate_keypair(&dir.path().join("a.key")).unwrap();
    assert_eq!(reloaded.public.fingerprint(), keys[0].public.fingerprint());
}
