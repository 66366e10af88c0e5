//! Interactive protocol demonstration.
//!
//! Starts a small in-process network of jurors and one mediator, then walks a
//! user invoke through election, execution, signature aggregation and commit,
//! a system install through the mediator path, and one adapter consultation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::ProcessorConfig;
use crate::contract::{ContractVm, VmError};
use crate::crypto::keys::SigningKeypair;
use crate::network::start_hub;
use crate::node::{AdapterError, Node, NodeError, Processor, ProcessorError};
use crate::state::{MemoryLedger, UtxoEntry};
use crate::transaction::builder::{RequestBuilder, TxBuildError};
use crate::transaction::{
    Address, ContractResult, Message, OutPoint, StateRead, StateWrite,
};
use crate::Hash;

/// A deterministic, stateless VM.
///
/// Invoke understands `put <key> <value>`, `get <key>`, `fail`; anything
/// else is echoed into the payload.
pub struct DemoVm;

impl ContractVm for DemoVm {
    fn install(
        &self,
        template_name: &str,
        bytecode: &[u8],
        version: &str,
    ) -> Result<Vec<Message>, VmError> {
        let template_id = crate::hash_domain(
            b"jury.demo.template",
            &crate::hash_concat(&[template_name.as_bytes(), bytecode, version.as_bytes()]),
        );
        Ok(vec![Message::ContractResult(ContractResult::Template {
            template_id,
            name: template_name.into(),
            version: version.into(),
        })])
    }

    fn deploy(
        &self,
        contract_id: &Address,
        template_id: &Hash,
        args: &[Vec<u8>],
    ) -> Result<Vec<Message>, VmError> {
        let write_set = args
            .iter()
            .enumerate()
            .map(|(i, value)| StateWrite {
                key: format!("init.{i}"),
                value: value.clone(),
                is_delete: false,
            })
            .collect();
        Ok(vec![Message::ContractResult(ContractResult::Deploy {
            contract_id: *contract_id,
            template_id: *template_id,
            read_set: vec![],
            write_set,
        })])
    }

    fn invoke(&self, contract_id: &Address, args: &[Vec<u8>]) -> Result<Vec<Message>, VmError> {
        // args[0] is the invocation metadata
        let user_args = args.get(1..).unwrap_or_default();
        let mut read_set = Vec::new();
        let mut write_set = Vec::new();
        match user_args {
            [cmd, key, value] if cmd.as_slice() == b"put" => write_set.push(StateWrite {
                key: String::from_utf8_lossy(key).into_owned(),
                value: value.clone(),
                is_delete: false,
            }),
            [cmd, key] if cmd.as_slice() == b"get" => read_set.push(StateRead {
                key: String::from_utf8_lossy(key).into_owned(),
                version: 0,
            }),
            [cmd, ..] if cmd.as_slice() == b"fail" => {
                return Err(VmError("contract requested failure".into()))
            }
            _ => {}
        }
        let parts: Vec<&[u8]> = args.iter().map(Vec::as_slice).collect();
        Ok(vec![Message::ContractResult(ContractResult::Invoke {
            contract_id: *contract_id,
            args: user_args.to_vec(),
            read_set,
            write_set,
            payload: crate::hash_concat(&parts).to_vec(),
        })])
    }

    fn stop(&self, contract_id: &Address) -> Result<Vec<Message>, VmError> {
        Ok(vec![Message::ContractResult(ContractResult::Stop {
            contract_id: *contract_id,
            write_set: vec![StateWrite {
                key: "status".into(),
                value: b"stopped".to_vec(),
                is_delete: false,
            }],
        })])
    }
}

/// Demo parameters.
#[derive(Clone, Debug)]
pub struct DemoOptions {
    pub jurors: usize,
    pub sig_num: usize,
    /// Upper bound for each protocol step
    pub step_timeout: Duration,
}

impl Default for DemoOptions {
    fn default() -> Self {
        DemoOptions {
            jurors: 4,
            sig_num: crate::constants::CONTRACT_SIG_NUM,
            step_timeout: Duration::from_secs(30),
        }
    }
}

/// What the demo observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DemoReport {
    pub committee_size: usize,
    pub user_signatures: usize,
    pub contract_txs: usize,
    pub adapter_answers: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Processor(#[from] ProcessorError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Build(#[from] TxBuildError),
    #[error("adapter result is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("demo needs at least as many jurors as signatures ({jurors} < {sig_num})")]
    TooFewJurors { jurors: usize, sig_num: usize },
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(timeout, async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

/// Run the protocol demonstration.
pub async fn run_demo(options: DemoOptions) -> Result<DemoReport, DemoError> {
    if options.sig_num == 0 || options.jurors < options.sig_num {
        return Err(DemoError::TooFewJurors {
            jurors: options.jurors,
            sig_num: options.sig_num,
        });
    }
    println!("=== JURY: Permissioned contract execution ===\n");

    // ────────────────────────────────────────────────────────
    // 1. MEMBERSHIP
    // ────────────────────────────────────────────────────────
    println!(
        "[1] Starting {} jurors and 1 mediator (Dilithium5 keys)...",
        options.jurors
    );
    let shutdown = CancellationToken::new();
    let hub = start_hub(shutdown.clone());
    let ledger = Arc::new(MemoryLedger::new());
    let config = ProcessorConfig {
        contract_sig_num: options.sig_num,
        election_num: options.sig_num,
        committee_size: options.jurors as u64,
        ..ProcessorConfig::default()
    };

    let mut jurors: Vec<Processor> = Vec::new();
    for _ in 0..options.jurors {
        let kp = SigningKeypair::generate();
        let address = Address::from_public_key(&kp.public);
        ledger.add_jury(address);
        let node = Node::start(config.clone(), vec![kp], ledger.clone(), Arc::new(DemoVm), &hub)
            .await?;
        jurors.push(node.processor());
        tokio::spawn(node.run(shutdown.child_token()));
        println!("    Juror    {address}");
    }
    let mediator_kp = SigningKeypair::generate();
    let mediator_addr = Address::from_public_key(&mediator_kp.public);
    ledger.add_mediator(mediator_addr);
    let node = Node::start(config, vec![mediator_kp], ledger.clone(), Arc::new(DemoVm), &hub)
        .await?;
    let mediator = node.processor();
    tokio::spawn(node.run(shutdown.child_token()));
    println!("    Mediator {mediator_addr}");

    let report = walk_through(&options, &ledger, &jurors, &mediator, mediator_addr).await;
    shutdown.cancel();
    report
}

async fn walk_through(
    options: &DemoOptions,
    ledger: &MemoryLedger,
    jurors: &[Processor],
    mediator: &Processor,
    mediator_addr: Address,
) -> Result<DemoReport, DemoError> {
    // ────────────────────────────────────────────────────────
    // 2. USER INVOKE: election → EXEC → SIG → COMMIT
    // ────────────────────────────────────────────────────────
    println!("\n[2] Invoking a user contract (jury path)...");
    let funding = OutPoint {
        tx_hash: crate::hash_domain(b"jury.demo.funding", b"genesis"),
        index: 0,
    };
    ledger.add_utxo(
        funding,
        UtxoEntry {
            value: 1_000,
            asset: "PTN".into(),
            owner: mediator_addr,
        },
    );
    let contract = Address::contract_from_request(&crate::hash_domain(
        b"jury.demo.contract",
        b"greeter",
    ));
    let invoke = RequestBuilder::new()
        .add_input(funding)
        .add_output(990, "PTN", mediator_addr)
        .invoke(
            contract,
            vec![b"put".to_vec(), b"greeting".to_vec(), b"hello".to_vec()],
        )
        .build()?;
    let user_id = mediator.submit_request(invoke).await?;
    println!("    Request  {}", hex::encode(&user_id[..16]));

    let committed = wait_until(options.step_timeout, move || async move {
        mediator
            .record_snapshot(&user_id)
            .await
            .is_some_and(|s| s.committed)
    })
    .await;
    if !committed {
        return Err(DemoError::Timeout("user request commit"));
    }
    let snapshot = mediator
        .record_snapshot(&user_id)
        .await
        .ok_or(DemoError::Timeout("user request record"))?;
    let committee_size = snapshot.committee.as_ref().map_or(0, |c| c.members.len());
    let user_signatures = snapshot
        .aggregate_tx
        .as_ref()
        .map_or(0, |tx| tx.signatures().len());
    println!("    Committee: {committee_size} jurors, commit carries {user_signatures} signatures");

    // ────────────────────────────────────────────────────────
    // 3. SYSTEM INSTALL: mediator path
    // ────────────────────────────────────────────────────────
    println!("\n[3] Installing a template (mediator path)...");
    let install = RequestBuilder::new()
        .install("greeter", b"\0asm demo".to_vec(), "1.0.0")
        .build()?;
    let system_id = mediator.submit_request(install).await?;
    println!("    Request  {}", hex::encode(&system_id[..16]));

    let contract_txs = mediator.build_contract_txs().await;
    println!(
        "    Ledger-construction stage picked up {} contract transactions",
        contract_txs.len()
    );

    // ────────────────────────────────────────────────────────
    // 4. ADAPTER CONSULTATION
    // ────────────────────────────────────────────────────────
    println!("\n[4] Consulting another chain through the adapter bridge...");
    let consult = b"eth_getBalance 0xabc".to_vec();
    for juror in jurors.iter().take(options.sig_num).skip(1) {
        juror
            .adapter_request(user_id, contract, 1, consult.clone(), b"1000".to_vec())
            .await?;
    }
    let first = jurors
        .first()
        .ok_or(DemoError::TooFewJurors { jurors: 0, sig_num: options.sig_num })?;
    let json = first
        .request_then_wait(
            user_id,
            contract,
            1,
            consult,
            b"1000".to_vec(),
            options.step_timeout,
        )
        .await?;
    let answers: Vec<crate::node::store::JuryAnswer> = serde_json::from_slice(&json)?;
    println!("    {} jurors agreed on the answer", answers.len());

    println!("\n=== Demo complete ===");
    Ok(DemoReport {
        committee_size,
        user_signatures,
        contract_txs: contract_txs.len(),
        adapter_answers: answers.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{self, InvokeInfo};
    use crate::transaction::Transaction;

    fn invoke_args(user: &[&[u8]]) -> Vec<Vec<u8>> {
        let meta = serde_json::to_vec(&InvokeInfo {
            invoke_address: "P1".into(),
            invoke_tokens: vec![],
            invoke_fees: 0,
        })
        .unwrap();
        std::iter::once(meta)
            .chain(user.iter().map(|a| a.to_vec()))
            .collect()
    }

    #[test]
    fn invoke_is_deterministic() {
        let contract = Address::contract_from_request(&[1u8; 32]);
        let args = invoke_args(&[b"put", b"k", b"v"]);
        let a = DemoVm.invoke(&contract, &args).unwrap();
        let b = DemoVm.invoke(&contract, &args).unwrap();
        assert_eq!(a, b);
        let Message::ContractResult(ContractResult::Invoke { write_set, args, .. }) = &a[0] else {
            panic!("expected invoke result");
        };
        assert_eq!(write_set[0].key, "k");
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn invoke_fail_command_errors() {
        let contract = Address::contract_from_request(&[1u8; 32]);
        assert!(DemoVm.invoke(&contract, &invoke_args(&[b"fail"])).is_err());
    }

    #[test]
    fn install_runs_through_execution_adapter() {
        let tx: Transaction = RequestBuilder::new()
            .install("t", b"code".to_vec(), "2")
            .build()
            .unwrap();
        let out = contract::run(&MemoryLedger::new(), &DemoVm, &tx).unwrap();
        assert!(matches!(
            out.messages[0],
            Message::ContractResult(ContractResult::Template { .. })
        ));
    }

    #[tokio::test]
    async fn demo_rejects_too_few_jurors() {
        let options = DemoOptions {
            jurors: 2,
            sig_num: 3,
            ..DemoOptions::default()
        };
        assert!(matches!(
            run_demo(options).await,
            Err(DemoError::TooFewJurors { .. })
        ));
    }
}
