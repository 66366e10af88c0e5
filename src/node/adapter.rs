//! Cross-chain adapter bridge.
//!
//! A contract that needs an answer from another chain asks every juror to
//! consult it. Each juror signs its answer and broadcasts it; every node
//! collects answers per `(request, msg_type, consult)` and a local caller
//! waiting on [`Processor::adapter_result`] is woken once
//! `contract_sig_num` distinct jurors have answered. Answers that arrive for
//! an unknown request are kept in a non-valid record, so they expire on the
//! short TTL if the request never shows up.

use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use super::processor::{Processor, ProcessorError};
use super::store::{AdapterAnswer, AdapterKey, ExecutionRecord};
use crate::crypto::keys::Signature;
use crate::network::{AdapterEvent, ProtocolEvent};
use crate::transaction::Address;
use crate::{short_id, Hash};

/// Errors from the adapter bridge.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("request id is empty")]
    EmptyRequestId,
    #[error("no local juror account")]
    NoLocalJuror,
    #[error("answer signature does not verify")]
    InvalidSignature,
    #[error("a waiter is already registered for this consultation")]
    AlreadyWaiting,
    #[error("not enough answers after {0:?}")]
    Timeout(Duration),
    #[error("record dropped before enough answers arrived")]
    Cancelled,
    #[error("result encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Digest a juror signs for one answer.
pub fn adapter_sign_data(request_id: &Hash, msg_type: u32, consult: &[u8], answer: &[u8]) -> Hash {
    crate::hash_domain(
        b"jury.adapter.answer",
        &crate::hash_concat(&[request_id, &msg_type.to_le_bytes(), consult, answer]),
    )
}

impl Processor {
    /// Sign and broadcast the local answer to a consultation.
    pub async fn adapter_request(
        &self,
        request_id: Hash,
        contract_id: Address,
        msg_type: u32,
        consult: Vec<u8>,
        answer: Vec<u8>,
    ) -> Result<Signature, AdapterError> {
        if request_id == [0u8; 32] {
            return Err(AdapterError::EmptyRequestId);
        }
        let account = self.local_juror().ok_or(AdapterError::NoLocalJuror)?;
        let signature = account
            .keypair
            .sign(&adapter_sign_data(&request_id, msg_type, &consult, &answer));
        let event = AdapterEvent {
            request_id,
            contract_id,
            msg_type,
            consult,
            answer,
            signature: signature.clone(),
            public_key: account.keypair.public.clone(),
        };
        self.save_answer(&event).await?;
        tracing::debug!(
            request = %short_id(&request_id),
            msg_type,
            "Adapter answer broadcast"
        );
        self.broadcast(ProtocolEvent::Adapter(event));
        Ok(signature)
    }

    /// Wait until enough jurors have answered a consultation.
    ///
    /// Returns the JSON list of answers. At most one waiter may exist per
    /// consultation; it is removed when the wait times out.
    pub async fn adapter_result(
        &self,
        request_id: Hash,
        msg_type: u32,
        consult: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, AdapterError> {
        if request_id == [0u8; 32] {
            return Err(AdapterError::EmptyRequestId);
        }
        let threshold = self.config().contract_sig_num;
        let key: AdapterKey = (msg_type, consult);
        let rx = {
            let mut table = self.table().lock().await;
            let rec = table
                .entry(request_id)
                .or_insert_with(|| ExecutionRecord::new(Instant::now()));
            if let Some(result) = rec.adapter_result(&key, threshold)? {
                return Ok(result);
            }
            if rec.adapter_waiters.contains_key(&key) {
                return Err(AdapterError::AlreadyWaiting);
            }
            let (tx, rx) = oneshot::channel();
            rec.adapter_waiters.insert(key.clone(), tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(AdapterError::Cancelled),
            Err(_) => {
                let mut table = self.table().lock().await;
                if let Some(rec) = table.get_mut(&request_id) {
                    rec.adapter_waiters.remove(&key);
                    // an answer may have landed between the timer and the lock
                    if let Some(result) = rec.adapter_result(&key, threshold)? {
                        return Ok(result);
                    }
                }
                tracing::warn!(request = %short_id(&request_id), msg_type, "Adapter consultation timed out");
                Err(AdapterError::Timeout(timeout))
            }
        }
    }

    /// Broadcast the local answer, then wait for the quorum result.
    pub async fn request_then_wait(
        &self,
        request_id: Hash,
        contract_id: Address,
        msg_type: u32,
        consult: Vec<u8>,
        answer: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, AdapterError> {
        self.adapter_request(request_id, contract_id, msg_type, consult.clone(), answer)
            .await?;
        self.adapter_result(request_id, msg_type, consult, timeout)
            .await
    }

    /// Handle a peer's answer: verify, store, and relay it the first time.
    pub async fn process_adapter_event(&self, event: AdapterEvent) -> Result<(), ProcessorError> {
        let digest = adapter_sign_data(
            &event.request_id,
            event.msg_type,
            &event.consult,
            &event.answer,
        );
        if !event.public_key.verify(&digest, &event.signature) {
            return Err(AdapterError::InvalidSignature.into());
        }
        if self.save_answer(&event).await? {
            self.broadcast(ProtocolEvent::Adapter(event));
        }
        Ok(())
    }

    /// Store one answer. Returns false if this juror already answered.
    async fn save_answer(&self, event: &AdapterEvent) -> Result<bool, AdapterError> {
        let threshold = self.config().contract_sig_num;
        let key: AdapterKey = (event.msg_type, event.consult.clone());
        let mut table = self.table().lock().await;
        let rec = table
            .entry(event.request_id)
            .or_insert_with(|| ExecutionRecord::new(Instant::now()));
        let answers = rec.adapter_answers.entry(key.clone()).or_default();
        if answers.iter().any(|a| a.public_key == event.public_key) {
            return Ok(false);
        }
        answers.push(AdapterAnswer {
            public_key: event.public_key.clone(),
            answer: event.answer.clone(),
            signature: event.signature.clone(),
        });
        let count = answers.len();
        if count >= threshold {
            if let Some(waiter) = rec.adapter_waiters.remove(&key) {
                if let Some(result) = rec.adapter_result(&key, threshold)? {
                    let _ = waiter.send(result);
                }
            }
        }
        tracing::debug!(
            request = %short_id(&event.request_id),
            msg_type = event.msg_type,
            answers = count,
            "Adapter answer stored"
        );
        Ok(true)
    }
}
