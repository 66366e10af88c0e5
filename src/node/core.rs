//! Node runtime tying the processor to the network.
//!
//! The `Node` owns the inbound event stream and runs the main loop: each
//! event is handled on its own task so a slow execution never blocks the
//! stream, and a timer reaps expired request records.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::processor::Processor;
use crate::config::ProcessorConfig;
use crate::contract::ContractVm;
use crate::crypto::keys::SigningKeypair;
use crate::crypto::vrf;
use crate::network::{HubHandle, NetworkError, ProtocolEvent};
use crate::short_id;
use crate::state::LedgerQuery;

/// Node errors.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("node needs at least one account")]
    NoAccounts,
    #[error("signing is not deterministic for account {0}; VRF sortition would be unusable")]
    NonDeterministicSigning(String),
}

/// Load or generate a persistent signing keypair.
///
/// Reads `path` if it exists; otherwise generates a new keypair and writes
/// it there. Format: `[pk_len: u32 LE][pk_bytes][sk_bytes]`.
pub fn load_or_generate_keypair(path: &Path) -> Result<SigningKeypair, std::io::Error> {
    if path.exists() {
        let bytes = std::fs::read(path)?;
        if bytes.len() < 4 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "key file too short",
            ));
        }
        let pk_len = u32::from_le_bytes(bytes[..4].try_into().map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "key file header corrupted")
        })?) as usize;
        if bytes.len() < 4 + pk_len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "key file truncated",
            ));
        }
        let pk_bytes = bytes[4..4 + pk_len].to_vec();
        let sk_bytes = bytes[4 + pk_len..].to_vec();
        let keypair = SigningKeypair::from_bytes(pk_bytes, sk_bytes).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid key data")
        })?;
        tracing::info!(key = %short_id(&keypair.public.fingerprint()), "Loaded signing key");
        Ok(keypair)
    } else {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let keypair = SigningKeypair::generate();
        let public = keypair.public.as_bytes();
        let mut bytes = Vec::with_capacity(4 + public.len() + keypair.secret_bytes().len());
        bytes.extend_from_slice(&(public.len() as u32).to_le_bytes());
        bytes.extend_from_slice(public);
        bytes.extend_from_slice(keypair.secret_bytes());
        std::fs::write(path, &bytes)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        tracing::info!(key = %short_id(&keypair.public.fingerprint()), "Generated signing key");
        Ok(keypair)
    }
}

/// A running jury node.
pub struct Node {
    processor: Processor,
    events: mpsc::Receiver<ProtocolEvent>,
}

impl Node {
    /// Join the hub and build the processor.
    ///
    /// Refuses to start if any account's signer is randomized, since VRF
    /// outputs would then differ between evaluation and verification.
    pub async fn start(
        config: ProcessorConfig,
        keypairs: Vec<SigningKeypair>,
        ledger: Arc<dyn LedgerQuery>,
        vm: Arc<dyn ContractVm>,
        hub: &HubHandle,
    ) -> Result<Self, NodeError> {
        let first = keypairs.first().ok_or(NodeError::NoAccounts)?;
        for kp in &keypairs {
            if !vrf::check_deterministic_signing(kp) {
                return Err(NodeError::NonDeterministicSigning(short_id(
                    &kp.public.fingerprint(),
                )));
            }
        }
        let peer_id = first.public.fingerprint();
        let (network, events) = hub.join(peer_id).await?;
        tracing::info!(
            peer = %short_id(&peer_id),
            accounts = keypairs.len(),
            "Node joined network"
        );
        Ok(Node {
            processor: Processor::new(config, keypairs, ledger, vm, network),
            events,
        })
    }

    /// Handle to the processor, for local submissions and inspection.
    pub fn processor(&self) -> Processor {
        self.processor.clone()
    }

    /// Run until `shutdown` is cancelled or the network goes away.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut reaper_interval = tokio::time::interval(self.processor.config().reaper_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
                event = self.events.recv() => {
                    let Some(event) = event else {
                        tracing::warn!("Network stream closed, stopping node");
                        break;
                    };
                    let processor = self.processor.clone();
                    tokio::spawn(async move {
                        let request = event.request_id();
                        if let Err(e) = processor.handle_event(event).await {
                            tracing::warn!(request = %short_id(&request), error = %e, "Event rejected");
                        }
                    });
                }
                _ = reaper_interval.tick() => {
                    let removed = self.processor.reap_expired(Instant::now()).await;
                    if removed > 0 {
                        tracing::info!(removed, "Reaped expired requests");
                    }
                }
            }
        }
    }
}
