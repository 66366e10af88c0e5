//! In-process broadcast hub.
//!
//! Nodes join the hub and receive every event broadcast by the other
//! members. Events travel through the wire codec so the hub exercises the
//! same encoding a socket transport would. A slow subscriber loses events
//! rather than stalling the hub; the protocol tolerates loss through its
//! relays and record expiry.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::protocol::{decode_event, encode_event, NetworkError, PeerId, ProtocolEvent};
use crate::short_id;

/// Commands the hub loop accepts.
#[derive(Debug)]
pub enum HubCommand {
    /// Register a peer; the reply carries its inbound event stream.
    Join {
        peer_id: PeerId,
        reply: oneshot::Sender<mpsc::Receiver<ProtocolEvent>>,
    },
    /// Remove a peer.
    Leave(PeerId),
    /// Deliver an encoded event to every peer except the sender.
    Broadcast { from: PeerId, frame: Vec<u8> },
    /// Request the current member list.
    GetPeers(oneshot::Sender<Vec<PeerId>>),
}

/// Handle to the hub loop.
#[derive(Clone)]
pub struct HubHandle {
    command_tx: mpsc::Sender<HubCommand>,
}

/// A node's outbound side of the hub.
#[derive(Clone)]
pub struct EventHandle {
    peer_id: PeerId,
    command_tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    /// Join as `peer_id`. A second join with the same id replaces the first
    /// subscription.
    pub async fn join(
        &self,
        peer_id: PeerId,
    ) -> Result<(EventHandle, mpsc::Receiver<ProtocolEvent>), NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(HubCommand::Join { peer_id, reply: tx })
            .await
            .map_err(|_| NetworkError::Shutdown)?;
        let events = rx.await.map_err(|_| NetworkError::Shutdown)?;
        Ok((
            EventHandle {
                peer_id,
                command_tx: self.command_tx.clone(),
            },
            events,
        ))
    }

    pub async fn peers(&self) -> Result<Vec<PeerId>, NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(HubCommand::GetPeers(tx))
            .await
            .map_err(|_| NetworkError::Shutdown)?;
        rx.await.map_err(|_| NetworkError::Shutdown)
    }
}

impl EventHandle {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Broadcast an event to every other member.
    pub async fn broadcast(&self, event: &ProtocolEvent) -> Result<(), NetworkError> {
        let frame = encode_event(event)?;
        self.command_tx
            .send(HubCommand::Broadcast {
                from: self.peer_id,
                frame,
            })
            .await
            .map_err(|_| NetworkError::Shutdown)
    }

    /// Leave the hub. Inbound events stop once the hub processes the command.
    pub async fn leave(&self) -> Result<(), NetworkError> {
        self.command_tx
            .send(HubCommand::Leave(self.peer_id))
            .await
            .map_err(|_| NetworkError::Shutdown)
    }
}

/// Start the hub loop. It stops when `shutdown` is cancelled or every handle
/// is dropped.
pub fn start_hub(shutdown: CancellationToken) -> HubHandle {
    let (command_tx, command_rx) = mpsc::channel::<HubCommand>(crate::constants::EVENT_CHANNEL_CAPACITY);
    tokio::spawn(hub_loop(command_rx, shutdown));
    HubHandle { command_tx }
}

async fn hub_loop(mut command_rx: mpsc::Receiver<HubCommand>, shutdown: CancellationToken) {
    let mut peers: HashMap<PeerId, mpsc::Sender<ProtocolEvent>> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Hub shutting down");
                break;
            }
            cmd = command_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    HubCommand::Join { peer_id, reply } => {
                        let (tx, rx) = mpsc::channel(crate::constants::EVENT_CHANNEL_CAPACITY);
                        peers.insert(peer_id, tx);
                        let _ = reply.send(rx);
                        tracing::debug!(peer = %short_id(&peer_id), members = peers.len(), "Peer joined hub");
                    }
                    HubCommand::Leave(peer_id) => {
                        peers.remove(&peer_id);
                        tracing::debug!(peer = %short_id(&peer_id), "Peer left hub");
                    }
                    HubCommand::Broadcast { from, frame } => {
                        let Some(event) = decode_event(&frame) else {
                            tracing::warn!(peer = %short_id(&from), "Dropping undecodable frame");
                            continue;
                        };
                        let mut closed = Vec::new();
                        for (peer_id, tx) in &peers {
                            if *peer_id == from {
                                continue;
                            }
                            match tx.try_send(event.clone()) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    tracing::warn!(peer = %short_id(peer_id), "Peer inbox full, event dropped");
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*peer_id),
                            }
                        }
                        for peer_id in closed {
                            peers.remove(&peer_id);
                        }
                    }
                    HubCommand::GetPeers(reply) => {
                        let _ = reply.send(peers.keys().copied().collect());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::ElectionEvent;
    use std::time::Duration;

    fn election_request(byte: u8) -> ProtocolEvent {
        ProtocolEvent::Election(ElectionEvent::Request {
            request_id: [byte; 32],
            expected: 3,
            jury_count: 4,
            seed: [9u8; 32],
        })
    }

    #[tokio::test]
    async fn broadcast_reaches_others_not_sender() {
        let shutdown = CancellationToken::new();
        let hub = start_hub(shutdown.clone());
        let (a, mut a_rx) = hub.join([1u8; 32]).await.unwrap();
        let (_b, mut b_rx) = hub.join([2u8; 32]).await.unwrap();
        let (_c, mut c_rx) = hub.join([3u8; 32]).await.unwrap();

        a.broadcast(&election_request(5)).await.unwrap();

        assert_eq!(b_rx.recv().await, Some(election_request(5)));
        assert_eq!(c_rx.recv().await, Some(election_request(5)));
        let echoed = tokio::time::timeout(Duration::from_millis(50), a_rx.recv()).await;
        assert!(echoed.is_err(), "sender must not receive its own event");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn leave_stops_delivery() {
        let shutdown = CancellationToken::new();
        let hub = start_hub(shutdown.clone());
        let (a, _a_rx) = hub.join([1u8; 32]).await.unwrap();
        let (b, mut b_rx) = hub.join([2u8; 32]).await.unwrap();
        assert_eq!(hub.peers().await.unwrap().len(), 2);

        b.leave().await.unwrap();
        a.broadcast(&election_request(1)).await.unwrap();
        assert_eq!(hub.peers().await.unwrap(), vec![[1u8; 32]]);
        // the hub dropped b's sender, so the stream ends
        assert_eq!(b_rx.recv().await, None);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn handles_fail_after_shutdown() {
        let shutdown = CancellationToken::new();
        let hub = start_hub(shutdown.clone());
        let (a, _rx) = hub.join([1u8; 32]).await.unwrap();
        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            a.broadcast(&election_request(1)).await,
            Err(NetworkError::Shutdown)
        );
        assert!(hub.join([2u8; 32]).await.is_err());
    }
}
