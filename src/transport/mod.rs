//! Transport Abstraction - registration and data channels
//!
//! Information Hiding:
//! - Socket handling hidden behind `AgentTransport` (agent side) and
//!   `FrameSink` (orchestrator side)
//! - Per-connection writer tasks hidden behind `ConnectionHub`, whose peer
//!   queues are bounded; a full queue drops the frame (at-most-once delivery)
//! - Implementations: in-process channels (`local`) and TCP with
//!   newline-delimited JSON (`tcp`)

pub mod local;
pub mod tcp;

use crate::core::{AgentId, Frame, RegistrationRequest, RegistrationResponse};
use crate::error::{BusError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender, UnboundedSender};
use tokio::sync::RwLock;

/// Agent end of an opened data channel
pub struct DataChannel {
    /// Frames to the orchestrator. Sending never blocks.
    pub outbound: UnboundedSender<Frame>,
    /// Frames routed to this agent
    pub inbound: Receiver<Frame>,
}

/// What an agent runtime needs from the network
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// One request/response exchange on the registration channel
    async fn request(&self, request: RegistrationRequest) -> Result<RegistrationResponse>;

    /// Open the data channel under an identity the orchestrator already knows
    async fn open_data_channel(&self, agent_id: &AgentId) -> Result<DataChannel>;

    /// Release both channels
    async fn close(&self) -> Result<()>;
}

/// Identity-addressed delivery used by the orchestrator's router
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_to(&self, agent_id: &AgentId, frame: Frame) -> Result<()>;

    /// Forget the peer of an unregistered agent
    async fn release(&self, _agent_id: &AgentId) {}
}

pub const DEFAULT_PEER_BUFFER: usize = 256;

/// Data-channel peers keyed by identity
pub struct ConnectionHub {
    capacity: usize,
    peers: RwLock<HashMap<AgentId, Sender<Frame>>>,
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_PEER_BUFFER)
    }
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hub whose peer queues hold at most `capacity` undelivered frames
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Queue for one peer, sized for this hub
    pub fn peer_channel(&self) -> (Sender<Frame>, Receiver<Frame>) {
        mpsc::channel(self.capacity)
    }

    pub async fn attach(&self, agent_id: AgentId, sender: Sender<Frame>) {
        let mut peers = self.peers.write().await;
        if peers.insert(agent_id.clone(), sender).is_some() {
            tracing::debug!(agent_id = %agent_id.short(), "Replaced data channel peer");
        }
    }

    pub async fn detach(&self, agent_id: &AgentId) -> bool {
        self.peers.write().await.remove(agent_id).is_some()
    }

    /// Detach only if `sender` is still the attached peer, so a closing
    /// connection never drops its replacement
    pub async fn detach_channel(&self, agent_id: &AgentId, sender: &Sender<Frame>) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get(agent_id) {
            Some(current) if current.same_channel(sender) => peers.remove(agent_id).is_some(),
            _ => false,
        }
    }

    pub async fn is_attached(&self, agent_id: &AgentId) -> bool {
        self.peers.read().await.contains_key(agent_id)
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }
}

#[async_trait]
impl FrameSink for ConnectionHub {
    async fn send_to(&self, agent_id: &AgentId, frame: Frame) -> Result<()> {
        let peers = self.peers.read().await;
        let peer = peers.get(agent_id).ok_or_else(|| {
            BusError::Transport(format!("no data channel for agent {}", agent_id.short()))
        })?;
        match peer.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(agent_id = %agent_id.short(), capacity = self.capacity, "Peer queue full, dropping frame");
                Err(BusError::Transport(format!("data channel of {} is full", agent_id.short())))
            }
            Err(TrySendError::Closed(_)) => Err(BusError::Transport(format!(
                "data channel of {} closed",
                agent_id.short()
            ))),
        }
    }

    async fn release(&self, agent_id: &AgentId) {
        self.detach(agent_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Message;
    use serde_json::json;

    #[tokio::test]
    async fn test_hub_delivers_to_attached_peer() {
        let hub = ConnectionHub::new();
        let id = AgentId::from("peer");
        let (tx, mut rx) = hub.peer_channel();
        hub.attach(id.clone(), tx).await;

        let frame = Frame::from_message(&Message::new("ping", json!(1))).unwrap();
        hub.send_to(&id, frame.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn test_hub_reports_missing_and_closed_peers() {
        let hub = ConnectionHub::new();
        let id = AgentId::from("peer");
        let frame = Frame::from_message(&Message::new("ping", json!(1))).unwrap();

        assert!(matches!(
            hub.send_to(&id, frame.clone()).await,
            Err(BusError::Transport(_))
        ));

        let (tx, rx) = hub.peer_channel();
        hub.attach(id.clone(), tx).await;
        drop(rx);
        assert!(matches!(
            hub.send_to(&id, frame).await,
            Err(BusError::Transport(_))
        ));

        hub.release(&id).await;
        assert!(!hub.is_attached(&id).await);
    }

    #[tokio::test]
    async fn test_stale_connection_keeps_replacement() {
        let hub = ConnectionHub::new();
        let id = AgentId::from("peer");
        let (old_tx, _old_rx) = hub.peer_channel();
        let (new_tx, _new_rx) = hub.peer_channel();
        hub.attach(id.clone(), old_tx.clone()).await;
        hub.attach(id.clone(), new_tx.clone()).await;

        assert!(!hub.detach_channel(&id, &old_tx).await);
        assert!(hub.is_attached(&id).await);
        assert!(hub.detach_channel(&id, &new_tx).await);
        assert_eq!(hub.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_full_peer_queue_drops_frames() {
        let hub = ConnectionHub::with_capacity(2);
        let id = AgentId::from("slow");
        let (tx, mut rx) = hub.peer_channel();
        hub.attach(id.clone(), tx).await;

        let frames: Vec<Frame> = (0..3)
            .map(|n| Frame::from_message(&Message::new("tick", json!(n))).unwrap())
            .collect();
        hub.send_to(&id, frames[0].clone()).await.unwrap();
        hub.send_to(&id, frames[1].clone()).await.unwrap();
        assert!(matches!(
            hub.send_to(&id, frames[2].clone()).await,
            Err(BusError::Transport(_))
        ));

        assert_eq!(rx.recv().await.unwrap(), frames[0]);
        // room again once the writer catches up
        hub.send_to(&id, frames[2].clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), frames[1]);
        assert_eq!(rx.recv().await.unwrap(), frames[2]);
    }
}
