//! In-process transport - agents and orchestrator in one runtime
//!
//! Same contract as the TCP transport: requests go straight to
//! `Orchestrator::handle_request`, data frames through a `ConnectionHub`.

use super::{AgentTransport, ConnectionHub, DataChannel};
use crate::config::OrchestratorConfig;
use crate::core::{AgentId, Frame, RegistrationRequest, RegistrationResponse};
use crate::error::{BusError, Result};
use crate::orchestrator::Orchestrator;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Orchestrator whose remote deliveries land on the returned hub
pub fn in_process(config: OrchestratorConfig) -> (Orchestrator, Arc<ConnectionHub>) {
    let hub = Arc::new(ConnectionHub::new());
    (Orchestrator::new(config, hub.clone()), hub)
}

pub struct LocalTransport {
    orchestrator: Orchestrator,
    hub: Arc<ConnectionHub>,
    attached: Mutex<Vec<(AgentId, JoinHandle<()>)>>,
}

impl LocalTransport {
    pub fn new(orchestrator: Orchestrator, hub: Arc<ConnectionHub>) -> Self {
        Self {
            orchestrator,
            hub,
            attached: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AgentTransport for LocalTransport {
    async fn request(&self, request: RegistrationRequest) -> Result<RegistrationResponse> {
        Ok(self.orchestrator.handle_request(request).await)
    }

    async fn open_data_channel(&self, agent_id: &AgentId) -> Result<DataChannel> {
        if !self.orchestrator.is_registered(agent_id).await {
            return Err(BusError::RegistrationRejected("Agent not registered".to_string()));
        }

        let (inbound_tx, inbound) = self.hub.peer_channel();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        self.hub.attach(agent_id.clone(), inbound_tx).await;

        let orchestrator = self.orchestrator.clone();
        let sender = agent_id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                orchestrator.handle_frame(&sender, frame).await;
            }
        });
        self.attached.lock().await.push((agent_id.clone(), forwarder));
        Ok(DataChannel { outbound, inbound })
    }

    async fn close(&self) -> Result<()> {
        for (agent_id, mut forwarder) in self.attached.lock().await.drain(..) {
            if timeout(DRAIN_TIMEOUT, &mut forwarder).await.is_err() {
                forwarder.abort();
            }
            self.hub.detach(&agent_id).await;
        }
        Ok(())
    }
}
