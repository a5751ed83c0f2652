//! Orchestrator Server - binds both sockets and runs the broker loops
//!
//! Information Hiding:
//! - Listener tasks, the inbound frame loop and the liveness monitor are
//!   owned here and stopped together by `shutdown`
//! - Inbound frames from every connection are processed by one sequential loop

use super::liveness::liveness_monitor;
use super::Orchestrator;
use crate::config::Settings;
use crate::core::{AgentId, Frame};
use crate::error::Result;
use crate::transport::tcp::{serve_data, serve_registration};
use crate::transport::ConnectionHub;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub struct OrchestratorServer {
    orchestrator: Orchestrator,
    hub: Arc<ConnectionHub>,
    registration_addr: SocketAddr,
    message_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl OrchestratorServer {
    /// Bind the configured registration and message ports and start serving
    pub async fn bind(settings: &Settings) -> Result<Self> {
        let config = &settings.orchestrator;
        let registration = TcpListener::bind((config.host.as_str(), config.registration_port)).await?;
        let message = TcpListener::bind((config.host.as_str(), config.message_port)).await?;
        Self::start(settings, registration, message)
    }

    /// Serve on listeners the caller already bound
    pub fn start(settings: &Settings, registration: TcpListener, message: TcpListener) -> Result<Self> {
        let registration_addr = registration.local_addr()?;
        let message_addr = message.local_addr()?;

        let hub = Arc::new(ConnectionHub::with_capacity(settings.system.channel_buffer_size));
        let orchestrator = Orchestrator::new(settings.orchestrator.clone(), hub.clone());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::channel(settings.system.channel_buffer_size.max(1));

        let tasks = vec![
            tokio::spawn(serve_registration(
                registration,
                orchestrator.clone(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(serve_data(
                message,
                orchestrator.clone(),
                hub.clone(),
                inbound_tx,
                shutdown_rx.clone(),
            )),
            tokio::spawn(receive_loop(orchestrator.clone(), inbound_rx, shutdown_rx.clone())),
            tokio::spawn(liveness_monitor(orchestrator.clone(), shutdown_rx)),
        ];

        tracing::info!(
            name = %orchestrator.name(),
            %registration_addr,
            %message_addr,
            "Orchestrator listening"
        );

        Ok(Self {
            orchestrator,
            hub,
            registration_addr,
            message_addr,
            shutdown,
            tasks,
        })
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn registration_addr(&self) -> SocketAddr {
        self.registration_addr
    }

    pub fn message_addr(&self) -> SocketAddr {
        self.message_addr
    }

    pub async fn connected_agents(&self) -> usize {
        self.hub.peer_count().await
    }

    /// Stop accepting, stop every loop and wait for them to exit
    pub async fn shutdown(self) {
        tracing::info!("Orchestrator shutting down");
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Server task ended abnormally");
            }
        }
    }
}

async fn receive_loop(
    orchestrator: Orchestrator,
    mut inbound: mpsc::Receiver<(AgentId, Frame)>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = inbound.recv() => match received {
                Some((sender, frame)) => orchestrator.handle_frame(&sender, frame).await,
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("Receive loop stopped");
}
