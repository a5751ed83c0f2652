//! Agent Client - runtime of a remote agent
//!
//! Information Hiding:
//! - Registration, data channel and heartbeat loop hidden behind start/stop
//! - Handler failures and panics are caught per message and only change the
//!   agent state; the receive loop keeps running
//! - Transport chosen at construction (`connect` for TCP, `new` for any)

use super::context::AgentContext;
use super::handlers::{ensure_routable, Compute, Emitter, HandlerTable, ReceiveHandler};
use crate::config::AgentConfig;
use crate::core::{AgentId, AgentState, Frame, Message, RegistrationRequest};
use crate::error::{describe_panic, BusError, Result};
use crate::transport::tcp::TcpAgentTransport;
use crate::transport::AgentTransport;
use futures::FutureExt;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc::Receiver;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

struct RunningAgent {
    agent_id: AgentId,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct AgentClient {
    context: Arc<AgentContext>,
    address: String,
    config: AgentConfig,
    transport: Arc<dyn AgentTransport>,
    handlers: Arc<RwLock<HandlerTable>>,
    running: Mutex<Option<RunningAgent>>,
}

impl AgentClient {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        config: AgentConfig,
        transport: Arc<dyn AgentTransport>,
    ) -> Self {
        Self {
            context: Arc::new(AgentContext::new(name)),
            address: address.into(),
            config,
            transport,
            handlers: Arc::new(RwLock::new(HandlerTable::default())),
            running: Mutex::new(None),
        }
    }

    /// Agent talking to the orchestrator named in `config` over TCP
    pub fn connect(name: impl Into<String>, config: AgentConfig) -> Self {
        let transport = Arc::new(TcpAgentTransport::new(&config));
        let address = config.agent_address();
        Self::new(name, address, config, transport)
    }

    pub fn name(&self) -> &str {
        self.context.name()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn agent_id(&self) -> Result<AgentId> {
        self.context.agent_id()
    }

    pub fn state(&self) -> AgentState {
        self.context.state()
    }

    pub fn context(&self) -> Arc<AgentContext> {
        self.context.clone()
    }

    /// Register `handler` (a `MessageHandler` or an `Emitter`) for messages
    /// named `message_name`.
    ///
    /// Handlers registered before `start` form the subscription list. Returns
    /// false if this handler was already registered under the name.
    pub fn on_receive(&self, message_name: impl Into<String>, handler: impl Into<ReceiveHandler>) -> bool {
        let message_name = message_name.into();
        let inserted = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message_name.clone(), handler.into());
        if inserted && self.context.is_set() {
            tracing::warn!(
                agent = %self.name(),
                message = %message_name,
                "Handler added after start; the subscription takes effect on the next registration"
            );
        }
        inserted
    }

    /// Wrap `compute` so every successful result is sent under each of `names`
    pub fn emit<F>(&self, names: &[&str], compute: F) -> Emitter
    where
        F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let compute: Compute = Arc::new(compute);
        Emitter::new(
            names.iter().map(|name| name.to_string()).collect(),
            compute,
            self.context.clone(),
            self.transport.clone(),
        )
    }

    /// Send `message` through the orchestrator. Fails with `NoSubscribers`
    /// when the orchestrator would refuse to route its name.
    pub async fn send_message(&self, message: Message) -> Result<()> {
        self.context.agent_id()?;
        ensure_routable(self.transport.as_ref(), &message.name).await?;
        self.context.send(message)
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Register, open the data channel and start the heartbeat and receive loops.
    /// Calling it on a running agent returns the current identity.
    pub async fn start(&self) -> Result<AgentId> {
        let mut running = self.running.lock().await;
        if let Some(active) = running.as_ref() {
            return Ok(active.agent_id.clone());
        }

        let subscriptions = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .names();
        let response = self
            .transport
            .request(RegistrationRequest::Register {
                name: self.name().to_string(),
                address: self.address.clone(),
                subscriptions: subscriptions.clone(),
            })
            .await?;
        if !response.is_success() {
            let reason = response.error.unwrap_or_else(|| "no reason given".to_string());
            tracing::error!(agent = %self.name(), %reason, "Registration rejected");
            return Err(BusError::RegistrationRejected(reason));
        }
        let agent_id = response
            .agent_id
            .ok_or_else(|| BusError::RegistrationRejected("response carried no agent_id".to_string()))?;

        let channel = match self.transport.open_data_channel(&agent_id).await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = self
                    .transport
                    .request(RegistrationRequest::Unregister {
                        agent_id: agent_id.clone(),
                    })
                    .await;
                return Err(e);
            }
        };
        self.context.attach(agent_id.clone(), channel.outbound);
        self.context.set_state(AgentState::Idle);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.transport.clone(),
            agent_id.clone(),
            Duration::from_millis(self.config.heartbeat_interval_ms.max(1)),
            Duration::from_millis(self.config.retry_backoff_ms.max(1)),
            shutdown_rx.clone(),
        ));
        let receiver = tokio::spawn(receive_loop(
            channel.inbound,
            self.handlers.clone(),
            self.context.clone(),
            shutdown_rx,
        ));

        tracing::info!(
            agent = %self.name(),
            agent_id = %agent_id.short(),
            subscriptions = ?subscriptions,
            "Agent started"
        );
        *running = Some(RunningAgent {
            agent_id: agent_id.clone(),
            shutdown,
            tasks: vec![heartbeat, receiver],
        });
        Ok(agent_id)
    }

    /// Stop both loops, unregister and release the channels. No-op when stopped.
    pub async fn stop(&self) -> Result<()> {
        let Some(active) = self.running.lock().await.take() else {
            return Ok(());
        };

        let _ = active.shutdown.send(true);
        for task in active.tasks {
            if let Err(e) = task.await {
                tracing::warn!(agent = %self.name(), error = %e, "Agent task ended abnormally");
            }
        }

        let unregistered = self
            .transport
            .request(RegistrationRequest::Unregister {
                agent_id: active.agent_id.clone(),
            })
            .await;
        self.context.detach();
        let closed = self.transport.close().await;

        match unregistered {
            Ok(response) if response.is_success() => {
                tracing::info!(agent = %self.name(), "Agent stopped");
            }
            Ok(response) => tracing::warn!(
                agent = %self.name(),
                error = ?response.error,
                "Unregister was not acknowledged"
            ),
            Err(e) => tracing::warn!(agent = %self.name(), error = %e, "Unregister failed"),
        }
        closed
    }
}

/// Delay before the next heartbeat: the interval after an acknowledged beat,
/// an exponential backoff capped at the interval after failures
fn next_heartbeat_delay(interval: Duration, backoff: Duration, failures: u32) -> Duration {
    if failures == 0 {
        return interval;
    }
    let factor = 2u32.saturating_pow(failures - 1);
    backoff.saturating_mul(factor).min(interval)
}

async fn heartbeat_loop(
    transport: Arc<dyn AgentTransport>,
    agent_id: AgentId,
    interval: Duration,
    backoff: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures: u32 = 0;
    loop {
        let outcome = tokio::select! {
            outcome = transport.request(RegistrationRequest::Heartbeat { agent_id: agent_id.clone() }) => outcome,
            _ = shutdown.changed() => break,
        };
        match outcome {
            Ok(response) if response.is_success() => {
                failures = 0;
                tracing::trace!(agent_id = %agent_id.short(), "Heartbeat acknowledged");
            }
            Ok(response) => {
                failures = failures.saturating_add(1);
                tracing::warn!(agent_id = %agent_id.short(), error = ?response.error, "Heartbeat rejected");
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                tracing::error!(agent_id = %agent_id.short(), error = %e, failures, "Heartbeat failed");
            }
        }

        tokio::select! {
            _ = sleep(next_heartbeat_delay(interval, backoff, failures)) => {}
            _ = shutdown.changed() => break,
        }
    }
}

async fn receive_loop(
    mut inbound: Receiver<Frame>,
    handlers: Arc<RwLock<HandlerTable>>,
    context: Arc<AgentContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            frame = inbound.recv() => match frame {
                Some(frame) => frame,
                None => {
                    tracing::debug!(agent = %context.name(), "Data channel closed");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        };
        match frame.to_message() {
            Ok(message) => dispatch(&message, &handlers, &context).await,
            Err(e) => tracing::warn!(agent = %context.name(), error = %e, "Dropping malformed frame"),
        }
    }
}

async fn dispatch(message: &Message, handlers: &RwLock<HandlerTable>, context: &AgentContext) {
    let registered = handlers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&message.name);
    if registered.is_empty() {
        tracing::debug!(agent = %context.name(), message = %message.name, "No handler for message");
        return;
    }

    context.set_state(AgentState::Running);
    let mut failed = false;
    for handler in registered {
        let outcome = match &handler {
            ReceiveHandler::Call(callback) => catch_unwind(AssertUnwindSafe(|| callback(&message.data)))
                .map(|result| result.map_err(|e| format!("{e:#}"))),
            ReceiveHandler::Emit(emitter) => AssertUnwindSafe(emitter.call(&message.data))
                .catch_unwind()
                .await
                .map(|result| match result {
                    Ok(_) => Ok(()),
                    Err(BusError::HandlerFailure { reason, .. }) => Err(reason),
                    Err(e) => Err(e.to_string()),
                }),
        };
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                failed = true;
                let failure = BusError::HandlerFailure {
                    agent: context.name().to_string(),
                    reason,
                };
                tracing::error!(message = %message.name, error = %failure, "Handler failed");
            }
            Err(panic) => {
                failed = true;
                tracing::error!(
                    agent = %context.name(),
                    message = %message.name,
                    panic = %describe_panic(panic.as_ref()),
                    "Handler panicked"
                );
            }
        }
    }
    context.set_state(if failed { AgentState::Error } else { AgentState::Success });
}
