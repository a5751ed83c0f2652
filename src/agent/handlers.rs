//! Handler registration and emitters for remote agents
//!
//! Information Hiding:
//! - Handler identity is the `Arc` pointer, so registering the same handler
//!   twice under one name is a no-op
//! - Emitters resolve the agent context at call time, not at creation
//! - Every send asks the orchestrator first, so an unroutable name fails at
//!   the call site instead of being dropped downstream

use super::context::AgentContext;
use crate::core::{AgentState, Message, RegistrationRequest};
use crate::error::{BusError, Result};
use crate::transport::AgentTransport;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Callback for one inbound message payload
pub type MessageHandler = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// Computation wrapped by an `Emitter`
pub type Compute = Arc<dyn Fn(&Value) -> anyhow::Result<Value> + Send + Sync>;

pub fn handler<F>(f: F) -> MessageHandler
where
    F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// What runs when a subscribed message arrives
#[derive(Clone)]
pub enum ReceiveHandler {
    Call(MessageHandler),
    /// The payload is fed to the emitter and its result sent onward
    Emit(Emitter),
}

impl ReceiveHandler {
    fn same(&self, other: &ReceiveHandler) -> bool {
        match (self, other) {
            (ReceiveHandler::Call(a), ReceiveHandler::Call(b)) => Arc::ptr_eq(a, b),
            (ReceiveHandler::Emit(a), ReceiveHandler::Emit(b)) => {
                Arc::ptr_eq(&a.compute, &b.compute) && a.names == b.names
            }
            _ => false,
        }
    }
}

impl From<MessageHandler> for ReceiveHandler {
    fn from(handler: MessageHandler) -> Self {
        ReceiveHandler::Call(handler)
    }
}

impl From<Emitter> for ReceiveHandler {
    fn from(emitter: Emitter) -> Self {
        ReceiveHandler::Emit(emitter)
    }
}

/// message name -> handlers, in registration order
#[derive(Default)]
pub struct HandlerTable {
    handlers: BTreeMap<String, Vec<ReceiveHandler>>,
}

impl HandlerTable {
    /// Returns false when this exact handler is already registered for `name`
    pub fn insert(&mut self, name: impl Into<String>, handler: ReceiveHandler) -> bool {
        let slot = self.handlers.entry(name.into()).or_default();
        if slot.iter().any(|existing| existing.same(&handler)) {
            return false;
        }
        slot.push(handler);
        true
    }

    pub fn get(&self, name: &str) -> Vec<ReceiveHandler> {
        self.handlers.get(name).cloned().unwrap_or_default()
    }

    /// Subscription list declared at registration
    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Ask the orchestrator whether a message named `name` would be routed
pub(crate) async fn ensure_routable(transport: &dyn AgentTransport, name: &str) -> Result<()> {
    let response = transport
        .request(RegistrationRequest::Routable {
            name: name.to_string(),
        })
        .await?;
    if response.is_success() {
        return Ok(());
    }
    tracing::warn!(message = %name, error = ?response.error, "Message is not routable");
    Err(BusError::NoSubscribers(name.to_string()))
}

/// Runs a computation and publishes its result under each declared name.
///
/// Returned by `AgentClient::emit`. The result is also handed back to the
/// caller, so emitters compose with ordinary code. Registered through
/// `on_receive`, an emitter turns an inbound message into outbound ones.
#[derive(Clone)]
pub struct Emitter {
    names: Vec<String>,
    compute: Compute,
    context: Arc<AgentContext>,
    transport: Arc<dyn AgentTransport>,
}

impl Emitter {
    pub(crate) fn new(
        names: Vec<String>,
        compute: Compute,
        context: Arc<AgentContext>,
        transport: Arc<dyn AgentTransport>,
    ) -> Self {
        Self {
            names,
            compute,
            context,
            transport,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Compute, then send the result under every name. Nothing is sent when
    /// any of the names is unroutable.
    pub async fn call(&self, input: &Value) -> Result<Value> {
        // fail before computing anything when the agent is not running
        self.context.agent_id()?;
        self.context.set_state(AgentState::Running);

        let result = match (self.compute)(input) {
            Ok(result) => result,
            Err(e) => {
                self.context.set_state(AgentState::Error);
                return Err(BusError::HandlerFailure {
                    agent: self.context.name().to_string(),
                    reason: format!("{e:#}"),
                });
            }
        };

        for name in &self.names {
            if let Err(e) = ensure_routable(self.transport.as_ref(), name).await {
                self.context.set_state(AgentState::Error);
                return Err(e);
            }
        }
        for name in &self.names {
            if let Err(e) = self.context.send(Message::new(name.clone(), result.clone())) {
                self.context.set_state(AgentState::Error);
                return Err(e);
            }
        }
        self.context.set_state(AgentState::Success);
        Ok(result)
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("agent", &self.context.name())
            .field("names", &self.names)
            .finish()
    }
}
