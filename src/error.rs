use crate::core::message::AgentId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),

    #[error("Agent '{name}' at {address} is already registered and active")]
    DuplicateRegistration { name: String, address: String },

    #[error("No subscribers for message '{0}'")]
    NoSubscribers(String),

    #[error("Agent {agent} never declared input '{name}'")]
    UndeclaredInput { agent: AgentId, name: String },

    #[error("Handler failure in agent '{agent}': {reason}")]
    HandlerFailure { agent: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Agent context has not been set; register the agent first")]
    AgentContextUnset,

    #[error("Registration rejected: {0}")]
    RegistrationRejected(String),

    #[error("Dependency {parent} -> {child} would create a cycle")]
    CycleDetected { parent: AgentId, child: AgentId },

    #[error("Local agent '{0}' would re-trigger itself through the messages it emits")]
    EmitCycle(String),

    #[error("Invalid agent: {0}")]
    InvalidAgent(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BusError>;

/// Best-effort text of a caught panic payload
pub(crate) fn describe_panic(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
