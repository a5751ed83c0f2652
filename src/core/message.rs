//! Message and identity model shared by the orchestrator and agent runtimes
//!
//! Information Hiding:
//! - Identity hashing scheme hidden behind `AgentId::derive`
//! - Lifecycle and liveness enums carry their own wire names

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Routing key of a registered agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Derive an identity from the agent name and, for remote agents, its address.
    ///
    /// Two processes using the same name on different hosts get different ids.
    pub fn derive(name: &str, address: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        if let Some(address) = address {
            hasher.update(b"@");
            hasher.update(address.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First characters of the id, for log lines
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for AgentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A named payload travelling through the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub name: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<AgentId>,
}

impl Message {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            origin_name: None,
            origin_id: None,
        }
    }

    pub fn with_origin(mut self, name: impl Into<String>, id: AgentId) -> Self {
        self.origin_name = Some(name.into());
        self.origin_id = Some(id);
        self
    }
}

/// Lifecycle of an agent invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentState {
    Initialized,
    Idle,
    Running,
    Success,
    Error,
}

impl AgentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentState::Success | AgentState::Error)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentState::Initialized => "INITIALIZED",
            AgentState::Idle => "IDLE",
            AgentState::Running => "RUNNING",
            AgentState::Success => "SUCCESS",
            AgentState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Terminal transition reported to the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    Success,
    Error,
}

impl From<Notification> for AgentState {
    fn from(value: Notification) -> Self {
        match value {
            Notification::Success => AgentState::Success,
            Notification::Error => AgentState::Error,
        }
    }
}

/// Heartbeat-derived liveness of a remote agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentStatus {
    Active,
    Inactive,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Active => f.write_str("ACTIVE"),
            AgentStatus::Inactive => f.write_str("INACTIVE"),
        }
    }
}
