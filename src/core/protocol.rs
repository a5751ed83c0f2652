//! Wire records for the registration and data channels
//!
//! Registration requests are flat records tagged by `action`; data frames are
//! a delimiter part followed by the encoded message.

use crate::core::message::{AgentId, AgentStatus, Message};
use crate::error::{BusError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RegistrationRequest {
    Register {
        name: String,
        address: String,
        #[serde(default)]
        subscriptions: Vec<String>,
    },
    Heartbeat {
        agent_id: AgentId,
    },
    Unregister {
        agent_id: AgentId,
    },
    Status {
        agent_id: AgentId,
    },
    /// Asked before a send: fails when routing `name` would fail
    Routable {
        name: String,
    },
}

impl RegistrationRequest {
    pub fn action(&self) -> &'static str {
        match self {
            RegistrationRequest::Register { .. } => "register",
            RegistrationRequest::Heartbeat { .. } => "heartbeat",
            RegistrationRequest::Unregister { .. } => "unregister",
            RegistrationRequest::Status { .. } => "status",
            RegistrationRequest::Routable { .. } => "routable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Failed,
}

/// Status view of a registered agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatusReport {
    pub name: String,
    pub id: AgentId,
    pub address: String,
    pub status: AgentStatus,
    pub subscriptions: Vec<String>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentStatusReport>,
}

impl RegistrationResponse {
    pub fn success() -> Self {
        Self {
            status: ResponseStatus::Success,
            agent_id: None,
            error: None,
            agent: None,
        }
    }

    pub fn registered(agent_id: AgentId) -> Self {
        Self {
            agent_id: Some(agent_id),
            ..Self::success()
        }
    }

    pub fn status_report(report: AgentStatusReport) -> Self {
        Self {
            agent: Some(report),
            ..Self::success()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Failed,
            agent_id: None,
            error: Some(error.into()),
            agent: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

/// First line of a data connection, naming the identity it speaks for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataHello {
    pub agent_id: AgentId,
}

/// Multipart data-channel frame: `["", <encoded message>]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Frame {
    parts: Vec<String>,
}

impl Frame {
    pub fn from_message(message: &Message) -> Result<Self> {
        Ok(Self {
            parts: vec![String::new(), serde_json::to_string(message)?],
        })
    }

    pub fn from_parts(parts: Vec<String>) -> Self {
        Self { parts }
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// Decode the message carried in the last part
    pub fn to_message(&self) -> Result<Message> {
        let body = self
            .parts
            .last()
            .ok_or_else(|| BusError::MalformedFrame("empty frame".to_string()))?;
        if body.is_empty() {
            return Err(BusError::MalformedFrame("missing message body".to_string()));
        }
        Ok(serde_json::from_str(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_register_request() {
        let raw = json!({
            "action": "register",
            "name": "consumer",
            "address": "127.0.0.1:5555",
            "subscriptions": ["ping"]
        });
        let request: RegistrationRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(
            request,
            RegistrationRequest::Register {
                name: "consumer".to_string(),
                address: "127.0.0.1:5555".to_string(),
                subscriptions: vec!["ping".to_string()],
            }
        );
        assert_eq!(request.action(), "register");
    }

    #[test]
    fn test_heartbeat_request_shape() {
        let request = RegistrationRequest::Heartbeat {
            agent_id: AgentId::from("abc"),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"action": "heartbeat", "agent_id": "abc"})
        );
    }

    #[test]
    fn test_routable_request_shape() {
        let request: RegistrationRequest =
            serde_json::from_value(json!({"action": "routable", "name": "result"})).unwrap();
        assert_eq!(
            request,
            RegistrationRequest::Routable {
                name: "result".to_string()
            }
        );
        assert_eq!(request.action(), "routable");
    }

    #[test]
    fn test_response_shapes() {
        let ok = RegistrationResponse::registered(AgentId::from("abc"));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"status": "success", "agent_id": "abc"})
        );

        let missing = RegistrationResponse::failed("Agent not found");
        assert_eq!(
            serde_json::to_value(&missing).unwrap(),
            json!({"status": "failed", "error": "Agent not found"})
        );
        assert!(!missing.is_success());
    }

    #[test]
    fn test_frame_carries_message() {
        let message = Message::new("ping", json!({"n": 1}));
        let frame = Frame::from_message(&message).unwrap();

        assert_eq!(frame.parts().len(), 2);
        assert!(frame.parts()[0].is_empty());
        assert_eq!(frame.to_message().unwrap(), message);
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(
            Frame::from_parts(vec![]).to_message(),
            Err(BusError::MalformedFrame(_))
        ));
        assert!(matches!(
            Frame::from_parts(vec![String::new()]).to_message(),
            Err(BusError::MalformedFrame(_))
        ));
        assert!(matches!(
            Frame::from_parts(vec![String::new(), "not json".to_string()]).to_message(),
            Err(BusError::Codec(_))
        ));
    }
}
