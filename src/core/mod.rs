//! Core data model and wire records

pub mod message;
pub mod protocol;

pub use message::{AgentId, AgentState, AgentStatus, Message, Notification};
pub use protocol::{
    AgentStatusReport, DataHello, Frame, RegistrationRequest, RegistrationResponse,
    ResponseStatus,
};
