//! agentbus - distributed agent message bus
//!
//! A central orchestrator tracks agents, routes named messages to their
//! subscribers and runs in-process agents through flat joins and
//! execution-graph cascades. Remote agents talk to it over two TCP channels,
//! one for registration and heartbeats, one for data frames.

pub mod agent;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod orchestrator;
pub mod transport;
pub mod utils;

pub use agent::{handler, AgentClient, Emitter, MessageHandler};
pub use config::Settings;
pub use core::{AgentId, AgentState, AgentStatus, Message, Notification};
pub use error::{BusError, Result};
pub use orchestrator::{ExecutionMode, LocalAgent, Orchestrator, OrchestratorServer, RouteReport};
pub use transport::local::{in_process, LocalTransport};
pub use transport::tcp::TcpAgentTransport;
