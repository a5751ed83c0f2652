//! Agent Runtime - remote agents that register with an orchestrator
//!
//! Information Hiding:
//! - `AgentClient` owns registration, heartbeats and the receive loop
//! - `AgentContext` carries identity and the outbound channel once started
//! - `Emitter` publishes computed results once the orchestrator confirms a route

mod client;
mod context;
mod handlers;

pub use client::AgentClient;
pub use context::AgentContext;
pub use handlers::{handler, Compute, Emitter, HandlerTable, MessageHandler, ReceiveHandler};
