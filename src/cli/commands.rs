use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "agentbus")]
#[command(author, version, about = "Distributed agent message bus", long_about = None)]
pub struct Cli {
    /// Settings file (defaults to config/$CONFIG_ENV, then built-in defaults)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an orchestrator on the configured registration and message ports
    Serve,

    /// Register an agent and print every message it receives
    Listen {
        /// Agent name
        #[arg(short, long, default_value = "listener")]
        name: String,

        /// Message names to subscribe to
        #[arg(required = true)]
        subscribe: Vec<String>,
    },

    /// Register briefly and send one message
    Publish {
        /// Message name
        message: String,

        /// JSON payload
        #[arg(default_value = "null")]
        data: String,

        /// Agent name used as origin
        #[arg(short, long, default_value = "publisher")]
        name: String,
    },

    /// Show the orchestrator's view of an agent
    Status {
        /// Agent identity (hex digest)
        agent_id: String,
    },
}
