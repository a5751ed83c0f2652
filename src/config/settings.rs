use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub orchestrator: OrchestratorConfig,
    pub agent: AgentConfig,
    pub system: SystemConfig,
    pub logging: LoggingConfig,
}

/// What `route`/`broadcast` do with a message nobody subscribed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoSubscribersPolicy {
    Error,
    Ignore,
}

/// What `register` does when the same name/address pair is already active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    Reject,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub name: String,
    pub host: String,
    pub registration_port: u16,
    pub message_port: u16,
    pub liveness_check_interval_ms: u64,
    pub liveness_timeout_ms: u64,
    pub no_subscribers: NoSubscribersPolicy,
    pub duplicate_registration: DuplicatePolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            name: "orchestrator".to_string(),
            host: "0.0.0.0".to_string(),
            registration_port: 5556,
            message_port: 5555,
            liveness_check_interval_ms: 5_000,
            liveness_timeout_ms: 30_000,
            no_subscribers: NoSubscribersPolicy::Error,
            duplicate_registration: DuplicatePolicy::Refresh,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub orchestrator_host: String,
    pub registration_port: u16,
    pub message_port: u16,
    pub heartbeat_interval_ms: u64,
    pub retry_backoff_ms: u64,
    pub request_timeout_ms: u64,
    /// Address reported at registration. Part of the agent identity.
    pub advertise_address: Option<String>,
    pub inbound_buffer_size: usize,
}

impl AgentConfig {
    pub fn registration_addr(&self) -> String {
        format!("{}:{}", self.orchestrator_host, self.registration_port)
    }

    pub fn message_addr(&self) -> String {
        format!("{}:{}", self.orchestrator_host, self.message_port)
    }

    /// Configured address, or one unique to this host and process
    pub fn agent_address(&self) -> String {
        self.advertise_address.clone().unwrap_or_else(|| {
            let host = env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
            format!("{}/{}", host, std::process::id())
        })
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            orchestrator_host: "127.0.0.1".to_string(),
            registration_port: 5556,
            message_port: 5555,
            heartbeat_interval_ms: 10_000,
            retry_backoff_ms: 250,
            request_timeout_ms: 5_000,
            advertise_address: None,
            inbound_buffer_size: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub channel_buffer_size: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config_env = env::var("CONFIG_ENV").unwrap_or_else(|_| "default".to_string());
        Self::load(File::with_name(&format!("config/{}", config_env)).required(false))
    }

    /// Load settings from an explicit file, still honouring `APP__*` overrides
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load(File::from(path.as_ref()).required(true))
    }

    fn load<S>(file: S) -> Result<Self, ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let config = Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(file)
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
