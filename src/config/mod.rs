mod settings;

pub use settings::{
    AgentConfig, DuplicatePolicy, LoggingConfig, NoSubscribersPolicy, OrchestratorConfig,
    Settings, SystemConfig,
};
