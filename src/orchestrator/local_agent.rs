//! In-process agents - agents owned by the orchestrator and run on message arrival
//!
//! Information Hiding:
//! - Handler wrapping (single payload vs. joined inputs) hidden behind the builder
//! - Execution mode fixed at construction; the router only asks what to call

use crate::error::{BusError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Handler of an in-process agent. Receives the inputs of one invocation:
/// the message payload in independent mode, the joined values in join mode,
/// the parents' results in graph mode.
pub type Handler = Arc<dyn Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Each subscribed message invokes its handler directly
    Independent,
    /// Fires once every required message of a round has arrived
    Join,
    /// Fires once every parent in the execution graph has succeeded
    Graph,
}

pub struct LocalAgent {
    name: String,
    mode: ExecutionMode,
    handlers: HashMap<String, Handler>,
    requires: Vec<String>,
    run: Option<Handler>,
    emits: Vec<String>,
}

impl LocalAgent {
    /// Agent that processes each subscribed message on its own.
    ///
    /// # Example
    /// ```no_run
    /// use agentbus::LocalAgent;
    /// use serde_json::json;
    ///
    /// let agent = LocalAgent::independent("echo")
    ///     .on("ping", |data| Ok(json!({"pong": data})))
    ///     .emits("pong");
    /// ```
    pub fn independent(name: impl Into<String>) -> Self {
        Self::with_mode(name, ExecutionMode::Independent)
    }

    /// Agent that waits for one value of each `requires` name before running
    pub fn join<F>(name: impl Into<String>, requires: &[&str], run: F) -> Self
    where
        F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let mut agent = Self::with_mode(name, ExecutionMode::Join);
        agent.requires = requires.iter().map(|s| s.to_string()).collect();
        agent.run = Some(Arc::new(run));
        agent
    }

    /// Agent whose inputs are the results of its parents in the execution graph
    pub fn graph<F>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let mut agent = Self::with_mode(name, ExecutionMode::Graph);
        agent.run = Some(Arc::new(run));
        agent
    }

    fn with_mode(name: impl Into<String>, mode: ExecutionMode) -> Self {
        Self {
            name: name.into(),
            mode,
            handlers: HashMap::new(),
            requires: Vec::new(),
            run: None,
            emits: Vec::new(),
        }
    }

    /// Register the handler for one message name (independent mode)
    pub fn on<F>(mut self, message_name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let wrapped: Handler = Arc::new(move |inputs: Vec<Value>| {
            handler(inputs.into_iter().next().unwrap_or(Value::Null))
        });
        self.handlers.insert(message_name.into(), wrapped);
        self
    }

    /// Re-route every successful result under `message_name`
    pub fn emits(mut self, message_name: impl Into<String>) -> Self {
        let name = message_name.into();
        if !self.emits.contains(&name) {
            self.emits.push(name);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn emitted(&self) -> &[String] {
        &self.emits
    }

    pub fn requires(&self) -> &[String] {
        &self.requires
    }

    /// Names this agent subscribes to when registered
    pub fn subscriptions(&self) -> Vec<String> {
        match self.mode {
            ExecutionMode::Independent => {
                let mut names: Vec<String> = self.handlers.keys().cloned().collect();
                names.sort();
                names
            }
            ExecutionMode::Join => self.requires.clone(),
            ExecutionMode::Graph => Vec::new(),
        }
    }

    /// Handler to call for a message (independent) or a completed set of inputs
    pub fn handler_for(&self, message_name: Option<&str>) -> Option<Handler> {
        match (self.mode, message_name) {
            (ExecutionMode::Independent, Some(name)) => self.handlers.get(name).cloned(),
            (ExecutionMode::Independent, None) => None,
            _ => self.run.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(BusError::InvalidAgent("agent name is empty".to_string()));
        }
        match self.mode {
            ExecutionMode::Independent if self.handlers.is_empty() => Err(BusError::InvalidAgent(
                format!("'{}' has no message handlers", self.name),
            )),
            ExecutionMode::Join if self.requires.is_empty() => Err(BusError::InvalidAgent(
                format!("'{}' joins on no inputs", self.name),
            )),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for LocalAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAgent")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("subscriptions", &self.subscriptions())
            .field("emits", &self.emits)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_independent_handler_gets_payload() {
        let agent = LocalAgent::independent("echo").on("ping", |data| Ok(json!({"got": data})));
        assert_eq!(agent.subscriptions(), vec!["ping".to_string()]);

        let handler = agent.handler_for(Some("ping")).unwrap();
        assert_eq!(handler(vec![json!(7)]).unwrap(), json!({"got": 7}));
        assert!(agent.handler_for(Some("other")).is_none());
    }

    #[test]
    fn test_join_subscribes_to_requirements() {
        let agent = LocalAgent::join("sum", &["a", "b"], |inputs| {
            Ok(json!(inputs.iter().filter_map(Value::as_i64).sum::<i64>()))
        });
        assert_eq!(agent.subscriptions(), vec!["a".to_string(), "b".to_string()]);
        let run = agent.handler_for(None).unwrap();
        assert_eq!(run(vec![json!(1), json!(2)]).unwrap(), json!(3));
    }

    #[test]
    fn test_validation() {
        assert!(LocalAgent::independent("idle").validate().is_err());
        assert!(LocalAgent::join("j", &[], |_| Ok(Value::Null)).validate().is_err());
        assert!(LocalAgent::graph("g", |_| Ok(Value::Null)).validate().is_ok());
        assert!(LocalAgent::graph("g", |_| Ok(Value::Null))
            .subscriptions()
            .is_empty());
    }
}
