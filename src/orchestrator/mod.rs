//! Orchestrator - central broker owning registration, routing and scheduling state
//!
//! Information Hiding:
//! - All mutable state sits behind one coarse lock, never held across I/O
//!   or handler calls
//! - Delivery to remote agents goes through a `FrameSink`, so the broker does
//!   not know which transport carries the frames
//! - Network loops live in `server`, the periodic sweep in `liveness`

pub mod liveness;
pub mod local_agent;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod server;

pub use local_agent::{ExecutionMode, Handler, LocalAgent};
pub use registry::{AgentRecord, AgentRegistry, SubscriptionTable};
pub use router::RouteReport;
pub use scheduler::{ExecutionGraph, ExecutionGraphNode, JoinQueue, Scheduler};
pub use server::OrchestratorServer;

use crate::config::{DuplicatePolicy, NoSubscribersPolicy, OrchestratorConfig};
use crate::core::{
    AgentId, AgentState, AgentStatusReport, RegistrationRequest, RegistrationResponse,
};
use crate::error::{BusError, Result};
use crate::transport::FrameSink;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

pub(crate) struct BusState {
    pub(crate) registry: AgentRegistry,
    pub(crate) local_agents: HashMap<AgentId, LocalAgent>,
    pub(crate) scheduler: Scheduler,
}

impl BusState {
    fn new(policy: DuplicatePolicy) -> Self {
        Self {
            registry: AgentRegistry::new(policy),
            local_agents: HashMap::new(),
            scheduler: Scheduler::new(),
        }
    }

    fn is_known(&self, id: &AgentId) -> bool {
        self.registry.contains(id) || self.local_agents.contains_key(id)
    }

    /// Local agents that an invocation of `id` starts within the same routing
    /// pass: in-process subscribers of its emitted names and its graph children.
    /// `candidate` stands in for a local agent that is about to be registered.
    fn triggered(&self, id: &AgentId, candidate: Option<(&AgentId, &LocalAgent)>) -> Vec<AgentId> {
        let replaced = |other: &AgentId| candidate.map_or(false, |(candidate_id, _)| other == candidate_id);
        let agent = match candidate {
            Some((candidate_id, agent)) if candidate_id == id => Some(agent),
            _ => self.local_agents.get(id),
        };

        let mut next = Vec::new();
        for name in agent.map(LocalAgent::emitted).unwrap_or_default() {
            if let Some(ids) = self.registry.subscriptions().subscribers(name) {
                next.extend(
                    ids.iter()
                        .filter(|s| !replaced(*s) && self.local_agents.contains_key(*s))
                        .cloned(),
                );
            }
            if let Some((candidate_id, agent)) = candidate {
                if agent.subscriptions().contains(name) {
                    next.push(candidate_id.clone());
                }
            }
        }
        // a re-registered agent starts without graph edges
        if !replaced(id) {
            next.extend(
                self.scheduler
                    .graph()
                    .children(id)
                    .iter()
                    .filter(|child| !replaced(*child))
                    .cloned(),
            );
        }
        next
    }

    /// Whether running `start` eventually runs `target` again in-process
    fn retriggers(
        &self,
        start: &AgentId,
        target: &AgentId,
        candidate: Option<(&AgentId, &LocalAgent)>,
    ) -> bool {
        let mut stack = self.triggered(start, candidate);
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if &current == target {
                return true;
            }
            if seen.insert(current.clone()) {
                stack.extend(self.triggered(&current, candidate));
            }
        }
        false
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    state: Arc<Mutex<BusState>>,
    sink: Arc<dyn FrameSink>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, sink: Arc<dyn FrameSink>) -> Self {
        let state = BusState::new(config.duplicate_registration);
        Self {
            config,
            state: Arc::new(Mutex::new(state)),
            sink,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Register a remote agent and index its subscriptions
    pub async fn register(
        &self,
        name: &str,
        address: &str,
        subscriptions: Vec<String>,
    ) -> Result<AgentId> {
        let mut state = self.state.lock().await;
        let id = state
            .registry
            .register(name, address, subscriptions, Utc::now())?;
        state.scheduler.track(&id);
        tracing::info!(agent = %name, agent_id = %id.short(), %address, "Agent registered");
        Ok(id)
    }

    /// Register an agent that runs inside the orchestrator process
    pub async fn register_local(&self, agent: LocalAgent) -> Result<AgentId> {
        agent.validate()?;
        let id = AgentId::derive(agent.name(), None);
        let mut state = self.state.lock().await;

        // an in-process loop would keep a single route call running forever
        if state.retriggers(&id, &id, Some((&id, &agent))) {
            tracing::warn!(agent = %agent.name(), emits = ?agent.emitted(), "Rejected emit cycle");
            return Err(BusError::EmitCycle(agent.name().to_string()));
        }

        if let Some(old) = state.local_agents.remove(&id) {
            if self.config.duplicate_registration == DuplicatePolicy::Reject {
                state.local_agents.insert(id.clone(), old);
                return Err(BusError::DuplicateRegistration {
                    name: agent.name().to_string(),
                    address: "local".to_string(),
                });
            }
            let previous = old.subscriptions();
            state.registry.subscriptions_mut().unsubscribe(&id, &previous);
            state.scheduler.forget(&id);
        }

        let subscriptions = agent.subscriptions();
        state.registry.subscriptions_mut().subscribe(&id, &subscriptions);
        if agent.mode() == ExecutionMode::Join {
            state.scheduler.add_join(&id, agent.requires().to_vec());
        }
        state.scheduler.track(&id);
        tracing::info!(
            agent = %agent.name(),
            agent_id = %id.short(),
            mode = ?agent.mode(),
            "Local agent registered"
        );
        state.local_agents.insert(id.clone(), agent);
        Ok(id)
    }

    pub async fn heartbeat(&self, id: &AgentId) -> Result<()> {
        self.state.lock().await.registry.heartbeat(id, Utc::now())
    }

    /// Remove an agent with all of its subscriptions, join rounds and graph edges
    pub async fn unregister(&self, id: &AgentId) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.registry.contains(id) {
                let record = state.registry.unregister(id)?;
                tracing::info!(agent = %record.name, agent_id = %id.short(), "Agent unregistered");
            } else if let Some(agent) = state.local_agents.remove(id) {
                let subscriptions = agent.subscriptions();
                state.registry.subscriptions_mut().unsubscribe(id, &subscriptions);
                tracing::info!(agent = %agent.name(), agent_id = %id.short(), "Local agent unregistered");
            } else {
                tracing::warn!(agent_id = %id.short(), "Unregister for unknown agent");
                return Err(BusError::UnknownAgent(id.clone()));
            }
            state.scheduler.forget(id);
        }
        self.sink.release(id).await;
        Ok(())
    }

    /// Declare that `child` runs on the results of `parent`.
    ///
    /// The child must be a local graph-mode agent; the parent may be any
    /// registered agent.
    pub async fn add_dependency(&self, parent: &AgentId, child: &AgentId) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.local_agents.get(child) {
            Some(agent) if agent.mode() == ExecutionMode::Graph => {}
            Some(agent) => {
                return Err(BusError::InvalidAgent(format!(
                    "'{}' is not a graph-mode agent",
                    agent.name()
                )))
            }
            None => return Err(BusError::UnknownAgent(child.clone())),
        }
        if !state.is_known(parent) {
            return Err(BusError::UnknownAgent(parent.clone()));
        }
        if state.local_agents.contains_key(parent) && state.retriggers(child, parent, None) {
            return Err(BusError::CycleDetected {
                parent: parent.clone(),
                child: child.clone(),
            });
        }
        state.scheduler.add_dependency(parent, child)?;
        tracing::debug!(parent = %parent.short(), child = %child.short(), "Dependency added");
        Ok(())
    }

    /// Flip agents whose last heartbeat is older than the liveness timeout
    pub async fn check_liveness(&self, now: DateTime<Utc>) -> Vec<AgentId> {
        let timeout = chrono::Duration::milliseconds(self.config.liveness_timeout_ms as i64);
        self.state.lock().await.registry.check_liveness(now, timeout)
    }

    pub async fn get_agent_status(&self, id: &AgentId) -> Option<AgentStatusReport> {
        self.state.lock().await.registry.get(id).map(AgentRecord::report)
    }

    pub async fn agents(&self) -> Vec<AgentStatusReport> {
        let state = self.state.lock().await;
        let mut reports: Vec<AgentStatusReport> =
            state.registry.records().map(AgentRecord::report).collect();
        reports.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        reports
    }

    /// Scheduler's view of an agent's lifecycle
    pub async fn agent_state(&self, id: &AgentId) -> Option<AgentState> {
        self.state.lock().await.scheduler.state(id)
    }

    pub async fn is_registered(&self, id: &AgentId) -> bool {
        self.state.lock().await.is_known(id)
    }

    /// Fails with `NoSubscribers` when routing `name` now would fail
    pub async fn check_routable(&self, name: &str) -> Result<()> {
        let state = self.state.lock().await;
        if state.registry.subscriptions().subscribers(name).is_some() {
            return Ok(());
        }
        match self.config.no_subscribers {
            NoSubscribersPolicy::Error => Err(BusError::NoSubscribers(name.to_string())),
            NoSubscribersPolicy::Ignore => Ok(()),
        }
    }

    pub async fn pending_join_rounds(&self, id: &AgentId) -> usize {
        self.state
            .lock()
            .await
            .scheduler
            .join(id)
            .map_or(0, JoinQueue::pending_rounds)
    }

    /// Answer one registration-channel request
    pub async fn handle_request(&self, request: RegistrationRequest) -> RegistrationResponse {
        let action = request.action();
        let response = match request {
            RegistrationRequest::Register {
                name,
                address,
                subscriptions,
            } => match self.register(&name, &address, subscriptions).await {
                Ok(id) => RegistrationResponse::registered(id),
                Err(e) => RegistrationResponse::failed(e.to_string()),
            },
            RegistrationRequest::Heartbeat { agent_id } => match self.heartbeat(&agent_id).await {
                Ok(()) => RegistrationResponse::success(),
                Err(e) => RegistrationResponse::failed(e.to_string()),
            },
            RegistrationRequest::Unregister { agent_id } => {
                match self.unregister(&agent_id).await {
                    Ok(()) => RegistrationResponse::success(),
                    Err(e) => RegistrationResponse::failed(e.to_string()),
                }
            }
            RegistrationRequest::Status { agent_id } => {
                match self.get_agent_status(&agent_id).await {
                    Some(report) => RegistrationResponse::status_report(report),
                    None => RegistrationResponse::failed("Agent not found"),
                }
            }
            RegistrationRequest::Routable { name } => match self.check_routable(&name).await {
                Ok(()) => RegistrationResponse::success(),
                Err(e) => RegistrationResponse::failed(e.to_string()),
            },
        };
        if !response.is_success() {
            tracing::debug!(action, error = ?response.error, "Registration request failed");
        }
        response
    }
}
