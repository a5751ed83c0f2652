use crate::core::{AgentId, AgentState, Frame, Message};
use crate::error::{BusError, Result};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc::UnboundedSender;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Identity and outbound channel of a running agent.
///
/// Set when registration succeeds, cleared on stop. Emitters hold the
/// context so they can be created before the agent starts.
#[derive(Debug)]
pub struct AgentContext {
    name: String,
    identity: RwLock<Option<AgentId>>,
    outbound: RwLock<Option<UnboundedSender<Frame>>>,
    state: RwLock<AgentState>,
}

impl AgentContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identity: RwLock::new(None),
            outbound: RwLock::new(None),
            state: RwLock::new(AgentState::Initialized),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn agent_id(&self) -> Result<AgentId> {
        read(&self.identity)
            .clone()
            .ok_or(BusError::AgentContextUnset)
    }

    pub fn is_set(&self) -> bool {
        read(&self.identity).is_some()
    }

    pub fn state(&self) -> AgentState {
        *read(&self.state)
    }

    pub(crate) fn set_state(&self, state: AgentState) {
        *write(&self.state) = state;
    }

    pub(crate) fn attach(&self, agent_id: AgentId, outbound: UnboundedSender<Frame>) {
        *write(&self.identity) = Some(agent_id);
        *write(&self.outbound) = Some(outbound);
    }

    /// Drop identity and outbound sender; the data channel drains and closes
    pub(crate) fn detach(&self) {
        write(&self.outbound).take();
        write(&self.identity).take();
    }

    /// Stamp `message` with this agent as origin and queue it for the orchestrator
    pub fn send(&self, message: Message) -> Result<()> {
        let agent_id = self.agent_id()?;
        let frame = Frame::from_message(&message.with_origin(self.name.clone(), agent_id))?;
        let outbound = read(&self.outbound);
        let sender = outbound.as_ref().ok_or(BusError::AgentContextUnset)?;
        sender
            .send(frame)
            .map_err(|_| BusError::Transport("data channel closed".to_string()))
    }
}
