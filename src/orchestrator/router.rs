//! Message Router - subscription fan-out, local invocation and graph cascades
//!
//! Information Hiding:
//! - Deliveries are planned under the state lock, then executed without it
//! - Remote sends run concurrently; local handlers run in arrival order
//! - Emitted results and ready children are drained from one work queue

use super::{BusState, ExecutionMode, Handler, Orchestrator};
use crate::config::NoSubscribersPolicy;
use crate::core::{AgentId, AgentStatus, Frame, Message, Notification};
use crate::error::{describe_panic, BusError, Result};
use futures::future::join_all;
use serde_json::Value;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Outcome of routing one message, including everything it cascaded into
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouteReport {
    /// Frames handed to remote agents' data channels
    pub forwarded: usize,
    /// Local handler calls that succeeded
    pub invoked: usize,
    /// Local handler calls that failed or panicked
    pub failed: usize,
    /// Inputs parked in a join round that is not complete yet
    pub buffered: usize,
}

struct Invocation {
    agent_id: AgentId,
    agent_name: String,
    handler: Handler,
    inputs: Vec<Value>,
    emits: Vec<String>,
}

enum Delivery {
    Remote { agent_id: AgentId, frame: Frame },
    Invoke(Invocation),
    Buffered,
}

impl BusState {
    fn invocation(
        &self,
        id: &AgentId,
        message_name: Option<&str>,
        inputs: Vec<Value>,
    ) -> Option<Invocation> {
        let agent = self.local_agents.get(id)?;
        let handler = agent.handler_for(message_name)?;
        Some(Invocation {
            agent_id: id.clone(),
            agent_name: agent.name().to_string(),
            handler,
            inputs,
            emits: agent.emitted().to_vec(),
        })
    }

    /// Resolve subscribers of `message` into deliveries
    fn plan_route(&mut self, message: &Message, policy: NoSubscribersPolicy) -> Result<Vec<Delivery>> {
        let subscribers: Vec<AgentId> = match self.registry.subscriptions().subscribers(&message.name) {
            Some(ids) => ids.iter().cloned().collect(),
            None => {
                return match policy {
                    NoSubscribersPolicy::Error => Err(BusError::NoSubscribers(message.name.clone())),
                    NoSubscribersPolicy::Ignore => {
                        tracing::debug!(message = %message.name, "No subscribers, dropping");
                        Ok(Vec::new())
                    }
                }
            }
        };

        let frame = Frame::from_message(message)?;
        let mut deliveries = Vec::with_capacity(subscribers.len());
        for id in subscribers {
            let mode = self.local_agents.get(&id).map(|agent| agent.mode());
            match mode {
                Some(ExecutionMode::Independent) => {
                    let inputs = vec![message.data.clone()];
                    if let Some(invocation) = self.invocation(&id, Some(&message.name), inputs) {
                        deliveries.push(Delivery::Invoke(invocation));
                    }
                }
                Some(ExecutionMode::Join) => {
                    match self.scheduler.offer(&id, &message.name, message.data.clone())? {
                        Some(inputs) => {
                            if let Some(invocation) = self.invocation(&id, None, inputs) {
                                deliveries.push(Delivery::Invoke(invocation));
                            }
                        }
                        None => deliveries.push(Delivery::Buffered),
                    }
                }
                Some(ExecutionMode::Graph) => {
                    tracing::warn!(agent_id = %id.short(), "Graph agent holds a subscription, skipping");
                }
                None if self.registry.contains(&id) => deliveries.push(Delivery::Remote {
                    agent_id: id,
                    frame: frame.clone(),
                }),
                None => tracing::warn!(agent_id = %id.short(), "Stale subscription entry"),
            }
        }
        Ok(deliveries)
    }
}

impl Orchestrator {
    /// Deliver `message` to every subscriber and run whatever it triggers.
    ///
    /// Only a missing subscriber for `message` itself is an error; misses on
    /// emitted results are logged and dropped.
    pub async fn route(&self, message: Message) -> Result<RouteReport> {
        tracing::debug!(
            message = %message.name,
            origin = ?message.origin_name,
            "Routing message"
        );
        let deliveries = {
            let mut state = self.state.lock().await;
            state.plan_route(&message, self.config.no_subscribers)?
        };

        let mut report = RouteReport::default();
        let invocations = self.deliver(deliveries, &mut report).await;
        self.drive(invocations, &mut report).await;
        Ok(report)
    }

    /// Send `message` to every ACTIVE remote subscriber. Returns the number
    /// of agents the frame reached.
    pub async fn broadcast(&self, message: Message) -> Result<usize> {
        let targets: Vec<AgentId> = {
            let state = self.state.lock().await;
            match state.registry.subscriptions().subscribers(&message.name) {
                Some(ids) => ids
                    .iter()
                    .filter(|id| {
                        state
                            .registry
                            .get(id)
                            .map_or(false, |record| record.status == AgentStatus::Active)
                    })
                    .cloned()
                    .collect(),
                None => {
                    return match self.config.no_subscribers {
                        NoSubscribersPolicy::Error => Err(BusError::NoSubscribers(message.name)),
                        NoSubscribersPolicy::Ignore => Ok(0),
                    }
                }
            }
        };

        let frame = Frame::from_message(&message)?;
        let sends = targets.iter().map(|id| self.sink.send_to(id, frame.clone()));
        let mut delivered = 0;
        for (id, outcome) in targets.iter().zip(join_all(sends).await) {
            match outcome {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(agent_id = %id.short(), error = %e, "Broadcast delivery failed"),
            }
        }
        tracing::debug!(message = %message.name, delivered, "Broadcast complete");
        Ok(delivered)
    }

    /// Record a terminal notification for `id` and run every child it releases
    pub async fn notify(
        &self,
        id: &AgentId,
        notification: Notification,
        result: Option<Value>,
    ) -> Result<RouteReport> {
        let invocations: VecDeque<Invocation> = {
            let mut state = self.state.lock().await;
            if !state.is_known(id) {
                return Err(BusError::UnknownAgent(id.clone()));
            }
            let ready = state.scheduler.notify(id, notification, result);
            ready
                .into_iter()
                .filter_map(|child| state.invocation(&child.id, None, child.inputs))
                .collect()
        };

        let mut report = RouteReport::default();
        self.drive(invocations, &mut report).await;
        Ok(report)
    }

    /// Entry point for frames read off an agent's data channel
    pub async fn handle_frame(&self, sender: &AgentId, frame: Frame) {
        let message = match frame.to_message() {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(agent_id = %sender.short(), error = %e, "Dropping malformed frame");
                return;
            }
        };

        let is_parent = self.state.lock().await.scheduler.has_children(sender);
        if is_parent {
            if let Err(e) = self
                .notify(sender, Notification::Success, Some(message.data.clone()))
                .await
            {
                tracing::warn!(agent_id = %sender.short(), error = %e, "Graph notification failed");
            }
        }

        let name = message.name.clone();
        match self.route(message).await {
            Ok(report) => tracing::trace!(message = %name, ?report, "Frame routed"),
            Err(e) => tracing::warn!(message = %name, agent_id = %sender.short(), error = %e, "Routing failed"),
        }
    }

    async fn deliver(&self, deliveries: Vec<Delivery>, report: &mut RouteReport) -> VecDeque<Invocation> {
        let mut invocations = VecDeque::new();
        let mut remote = Vec::new();
        for delivery in deliveries {
            match delivery {
                Delivery::Remote { agent_id, frame } => remote.push((agent_id, frame)),
                Delivery::Invoke(invocation) => invocations.push_back(invocation),
                Delivery::Buffered => report.buffered += 1,
            }
        }

        let sends = remote
            .iter()
            .map(|(agent_id, frame)| self.sink.send_to(agent_id, frame.clone()));
        for ((agent_id, _), outcome) in remote.iter().zip(join_all(sends).await) {
            match outcome {
                Ok(()) => report.forwarded += 1,
                Err(e) => tracing::warn!(agent_id = %agent_id.short(), error = %e, "Forward failed"),
            }
        }
        invocations
    }

    /// Run invocations until no ready child or emitted message is left.
    /// Finite because registration rejects in-process emit cycles.
    async fn drive(&self, mut invocations: VecDeque<Invocation>, report: &mut RouteReport) {
        let mut emitted = VecDeque::new();
        loop {
            while let Some(invocation) = invocations.pop_front() {
                let (children, messages) = self.invoke(invocation, report).await;
                invocations.extend(children);
                emitted.extend(messages);
            }

            let Some(message) = emitted.pop_front() else {
                break;
            };
            let planned = {
                let mut state = self.state.lock().await;
                state.plan_route(&message, self.config.no_subscribers)
            };
            match planned {
                Ok(deliveries) => {
                    let next = self.deliver(deliveries, report).await;
                    invocations.extend(next);
                }
                Err(e) => tracing::warn!(message = %message.name, error = %e, "Dropping emitted message"),
            }
        }
    }

    async fn invoke(&self, invocation: Invocation, report: &mut RouteReport) -> (Vec<Invocation>, Vec<Message>) {
        let Invocation {
            agent_id,
            agent_name,
            handler,
            inputs,
            emits,
        } = invocation;

        self.state.lock().await.scheduler.mark_running(&agent_id);
        tracing::debug!(agent = %agent_name, inputs = inputs.len(), "Invoking local agent");
        let outcome = match catch_unwind(AssertUnwindSafe(|| handler(inputs))) {
            Ok(outcome) => outcome,
            Err(panic) => Err(anyhow::anyhow!("panicked: {}", describe_panic(panic.as_ref()))),
        };

        let mut state = self.state.lock().await;
        match outcome {
            Ok(value) => {
                report.invoked += 1;
                let messages = emits
                    .iter()
                    .map(|name| {
                        Message::new(name.clone(), value.clone())
                            .with_origin(agent_name.clone(), agent_id.clone())
                    })
                    .collect();
                let ready = state.scheduler.notify(&agent_id, Notification::Success, Some(value));
                let children = ready
                    .into_iter()
                    .filter_map(|child| state.invocation(&child.id, None, child.inputs))
                    .collect();
                (children, messages)
            }
            Err(e) => {
                report.failed += 1;
                let failure = BusError::HandlerFailure {
                    agent: agent_name,
                    reason: format!("{e:#}"),
                };
                tracing::error!(error = %failure, "Local agent failed");
                state.scheduler.notify(&agent_id, Notification::Error, None);
                (Vec::new(), Vec::new())
            }
        }
    }
}
