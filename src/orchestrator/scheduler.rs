//! Join Scheduler - flat input joins and execution-graph cascades
//!
//! Two separate mechanics live here:
//! - `JoinQueue` buffers partial input sets for one agent, one round per
//!   invocation, and releases a round once every required name is filled.
//! - `ExecutionGraph` + `Scheduler::notify` fire a child agent once all of its
//!   parents have reached SUCCESS, passing the parents' results in order.

use crate::core::{AgentId, AgentState, Notification};
use crate::error::{BusError, Result};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone)]
struct JoinRound {
    slots: Vec<Option<Value>>,
}

impl JoinRound {
    fn new(width: usize) -> Self {
        Self {
            slots: vec![None; width],
        }
    }

    fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }
}

/// Outstanding join rounds of one agent
#[derive(Debug, Clone)]
pub struct JoinQueue {
    requires: Vec<String>,
    rounds: VecDeque<JoinRound>,
}

impl JoinQueue {
    pub fn new(requires: Vec<String>) -> Self {
        Self {
            requires,
            rounds: VecDeque::new(),
        }
    }

    pub fn requires(&self) -> &[String] {
        &self.requires
    }

    pub fn pending_rounds(&self) -> usize {
        self.rounds.len()
    }

    /// Offer one input. Returns the collected values, in declared order, when
    /// this input completes a round.
    ///
    /// The value goes into the oldest round still waiting on `name`; a name
    /// already filled in every open round opens a new round instead of
    /// overwriting. This deliberately differs from checking only the oldest
    /// round, which would misplace values once three or more names interleave.
    pub fn offer(&mut self, agent: &AgentId, name: &str, data: Value) -> Result<Option<Vec<Value>>> {
        let slot = self
            .requires
            .iter()
            .position(|required| required == name)
            .ok_or_else(|| BusError::UndeclaredInput {
                agent: agent.clone(),
                name: name.to_string(),
            })?;

        let index = match self.rounds.iter().position(|round| round.slots[slot].is_none()) {
            Some(index) => index,
            None => {
                self.rounds.push_back(JoinRound::new(self.requires.len()));
                self.rounds.len() - 1
            }
        };
        self.rounds[index].slots[slot] = Some(data);

        if !self.rounds[index].is_complete() {
            return Ok(None);
        }
        Ok(self
            .rounds
            .remove(index)
            .map(|round| round.slots.into_iter().flatten().collect()))
    }
}

/// One node of the execution graph
#[derive(Debug, Clone)]
pub struct ExecutionGraphNode {
    pub id: AgentId,
    pub children: Vec<AgentId>,
    pub parents: Vec<AgentId>,
}

impl ExecutionGraphNode {
    fn new(id: AgentId) -> Self {
        Self {
            id,
            children: Vec::new(),
            parents: Vec::new(),
        }
    }
}

/// Acyclic parent -> child dependencies between agents
#[derive(Debug, Default)]
pub struct ExecutionGraph {
    nodes: HashMap<AgentId, ExecutionGraphNode>,
}

impl ExecutionGraph {
    pub fn add_edge(&mut self, parent: &AgentId, child: &AgentId) -> Result<()> {
        if parent == child || self.reaches(child, parent) {
            return Err(BusError::CycleDetected {
                parent: parent.clone(),
                child: child.clone(),
            });
        }

        let parent_node = self
            .nodes
            .entry(parent.clone())
            .or_insert_with(|| ExecutionGraphNode::new(parent.clone()));
        if !parent_node.children.contains(child) {
            parent_node.children.push(child.clone());
        }

        let child_node = self
            .nodes
            .entry(child.clone())
            .or_insert_with(|| ExecutionGraphNode::new(child.clone()));
        if !child_node.parents.contains(parent) {
            child_node.parents.push(parent.clone());
        }
        Ok(())
    }

    /// Depth-first search along child edges
    fn reaches(&self, from: &AgentId, to: &AgentId) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(current) {
                stack.extend(node.children.iter());
            }
        }
        false
    }

    pub fn remove_node(&mut self, id: &AgentId) {
        if let Some(node) = self.nodes.remove(id) {
            for parent in &node.parents {
                if let Some(p) = self.nodes.get_mut(parent) {
                    p.children.retain(|c| c != id);
                }
            }
            for child in &node.children {
                if let Some(c) = self.nodes.get_mut(child) {
                    c.parents.retain(|p| p != id);
                }
            }
        }
    }

    pub fn node(&self, id: &AgentId) -> Option<&ExecutionGraphNode> {
        self.nodes.get(id)
    }

    pub fn children(&self, id: &AgentId) -> &[AgentId] {
        self.nodes.get(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    pub fn parents(&self, id: &AgentId) -> &[AgentId] {
        self.nodes.get(id).map(|n| n.parents.as_slice()).unwrap_or(&[])
    }
}

/// Child ready to run with its parents' results
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyChild {
    pub id: AgentId,
    pub inputs: Vec<Value>,
}

#[derive(Default)]
pub struct Scheduler {
    joins: HashMap<AgentId, JoinQueue>,
    graph: ExecutionGraph,
    states: HashMap<AgentId, AgentState>,
    results: HashMap<AgentId, Value>,
    // child -> parents that succeeded since the child last fired
    armed: HashMap<AgentId, HashSet<AgentId>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, id: &AgentId) {
        self.states.entry(id.clone()).or_insert(AgentState::Initialized);
    }

    pub fn add_join(&mut self, id: &AgentId, requires: Vec<String>) {
        self.joins.insert(id.clone(), JoinQueue::new(requires));
    }

    pub fn offer(&mut self, id: &AgentId, name: &str, data: Value) -> Result<Option<Vec<Value>>> {
        match self.joins.get_mut(id) {
            Some(queue) => queue.offer(id, name, data),
            None => Err(BusError::UndeclaredInput {
                agent: id.clone(),
                name: name.to_string(),
            }),
        }
    }

    pub fn join(&self, id: &AgentId) -> Option<&JoinQueue> {
        self.joins.get(id)
    }

    pub fn add_dependency(&mut self, parent: &AgentId, child: &AgentId) -> Result<()> {
        self.graph.add_edge(parent, child)?;
        self.track(parent);
        self.track(child);
        Ok(())
    }

    pub fn graph(&self) -> &ExecutionGraph {
        &self.graph
    }

    pub fn has_children(&self, id: &AgentId) -> bool {
        !self.graph.children(id).is_empty()
    }

    pub fn state(&self, id: &AgentId) -> Option<AgentState> {
        self.states.get(id).copied()
    }

    pub fn result(&self, id: &AgentId) -> Option<&Value> {
        self.results.get(id)
    }

    pub fn mark_running(&mut self, id: &AgentId) {
        self.states.insert(id.clone(), AgentState::Running);
    }

    /// Record a terminal transition and return the children it makes eligible.
    ///
    /// Only SUCCESS arms children. ERROR disarms the node in every child, so
    /// a failed parent blocks them until it is re-run and succeeds.
    pub fn notify(
        &mut self,
        id: &AgentId,
        notification: Notification,
        result: Option<Value>,
    ) -> Vec<ReadyChild> {
        self.states.insert(id.clone(), notification.into());
        let children = self.graph.children(id).to_vec();

        if notification == Notification::Error {
            self.results.remove(id);
            for child in &children {
                if let Some(armed) = self.armed.get_mut(child) {
                    armed.remove(id);
                }
            }
            return Vec::new();
        }

        self.results.insert(id.clone(), result.unwrap_or(Value::Null));

        let mut ready = Vec::new();
        for child in children {
            self.armed.entry(child.clone()).or_default().insert(id.clone());
            let parents = self.graph.parents(&child);
            let complete = parents.iter().all(|p| {
                self.states.get(p) == Some(&AgentState::Success)
                    && self.armed.get(&child).map_or(false, |a| a.contains(p))
            });
            if !complete {
                continue;
            }
            let inputs = parents
                .iter()
                .map(|p| self.results.get(p).cloned().unwrap_or(Value::Null))
                .collect();
            self.armed.remove(&child);
            ready.push(ReadyChild { id: child, inputs });
        }
        ready
    }

    pub fn forget(&mut self, id: &AgentId) {
        self.joins.remove(id);
        self.graph.remove_node(id);
        self.states.remove(id);
        self.results.remove(id);
        self.armed.remove(id);
        for armed in self.armed.values_mut() {
            armed.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(name: &str) -> AgentId {
        AgentId::derive(name, None)
    }

    fn queue(names: &[&str]) -> JoinQueue {
        JoinQueue::new(names.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_join_fires_once_in_declared_order() {
        let agent = id("joiner");
        let mut q = queue(&["a", "b"]);

        assert_eq!(q.offer(&agent, "a", json!("A")).unwrap(), None);
        let fired = q.offer(&agent, "b", json!("B")).unwrap();
        assert_eq!(fired, Some(vec![json!("A"), json!("B")]));
        assert_eq!(q.pending_rounds(), 0);
    }

    #[test]
    fn test_join_ignores_arrival_order() {
        let agent = id("joiner");
        let mut q = queue(&["a", "b"]);

        assert_eq!(q.offer(&agent, "b", json!(2)).unwrap(), None);
        let fired = q.offer(&agent, "a", json!(1)).unwrap();
        assert_eq!(fired, Some(vec![json!(1), json!(2)]));
    }

    #[test]
    fn test_duplicate_input_opens_new_round() {
        let agent = id("joiner");
        let mut q = queue(&["a", "b"]);

        assert_eq!(q.offer(&agent, "a", json!("a1")).unwrap(), None);
        assert_eq!(q.offer(&agent, "a", json!("a2")).unwrap(), None);
        assert_eq!(q.pending_rounds(), 2);

        let fired = q.offer(&agent, "b", json!("b1")).unwrap();
        assert_eq!(fired, Some(vec![json!("a1"), json!("b1")]));
        // the second `a` is still waiting on `b`
        assert_eq!(q.pending_rounds(), 1);

        let fired = q.offer(&agent, "b", json!("b2")).unwrap();
        assert_eq!(fired, Some(vec![json!("a2"), json!("b2")]));
    }

    #[test]
    fn test_later_round_fills_before_new_one_opens() {
        let agent = id("joiner");
        let mut q = queue(&["a", "b", "c"]);

        q.offer(&agent, "a", json!(1)).unwrap();
        q.offer(&agent, "a", json!(2)).unwrap();
        q.offer(&agent, "c", json!(3)).unwrap();
        q.offer(&agent, "c", json!(4)).unwrap();
        assert_eq!(q.pending_rounds(), 2);

        assert_eq!(
            q.offer(&agent, "b", json!(5)).unwrap(),
            Some(vec![json!(1), json!(5), json!(3)])
        );
        assert_eq!(
            q.offer(&agent, "b", json!(6)).unwrap(),
            Some(vec![json!(2), json!(6), json!(4)])
        );
    }

    #[test]
    fn test_undeclared_input_fails_loudly() {
        let agent = id("joiner");
        let mut q = queue(&["a", "b"]);
        let result = q.offer(&agent, "zzz", json!(null));
        assert!(matches!(result, Err(BusError::UndeclaredInput { .. })));

        let mut scheduler = Scheduler::new();
        assert!(matches!(
            scheduler.offer(&agent, "a", json!(null)),
            Err(BusError::UndeclaredInput { .. })
        ));
    }

    #[test]
    fn test_graph_rejects_cycles() {
        let (a, b, c) = (id("a"), id("b"), id("c"));
        let mut graph = ExecutionGraph::default();
        graph.add_edge(&a, &b).unwrap();
        graph.add_edge(&b, &c).unwrap();

        assert!(matches!(
            graph.add_edge(&c, &a),
            Err(BusError::CycleDetected { .. })
        ));
        assert!(matches!(
            graph.add_edge(&a, &a),
            Err(BusError::CycleDetected { .. })
        ));
        assert_eq!(graph.children(&a), &[b.clone()]);
        assert_eq!(graph.parents(&c), &[b]);
    }

    #[test]
    fn test_child_waits_for_every_parent() {
        let (p1, p2, c) = (id("p1"), id("p2"), id("c"));
        let mut scheduler = Scheduler::new();
        scheduler.add_dependency(&p1, &c).unwrap();
        scheduler.add_dependency(&p2, &c).unwrap();

        assert!(scheduler
            .notify(&p2, Notification::Success, Some(json!("two")))
            .is_empty());
        let ready = scheduler.notify(&p1, Notification::Success, Some(json!("one")));
        assert_eq!(
            ready,
            vec![ReadyChild {
                id: c.clone(),
                inputs: vec![json!("one"), json!("two")],
            }]
        );
    }

    #[test]
    fn test_failed_parent_blocks_child() {
        let (p1, p2, c) = (id("p1"), id("p2"), id("c"));
        let mut scheduler = Scheduler::new();
        scheduler.add_dependency(&p1, &c).unwrap();
        scheduler.add_dependency(&p2, &c).unwrap();

        assert!(scheduler.notify(&p1, Notification::Error, None).is_empty());
        assert!(scheduler
            .notify(&p2, Notification::Success, Some(json!(2)))
            .is_empty());
        assert_eq!(scheduler.state(&p1), Some(AgentState::Error));

        // re-running the failed parent unblocks the child
        scheduler.mark_running(&p1);
        let ready = scheduler.notify(&p1, Notification::Success, Some(json!(1)));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].inputs, vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_child_fires_once_per_parent_completion() {
        let (p1, p2, c) = (id("p1"), id("p2"), id("c"));
        let mut scheduler = Scheduler::new();
        scheduler.add_dependency(&p1, &c).unwrap();
        scheduler.add_dependency(&p2, &c).unwrap();

        scheduler.notify(&p1, Notification::Success, Some(json!(1)));
        assert_eq!(
            scheduler
                .notify(&p2, Notification::Success, Some(json!(2)))
                .len(),
            1
        );

        // only one parent re-succeeds: not a full completion yet
        scheduler.mark_running(&p1);
        assert!(scheduler
            .notify(&p1, Notification::Success, Some(json!(10)))
            .is_empty());

        scheduler.mark_running(&p2);
        let ready = scheduler.notify(&p2, Notification::Success, Some(json!(20)));
        assert_eq!(ready[0].inputs, vec![json!(10), json!(20)]);
    }

    #[test]
    fn test_forget_drops_node() {
        let (p, c) = (id("p"), id("c"));
        let mut scheduler = Scheduler::new();
        scheduler.add_dependency(&p, &c).unwrap();
        scheduler.forget(&c);

        assert!(!scheduler.has_children(&p));
        assert!(scheduler
            .notify(&p, Notification::Success, Some(json!(1)))
            .is_empty());
        assert_eq!(scheduler.result(&p), Some(&json!(1)));
    }
}
