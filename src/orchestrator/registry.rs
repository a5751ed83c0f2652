//! Agent Registry - registration, heartbeat freshness and the subscription index
//!
//! Information Hiding:
//! - Record storage and subscription indexing hidden behind one type
//! - Duplicate-registration policy applied internally
//! - Liveness sweep exposed as a pure function of "now"

use crate::config::DuplicatePolicy;
use crate::core::{AgentId, AgentStatus, AgentStatusReport};
use crate::error::{BusError, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap};

/// Orchestrator-side view of a remote agent
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub name: String,
    pub id: AgentId,
    pub address: String,
    pub subscriptions: BTreeSet<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: AgentStatus,
}

impl AgentRecord {
    pub fn report(&self) -> AgentStatusReport {
        AgentStatusReport {
            name: self.name.clone(),
            id: self.id.clone(),
            address: self.address.clone(),
            status: self.status,
            subscriptions: self.subscriptions.iter().cloned().collect(),
            last_heartbeat: self.last_heartbeat,
        }
    }
}

/// message name -> identities that declared it as an ingress contract
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    entries: HashMap<String, BTreeSet<AgentId>>,
}

impl SubscriptionTable {
    pub fn subscribe<'a>(&mut self, agent_id: &AgentId, names: impl IntoIterator<Item = &'a String>) {
        for name in names {
            self.entries
                .entry(name.clone())
                .or_default()
                .insert(agent_id.clone());
        }
    }

    /// Drop the agent from every entry, removing entries left empty
    pub fn unsubscribe<'a>(&mut self, agent_id: &AgentId, names: impl IntoIterator<Item = &'a String>) {
        for name in names {
            if let Some(set) = self.entries.get_mut(name) {
                set.remove(agent_id);
                if set.is_empty() {
                    self.entries.remove(name);
                }
            }
        }
    }

    pub fn subscribers(&self, name: &str) -> Option<&BTreeSet<AgentId>> {
        self.entries.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Remote agent records plus the subscription index shared with in-process agents
pub struct AgentRegistry {
    records: HashMap<AgentId, AgentRecord>,
    subscriptions: SubscriptionTable,
    policy: DuplicatePolicy,
}

impl AgentRegistry {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            records: HashMap::new(),
            subscriptions: SubscriptionTable::default(),
            policy,
        }
    }

    pub fn register(
        &mut self,
        name: &str,
        address: &str,
        subscriptions: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<AgentId> {
        let id = AgentId::derive(name, Some(address));

        if let Some(existing) = self.records.get(&id) {
            if existing.status == AgentStatus::Active && self.policy == DuplicatePolicy::Reject {
                return Err(BusError::DuplicateRegistration {
                    name: name.to_string(),
                    address: address.to_string(),
                });
            }
        }
        if let Some(old) = self.records.remove(&id) {
            tracing::debug!(agent_id = %id.short(), "Replacing existing registration");
            self.subscriptions.unsubscribe(&id, &old.subscriptions);
        }

        let subscriptions: BTreeSet<String> = subscriptions.into_iter().collect();
        self.subscriptions.subscribe(&id, &subscriptions);
        self.records.insert(
            id.clone(),
            AgentRecord {
                name: name.to_string(),
                id: id.clone(),
                address: address.to_string(),
                subscriptions,
                last_heartbeat: now,
                status: AgentStatus::Active,
            },
        );
        Ok(id)
    }

    pub fn heartbeat(&mut self, id: &AgentId, now: DateTime<Utc>) -> Result<()> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| BusError::UnknownAgent(id.clone()))?;
        record.last_heartbeat = now;
        if record.status == AgentStatus::Inactive {
            tracing::info!(agent = %record.name, "Agent is alive again");
            record.status = AgentStatus::Active;
        }
        Ok(())
    }

    pub fn unregister(&mut self, id: &AgentId) -> Result<AgentRecord> {
        let record = self
            .records
            .remove(id)
            .ok_or_else(|| BusError::UnknownAgent(id.clone()))?;
        self.subscriptions.unsubscribe(id, &record.subscriptions);
        Ok(record)
    }

    /// Flip every active record older than `timeout` to inactive.
    /// Returns the identities that changed.
    pub fn check_liveness(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<AgentId> {
        let mut flipped = Vec::new();
        for record in self.records.values_mut() {
            if record.status == AgentStatus::Active && now - record.last_heartbeat > timeout {
                record.status = AgentStatus::Inactive;
                flipped.push(record.id.clone());
            }
        }
        flipped.sort();
        flipped
    }

    pub fn get(&self, id: &AgentId) -> Option<&AgentRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.records.contains_key(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &AgentRecord> {
        self.records.values()
    }

    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    pub fn subscriptions_mut(&mut self) -> &mut SubscriptionTable {
        &mut self.subscriptions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_register_indexes_subscriptions() {
        let mut registry = AgentRegistry::new(DuplicatePolicy::Refresh);
        let now = Utc::now();
        let id = registry
            .register("test_agent", "localhost:5555", names(&["test_message"]), now)
            .unwrap();

        let record = registry.get(&id).unwrap();
        assert_eq!(record.name, "test_agent");
        assert_eq!(record.status, AgentStatus::Active);
        assert_eq!(record.last_heartbeat, now);
        assert!(registry
            .subscriptions()
            .subscribers("test_message")
            .unwrap()
            .contains(&id));
    }

    #[test]
    fn test_duplicate_registration_policies() {
        let now = Utc::now();
        let mut strict = AgentRegistry::new(DuplicatePolicy::Reject);
        strict.register("a", "h:1", names(&["x"]), now).unwrap();
        assert!(matches!(
            strict.register("a", "h:1", names(&["x"]), now),
            Err(BusError::DuplicateRegistration { .. })
        ));

        let mut lenient = AgentRegistry::new(DuplicatePolicy::Refresh);
        let first = lenient.register("a", "h:1", names(&["x"]), now).unwrap();
        let second = lenient.register("a", "h:1", names(&["y"]), now).unwrap();
        assert_eq!(first, second);
        assert!(lenient.subscriptions().subscribers("x").is_none());
        assert!(lenient.subscriptions().subscribers("y").is_some());
    }

    #[test]
    fn test_inactive_record_can_be_replaced_under_reject() {
        let now = Utc::now();
        let mut registry = AgentRegistry::new(DuplicatePolicy::Reject);
        let id = registry.register("a", "h:1", names(&["x"]), now).unwrap();
        registry.check_liveness(now + Duration::seconds(31), Duration::seconds(30));
        assert_eq!(registry.get(&id).unwrap().status, AgentStatus::Inactive);

        let again = registry
            .register("a", "h:1", names(&["x"]), now + Duration::seconds(32))
            .unwrap();
        assert_eq!(registry.get(&again).unwrap().status, AgentStatus::Active);
    }

    #[test]
    fn test_heartbeat_unknown_agent() {
        let mut registry = AgentRegistry::new(DuplicatePolicy::Refresh);
        let result = registry.heartbeat(&AgentId::from("nope"), Utc::now());
        assert!(matches!(result, Err(BusError::UnknownAgent(_))));
    }

    #[test]
    fn test_unregister_is_repeatable() {
        let now = Utc::now();
        let mut registry = AgentRegistry::new(DuplicatePolicy::Refresh);
        let gone = registry.register("a", "h:1", names(&["x"]), now).unwrap();
        let kept = registry.register("b", "h:2", names(&["x"]), now).unwrap();

        assert!(registry.unregister(&gone).is_ok());
        assert!(matches!(
            registry.unregister(&gone),
            Err(BusError::UnknownAgent(_))
        ));
        assert!(registry.contains(&kept));
        let subscribers = registry.subscriptions().subscribers("x").unwrap();
        assert_eq!(subscribers.len(), 1);
        assert!(subscribers.contains(&kept));
    }

    #[test]
    fn test_liveness_timeout_boundary() {
        let start = Utc::now();
        let timeout = Duration::seconds(30);
        let mut registry = AgentRegistry::new(DuplicatePolicy::Refresh);
        let id = registry.register("a", "h:1", vec![], start).unwrap();

        assert!(registry
            .check_liveness(start + Duration::seconds(30), timeout)
            .is_empty());
        assert_eq!(registry.get(&id).unwrap().status, AgentStatus::Active);

        let flipped = registry.check_liveness(start + Duration::seconds(31), timeout);
        assert_eq!(flipped, vec![id.clone()]);
        assert_eq!(registry.get(&id).unwrap().status, AgentStatus::Inactive);

        // stays registered, and a heartbeat revives it
        registry
            .heartbeat(&id, start + Duration::seconds(40))
            .unwrap();
        assert_eq!(registry.get(&id).unwrap().status, AgentStatus::Active);
    }
}
