//! In-memory registry of connected agents.
//!
//! Agents are keyed by the name they present on their uplink. Names are
//! unique: a second registration under a live name fails without disturbing
//! the incumbent. The registry is process-local; a restart loses all state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{info, warn};

use crate::Agent;

/// Registry operation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registration failed because agent name {0} already exists")]
    AlreadyRegistered(String),

    #[error("agent with name {0} not found")]
    NotFound(String),
}

/// Name-keyed map of live agents, safe under concurrent registration churn.
///
/// Every operation takes the single mutex, so reads observe a consistent
/// snapshot and concurrent registrations of one name have exactly one winner.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: Mutex<HashMap<String, Arc<Agent>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new agent under its name.
    pub fn register(&self, agent: Arc<Agent>) -> Result<(), RegistryError> {
        let mut agents = self.agents.lock().unwrap();
        if agents.contains_key(&agent.name) {
            warn!(name = %agent.name, "rejected duplicate agent registration");
            return Err(RegistryError::AlreadyRegistered(agent.name.clone()));
        }
        info!(name = %agent.name, "registered agent");
        agents.insert(agent.name.clone(), agent);
        Ok(())
    }

    /// Remove the agent registered under `name`. Absence is reported as
    /// [`RegistryError::NotFound`]; callers cleaning up after a failed
    /// registration tolerate it.
    pub fn unregister(&self, name: &str) -> Result<(), RegistryError> {
        let mut agents = self.agents.lock().unwrap();
        match agents.remove(name) {
            Some(_) => {
                info!(name = %name, "unregistered agent");
                Ok(())
            }
            None => Err(RegistryError::NotFound(name.to_string())),
        }
    }

    /// Look up a live agent by name.
    pub fn get(&self, name: &str) -> Result<Arc<Agent>, RegistryError> {
        let agents = self.agents.lock().unwrap();
        agents
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Point-in-time snapshot of all registered agents. Order unspecified.
    pub fn list(&self) -> Vec<Arc<Agent>> {
        let agents = self.agents.lock().unwrap();
        agents.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        let agents = self.agents.lock().unwrap();
        agents.len()
    }
}
