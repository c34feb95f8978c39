//! Name-keyed registry of agents shared by every execution of an engine.

use std::sync::Arc;

use dashmap::DashMap;

use super::box_agent::BoxAgent;
use super::invoker::AgentInvoker;

/// Concurrent map of agent name to shared, type-erased agent.
///
/// Cloning the registry shares the underlying map.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<DashMap<String, Arc<BoxAgent>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an agent under `name`.
    pub fn register<T: AgentInvoker + 'static>(&self, name: impl Into<String>, agent: T) {
        self.agents.insert(name.into(), Arc::new(BoxAgent::new(agent)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<BoxAgent>> {
        self.agents.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    pub fn remove(&self, name: &str) -> bool {
        self.agents.remove(name).is_some()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.names())
            .finish()
    }
}
