//! Registry of validated machine definitions, shared by an engine.

use std::sync::Arc;

use dashmap::DashMap;
use flowstate_types::machine::MachineConfig;

use super::definition::{validate_config, ConfigError};

/// Concurrent map of machine name to immutable definition.
///
/// Cloning the registry shares the underlying map. Definitions are stored
/// behind `Arc` so running executions keep the version they started with
/// even if the name is re-registered.
#[derive(Clone, Default)]
pub struct MachineRegistry {
    machines: Arc<DashMap<String, Arc<MachineConfig>>>,
}

impl MachineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a definition under its own name.
    pub fn register(&self, config: MachineConfig) -> Result<Arc<MachineConfig>, ConfigError> {
        validate_config(&config)?;
        let config = Arc::new(config);
        if self
            .machines
            .insert(config.name.clone(), Arc::clone(&config))
            .is_some()
        {
            tracing::debug!(machine = config.name.as_str(), "replaced machine definition");
        }
        Ok(config)
    }

    pub fn get(&self, name: &str) -> Option<Arc<MachineConfig>> {
        self.machines.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.machines.contains_key(name)
    }

    pub fn remove(&self, name: &str) -> bool {
        self.machines.remove(name).is_some()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.machines.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for MachineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineRegistry")
            .field("machines", &self.names())
            .finish()
    }
}
