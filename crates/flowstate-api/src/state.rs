//! Application state: the engine pinned to the SQLite backend, with the
//! built-in agents and every machine found under `<data_dir>/machines`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use flowstate_core::agent::EchoAgent;
use flowstate_core::engine::Engine;
use flowstate_core::lifecycle::ExecutionManager;
use flowstate_core::machine::definition::{discover_machines, save_machine_file};
use flowstate_infra::config::{load_engine_settings, machines_dir, resolve_data_dir};
use flowstate_infra::sqlite::SqliteBackend;
use flowstate_infra::sqlite::pool::database_url;
use flowstate_types::config::RetryPolicy;
use flowstate_types::machine::MachineConfig;

pub type ConcreteEngine = Engine<SqliteBackend>;

#[derive(Clone)]
pub struct AppState {
    pub engine: ConcreteEngine,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Open the state under the resolved data directory.
    pub async fn init() -> anyhow::Result<Self> {
        Self::open(resolve_data_dir()).await
    }

    pub async fn open(data_dir: PathBuf) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;

        let settings = load_engine_settings(&data_dir).await;
        let db_url = format!("{}?mode=rwc", database_url(&data_dir));
        let backend = SqliteBackend::connect(&db_url)
            .await
            .with_context(|| format!("opening {db_url}"))?;

        let engine = Engine::new(Arc::new(backend), settings);
        engine.agents().register("echo", EchoAgent);

        let dir = machines_dir(&data_dir);
        for (path, config) in discover_machines(&dir)? {
            match engine.register_machine(config) {
                Ok(config) => {
                    tracing::debug!(machine = config.name.as_str(), path = %path.display(), "registered machine");
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping invalid machine");
                }
            }
        }

        Ok(Self { engine, data_dir })
    }

    /// Manager using the configured retry policy, optionally capped at
    /// `max_attempts`.
    pub fn manager(&self, max_attempts: Option<u32>) -> ExecutionManager<SqliteBackend> {
        let mut policy: RetryPolicy = self.engine.settings().retry.clone();
        if let Some(max) = max_attempts {
            policy = policy.with_max_attempts(max);
        }
        ExecutionManager::new(self.engine.clone(), policy)
    }

    /// Register a definition and keep a copy under `machines/` so later
    /// processes can resume its executions.
    pub fn adopt_machine(&self, config: MachineConfig) -> anyhow::Result<Arc<MachineConfig>> {
        let known = self.engine.machines().get(&config.name);
        let registered = self.engine.register_machine(config)?;
        if known.as_deref() != Some(&*registered) {
            let path = machine_path(&self.data_dir, &registered.name);
            save_machine_file(&path, &registered)?;
            tracing::debug!(path = %path.display(), "stored machine definition");
        }
        Ok(registered)
    }
}

fn machine_path(data_dir: &Path, name: &str) -> PathBuf {
    machines_dir(data_dir).join(format!("{name}.yaml"))
}
