//! Machine definition parsing, validation, and filesystem operations.
//!
//! Converts YAML/JSON documents into `MachineConfig`, validates graph
//! constraints (initial state, transition targets, terminal states, binding
//! names), and discovers machine files on disk.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use flowstate_types::machine::{MachineConfig, StateKind, Target};
use thiserror::Error;

/// Scope roots that a foreach binding may not shadow.
const RESERVED_BINDINGS: &[&str] = &["context", "input", "output", "execution"];

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Malformed or inconsistent workflow definition. Always fatal before start.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A state or launch references a machine that is not registered.
    #[error("unknown machine '{0}'")]
    UnknownMachine(String),

    /// A state or branch references an agent that is not registered.
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),

    /// The machine asks for a persistence backend the engine does not run.
    #[error("machine requires backend '{requested}' but the engine uses '{active}'")]
    BackendMismatch { requested: String, active: String },
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `MachineConfig`.
pub fn parse_machine_yaml(yaml: &str) -> Result<MachineConfig, ConfigError> {
    let config: MachineConfig =
        serde_yaml_ng::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Parse a JSON string into a validated `MachineConfig`.
pub fn parse_machine_json(json: &str) -> Result<MachineConfig, ConfigError> {
    let config: MachineConfig =
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Serialize a `MachineConfig` to a YAML string.
pub fn serialize_machine_yaml(config: &MachineConfig) -> Result<String, ConfigError> {
    serde_yaml_ng::to_string(config).map_err(|e| ConfigError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate graph constraints on a `MachineConfig`.
///
/// Checks:
/// - Name is non-empty and contains only alphanumerics, hyphens, underscores
/// - At least one state, and `initial` names one of them
/// - At least one final state
/// - Non-final states declare at least one transition; final states none
/// - Every transition targets an existing state
/// - Parallel states have at least one branch
/// - Foreach bindings are identifiers that do not shadow scope roots
/// - `timeout_secs` and `max_steps` are > 0 when set
pub fn validate_config(config: &MachineConfig) -> Result<(), ConfigError> {
    if config.name.is_empty() {
        return Err(ConfigError::Validation(
            "machine name must not be empty".to_string(),
        ));
    }
    if !config
        .name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ConfigError::Validation(format!(
            "machine name '{}' contains invalid characters (only alphanumerics, '-' and '_' allowed)",
            config.name
        )));
    }

    if config.states.is_empty() {
        return Err(ConfigError::Validation(
            "machine must have at least one state".to_string(),
        ));
    }

    if !config.states.contains(&config.initial) {
        return Err(ConfigError::Validation(format!(
            "initial state '{}' is not defined",
            config.initial
        )));
    }

    if config.final_states().next().is_none() {
        return Err(ConfigError::Validation(
            "machine must have at least one final state".to_string(),
        ));
    }

    if config.max_steps == Some(0) {
        return Err(ConfigError::Validation(
            "max_steps must be > 0".to_string(),
        ));
    }

    for (name, state) in config.states.iter() {
        if state.timeout_secs == Some(0) {
            return Err(ConfigError::Validation(format!(
                "state '{name}': timeout must be > 0"
            )));
        }

        if state.kind.is_final() {
            if !state.transitions.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "final state '{name}' cannot declare transitions"
                )));
            }
        } else if state.transitions.is_empty() {
            return Err(ConfigError::Validation(format!(
                "state '{name}' has no transitions"
            )));
        }

        for transition in &state.transitions {
            if !config.states.contains(&transition.to) {
                return Err(ConfigError::Validation(format!(
                    "state '{name}' transitions to unknown state '{}'",
                    transition.to
                )));
            }
        }

        match &state.kind {
            StateKind::Parallel { branches, .. } if branches.is_empty() => {
                return Err(ConfigError::Validation(format!(
                    "parallel state '{name}' has no branches"
                )));
            }
            StateKind::Foreach { binding, .. } => validate_binding(name, binding)?,
            _ => {}
        }
    }

    Ok(())
}

fn validate_binding(state: &str, binding: &str) -> Result<(), ConfigError> {
    let mut chars = binding.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_');
    if !valid_start || !chars.all(|c| c.is_alphanumeric() || c == '_') {
        return Err(ConfigError::Validation(format!(
            "foreach state '{state}': binding '{binding}' is not an identifier"
        )));
    }
    if RESERVED_BINDINGS.contains(&binding) {
        return Err(ConfigError::Validation(format!(
            "foreach state '{state}': binding '{binding}' shadows a reserved name"
        )));
    }
    Ok(())
}

/// Names of every machine referenced by a config (nested, branch, launch).
pub fn referenced_machines(config: &MachineConfig) -> HashSet<&str> {
    let mut names = HashSet::new();
    for (_, state) in config.states.iter() {
        match &state.kind {
            StateKind::Machine { machine, .. } | StateKind::Launch { machine, .. } => {
                names.insert(machine.as_str());
            }
            StateKind::Parallel { branches, .. } => {
                for branch in branches {
                    if let Target::Machine(m) = &branch.target {
                        names.insert(m.as_str());
                    }
                }
            }
            StateKind::Foreach { branch, .. } => {
                if let Target::Machine(m) = &branch.target {
                    names.insert(m.as_str());
                }
            }
            StateKind::Agent { .. } | StateKind::Final { .. } => {}
        }
    }
    names
}

/// Names of every agent referenced by a config.
pub fn referenced_agents(config: &MachineConfig) -> HashSet<&str> {
    let mut names = HashSet::new();
    for (_, state) in config.states.iter() {
        match &state.kind {
            StateKind::Agent { agent, .. } => {
                names.insert(agent.as_str());
            }
            StateKind::Parallel { branches, .. } => {
                for branch in branches {
                    if let Target::Agent(a) = &branch.target {
                        names.insert(a.as_str());
                    }
                }
            }
            StateKind::Foreach { branch, .. } => {
                if let Target::Agent(a) = &branch.target {
                    names.insert(a.as_str());
                }
            }
            _ => {}
        }
    }
    names
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a machine definition from a `.yaml`, `.yml`, or `.json` file.
pub fn load_machine_file(path: &Path) -> Result<MachineConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_machine_json(&content),
        _ => parse_machine_yaml(&content),
    }
}

/// Save a machine definition as YAML, creating parent directories.
pub fn save_machine_file(path: &Path, config: &MachineConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_machine_yaml(config)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all machine files under `base_dir`, recursively.
///
/// Files that fail to parse are skipped with a warning.
pub fn discover_machines(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, MachineConfig)>, ConfigError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, MachineConfig)>,
) -> Result<(), ConfigError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml" | "json")
        ) {
            match load_machine_file(&path) {
                Ok(config) => results.push((path, config)),
                Err(e) => {
                    tracing::warn!(?path, error = %e, "skipping unparseable machine file");
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
