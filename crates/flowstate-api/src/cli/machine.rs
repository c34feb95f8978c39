//! `flowstate validate`: static checks on a machine definition.

use std::path::Path;

use anyhow::Result;
use console::style;
use serde_json::json;

use flowstate_core::machine::definition::{
    load_machine_file, referenced_agents, referenced_machines, validate_config,
};
use flowstate_types::machine::MachineConfig;

use crate::state::AppState;

/// References a definition makes that this process cannot resolve.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Unresolved {
    pub agents: Vec<String>,
    pub machines: Vec<String>,
}

impl Unresolved {
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty() && self.machines.is_empty()
    }
}

fn unresolved(state: &AppState, config: &MachineConfig) -> Unresolved {
    let mut agents: Vec<String> = referenced_agents(config)
        .into_iter()
        .filter(|name| !state.engine.agents().contains(name))
        .map(str::to_string)
        .collect();
    let mut machines: Vec<String> = referenced_machines(config)
        .into_iter()
        .filter(|name| *name != config.name && !state.engine.machines().contains(name))
        .map(str::to_string)
        .collect();
    agents.sort();
    machines.sort();
    Unresolved { agents, machines }
}

/// Returns `true` when the definition is valid and every reference resolves.
pub fn validate(state: &AppState, file: &Path, json: bool) -> Result<bool> {
    let config = match load_machine_file(file).and_then(|c| validate_config(&c).map(|()| c)) {
        Ok(config) => config,
        Err(e) => {
            if json {
                println!("{}", json!({ "valid": false, "error": e.to_string() }));
            } else {
                println!("  {} {}: {}", style("✗").red().bold(), file.display(), e);
            }
            return Ok(false);
        }
    };
    let missing = unresolved(state, &config);

    if json {
        let payload = json!({
            "valid": true,
            "machine": config.name,
            "states": config.states.names().collect::<Vec<_>>(),
            "unresolved_agents": missing.agents,
            "unresolved_machines": missing.machines,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(missing.is_empty());
    }

    println!(
        "  {} {} is valid ({} states, initial '{}')",
        style("✓").green().bold(),
        style(&config.name).cyan().bold(),
        config.states.len(),
        config.initial
    );
    for agent in &missing.agents {
        println!("  {} agent '{}' is not registered", style("!").yellow().bold(), agent);
    }
    for machine in &missing.machines {
        println!(
            "  {} machine '{}' is not in {}",
            style("!").yellow().bold(),
            machine,
            style(state.data_dir.join("machines").display()).dim()
        );
    }
    Ok(missing.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowstate_core::machine::definition::parse_machine_yaml;

    #[tokio::test]
    async fn reports_unknown_references() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::open(dir.path().to_path_buf()).await.unwrap();
        let config = parse_machine_yaml(
            r#"
name: fanout
initial: split
states:
  split:
    parallel:
      - agent: echo
      - agent: summarize
      - machine: reviewer
    transitions:
      - to: again
  again:
    machine: fanout
    transitions:
      - to: done
  done:
    final: true
"#,
        )
        .unwrap();

        let missing = unresolved(&state, &config);
        assert_eq!(missing.agents, vec!["summarize".to_string()]);
        assert_eq!(missing.machines, vec!["reviewer".to_string()]);
    }

    #[tokio::test]
    async fn invalid_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bad.yaml");
        std::fs::write(&file, "name: bad\ninitial: nowhere\nstates:\n  done:\n    final: true\n").unwrap();
        let state = AppState::open(dir.path().join("data")).await.unwrap();

        assert!(!validate(&state, &file, true).unwrap());
    }
}
