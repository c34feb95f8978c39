//! Machine definition types for Flowstate.
//!
//! A `MachineConfig` is the parsed, immutable description of one workflow:
//! a document-ordered table of named states, the initial state, and optional
//! context initialisers. Each `StateDef` carries exactly one `StateKind`.
//!
//! State documents are deserialized through a flat raw shape (`agent:`,
//! `machine:`, `parallel:`, `foreach:`, `launch:`, `final:`) and converted to
//! the closed `StateKind` variant so that malformed combinations are rejected
//! at parse time.

use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Expression mapping: string leaves are expressions, other leaves are literals.
pub type Mapping = Map<String, Value>;

/// Default per-item binding name for `foreach` states.
pub const DEFAULT_FOREACH_BINDING: &str = "item";

// ---------------------------------------------------------------------------
// MachineConfig
// ---------------------------------------------------------------------------

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MachineConfig {
    /// Machine name, unique within a registry.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Name of the state execution starts in.
    pub initial: String,
    /// Context initialisers evaluated over `{input}` after the input is copied in.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Mapping,
    /// Maximum number of transitions before the run fails (engine default when unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    pub states: StateTable,
}

impl MachineConfig {
    /// Look up a state by name.
    pub fn state(&self, name: &str) -> Option<&StateDef> {
        self.states.get(name)
    }

    /// Names of all `final` states in document order.
    pub fn final_states(&self) -> impl Iterator<Item = &str> {
        self.states
            .iter()
            .filter(|(_, def)| def.kind.is_final())
            .map(|(name, _)| name)
    }
}

/// Checkpoint persistence settings for a machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Backend the machine expects (`memory`, `sqlite`). Unset accepts any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
}

// ---------------------------------------------------------------------------
// StateTable
// ---------------------------------------------------------------------------

/// Ordered mapping of state name to definition.
///
/// Preserves document order and rejects duplicate names on deserialization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateTable(Vec<(String, StateDef)>);

impl StateTable {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Insert or replace a state. Returns the previous definition, if any.
    pub fn insert(&mut self, name: impl Into<String>, def: StateDef) -> Option<StateDef> {
        let name = name.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => Some(std::mem::replace(existing, def)),
            None => {
                self.0.push((name, def));
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&StateDef> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, def)| def)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StateDef)> {
        self.0.iter().map(|(n, def)| (n.as_str(), def))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, StateDef)> for StateTable {
    fn from_iter<I: IntoIterator<Item = (String, StateDef)>>(iter: I) -> Self {
        let mut table = StateTable::new();
        for (name, def) in iter {
            table.insert(name, def);
        }
        table
    }
}

impl Serialize for StateTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, def) in &self.0 {
            map.serialize_entry(name, def)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for StateTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TableVisitor;

        impl<'de> Visitor<'de> for TableVisitor {
            type Value = StateTable;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of state names to state definitions")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<StateTable, A::Error> {
                let mut states = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some(name) = access.next_key::<String>()? {
                    let def: StateDef = access
                        .next_value()
                        .map_err(|e| de::Error::custom(format!("state '{name}': {e}")))?;
                    if states.iter().any(|(n, _): &(String, StateDef)| *n == name) {
                        return Err(de::Error::custom(format!("duplicate state '{name}'")));
                    }
                    states.push((name, def));
                }
                Ok(StateTable(states))
            }
        }

        deserializer.deserialize_map(TableVisitor)
    }
}

// ---------------------------------------------------------------------------
// StateDef / StateKind
// ---------------------------------------------------------------------------

/// One node of the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStateDef", into = "RawStateDef")]
pub struct StateDef {
    pub kind: StateKind,
    /// Guarded edges, evaluated in declared order. Empty for final states.
    pub transitions: Vec<Transition>,
    /// Context bindings evaluated over the state's output after dispatch.
    pub output_to_context: Mapping,
    /// Per-state timeout overriding the engine default.
    pub timeout_secs: Option<u64>,
}

impl StateDef {
    /// Build a state with no transitions or bindings.
    pub fn new(kind: StateKind) -> Self {
        Self {
            kind,
            transitions: Vec::new(),
            output_to_context: Mapping::new(),
            timeout_secs: None,
        }
    }

    pub fn with_transition(mut self, condition: Option<&str>, to: &str) -> Self {
        self.transitions.push(Transition {
            condition: condition.map(str::to_string),
            to: to.to_string(),
        });
        self
    }

    pub fn with_binding(mut self, key: &str, expression: &str) -> Self {
        self.output_to_context
            .insert(key.to_string(), Value::String(expression.to_string()));
        self
    }
}

/// The closed set of state kinds the scheduler dispatches on.
#[derive(Debug, Clone, PartialEq)]
pub enum StateKind {
    /// Invoke one external agent.
    Agent { agent: String, input: Option<Mapping> },
    /// Invoke a nested machine and await its output.
    Machine { machine: String, input: Option<Mapping> },
    /// Run a static list of branches concurrently.
    Parallel { branches: Vec<BranchRef>, on_error: JoinMode },
    /// Run one branch per element of a source sequence.
    Foreach {
        source: String,
        binding: String,
        key: Option<String>,
        branch: BranchRef,
        on_error: JoinMode,
    },
    /// Start an independent execution without waiting for it.
    Launch { machine: String, input: Option<Mapping> },
    /// Terminal state, optionally emitting an output mapping.
    Final { output: Option<Mapping> },
}

impl StateKind {
    /// Short kind name used in logs and events.
    pub fn name(&self) -> &'static str {
        match self {
            StateKind::Agent { .. } => "agent",
            StateKind::Machine { .. } => "machine",
            StateKind::Parallel { .. } => "parallel",
            StateKind::Foreach { .. } => "foreach",
            StateKind::Launch { .. } => "launch",
            StateKind::Final { .. } => "final",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, StateKind::Final { .. })
    }
}

/// A guarded edge to another state. A missing condition always matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Transition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub to: String,
}

/// Join failure policy for parallel and foreach states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    /// First branch failure cancels the siblings and fails the state.
    #[default]
    FailFast,
    /// Every branch runs to completion; results carry per-branch status.
    Collect,
}

// ---------------------------------------------------------------------------
// BranchRef / Target
// ---------------------------------------------------------------------------

/// What a branch (or agent/machine state) invokes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Agent(String),
    Machine(String),
}

impl Target {
    pub fn name(&self) -> &str {
        match self {
            Target::Agent(name) | Target::Machine(name) => name,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Agent(name) => write!(f, "agent '{name}'"),
            Target::Machine(name) => write!(f, "machine '{name}'"),
        }
    }
}

/// A machine or agent reference plus an optional input mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawBranchRef", into = "RawBranchRef")]
pub struct BranchRef {
    pub target: Target,
    pub input: Option<Mapping>,
}

impl BranchRef {
    pub fn agent(name: &str) -> Self {
        Self {
            target: Target::Agent(name.to_string()),
            input: None,
        }
    }

    pub fn machine(name: &str) -> Self {
        Self {
            target: Target::Machine(name.to_string()),
            input: None,
        }
    }

    pub fn with_input(mut self, input: Mapping) -> Self {
        self.input = Some(input);
        self
    }
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBranchRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    machine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    input: Option<Mapping>,
}

impl TryFrom<RawBranchRef> for BranchRef {
    type Error = String;

    fn try_from(raw: RawBranchRef) -> Result<Self, Self::Error> {
        let target = match (raw.agent, raw.machine) {
            (Some(agent), None) => Target::Agent(agent),
            (None, Some(machine)) => Target::Machine(machine),
            (Some(_), Some(_)) => {
                return Err("branch must reference either an agent or a machine, not both".into());
            }
            (None, None) => return Err("branch must reference an agent or a machine".into()),
        };
        Ok(Self {
            target,
            input: raw.input,
        })
    }
}

impl From<BranchRef> for RawBranchRef {
    fn from(branch: BranchRef) -> Self {
        let (agent, machine) = match branch.target {
            Target::Agent(name) => (Some(name), None),
            Target::Machine(name) => (None, Some(name)),
        };
        Self {
            agent,
            machine,
            input: branch.input,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw state document
// ---------------------------------------------------------------------------

#[derive(Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStateDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    machine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parallel: Option<Vec<BranchRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    foreach: Option<String>,
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    binding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    launch: Option<String>,
    #[serde(rename = "final", default, skip_serializing_if = "is_false")]
    is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    input: Option<Mapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output: Option<Mapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    on_error: Option<JoinMode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    transitions: Vec<Transition>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    output_to_context: Mapping,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_secs: Option<u64>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl TryFrom<RawStateDef> for StateDef {
    type Error = String;

    fn try_from(raw: RawStateDef) -> Result<Self, Self::Error> {
        let declared: Vec<&str> = [
            ("final", raw.is_final),
            ("parallel", raw.parallel.is_some()),
            ("foreach", raw.foreach.is_some()),
            ("launch", raw.launch.is_some()),
        ]
        .into_iter()
        .filter(|(_, present)| *present)
        .map(|(name, _)| name)
        .collect();

        if declared.len() > 1 {
            return Err(format!("state declares several kinds: {}", declared.join(", ")));
        }

        let has_target = raw.agent.is_some() || raw.machine.is_some();
        let is_foreach = raw.foreach.is_some();

        if !is_foreach && (raw.binding.is_some() || raw.key.is_some()) {
            return Err("`as` and `key` are only valid on foreach states".into());
        }
        if !raw.is_final && raw.output.is_some() {
            return Err("`output` is only valid on final states".into());
        }
        if raw.on_error.is_some() && raw.parallel.is_none() && !is_foreach {
            return Err("`on_error` is only valid on parallel and foreach states".into());
        }

        let on_error = raw.on_error.unwrap_or_default();

        let kind = if raw.is_final {
            if has_target || raw.input.is_some() {
                return Err("final states cannot invoke agents or machines".into());
            }
            if !raw.transitions.is_empty() {
                return Err("final states cannot declare transitions".into());
            }
            StateKind::Final { output: raw.output }
        } else if let Some(branches) = raw.parallel {
            if has_target || raw.input.is_some() {
                return Err("parallel states declare inputs per branch".into());
            }
            StateKind::Parallel { branches, on_error }
        } else if let Some(source) = raw.foreach {
            let branch = BranchRef::try_from(RawBranchRef {
                agent: raw.agent,
                machine: raw.machine,
                input: raw.input,
            })
            .map_err(|e| format!("foreach {e}"))?;
            StateKind::Foreach {
                source,
                binding: raw
                    .binding
                    .unwrap_or_else(|| DEFAULT_FOREACH_BINDING.to_string()),
                key: raw.key,
                branch,
                on_error,
            }
        } else if let Some(machine) = raw.launch {
            if has_target {
                return Err("launch states name their machine in `launch`".into());
            }
            StateKind::Launch {
                machine,
                input: raw.input,
            }
        } else {
            match (raw.agent, raw.machine) {
                (Some(agent), None) => StateKind::Agent {
                    agent,
                    input: raw.input,
                },
                (None, Some(machine)) => StateKind::Machine {
                    machine,
                    input: raw.input,
                },
                (Some(_), Some(_)) => {
                    return Err("state cannot reference both an agent and a machine".into());
                }
                (None, None) => {
                    return Err(
                        "state must declare one of agent, machine, parallel, foreach, launch or final"
                            .into(),
                    );
                }
            }
        };

        Ok(StateDef {
            kind,
            transitions: raw.transitions,
            output_to_context: raw.output_to_context,
            timeout_secs: raw.timeout_secs,
        })
    }
}

impl From<StateDef> for RawStateDef {
    fn from(def: StateDef) -> Self {
        let mut raw = RawStateDef {
            transitions: def.transitions,
            output_to_context: def.output_to_context,
            timeout_secs: def.timeout_secs,
            ..RawStateDef::default()
        };

        match def.kind {
            StateKind::Agent { agent, input } => {
                raw.agent = Some(agent);
                raw.input = input;
            }
            StateKind::Machine { machine, input } => {
                raw.machine = Some(machine);
                raw.input = input;
            }
            StateKind::Parallel { branches, on_error } => {
                raw.parallel = Some(branches);
                raw.on_error = Some(on_error);
            }
            StateKind::Foreach {
                source,
                binding,
                key,
                branch,
                on_error,
            } => {
                let branch = RawBranchRef::from(branch);
                raw.foreach = Some(source);
                raw.binding = Some(binding);
                raw.key = key;
                raw.agent = branch.agent;
                raw.machine = branch.machine;
                raw.input = branch.input;
                raw.on_error = Some(on_error);
            }
            StateKind::Launch { machine, input } => {
                raw.launch = Some(machine);
                raw.input = input;
            }
            StateKind::Final { output } => {
                raw.is_final = true;
                raw.output = output;
            }
        }

        raw
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
