//! Execution context helpers and the expression scope.
//!
//! The context is a plain `Mapping` owned by the `Execution`. Branches get
//! private clones; updates only flow back through explicit
//! `output_to_context` bindings or joins.

use flowstate_types::machine::Mapping;
use serde_json::{json, Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum serialized size of a context snapshot (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

/// Key under which a non-object input is stored.
pub const SCALAR_INPUT_KEY: &str = "input";

// ---------------------------------------------------------------------------
// Context construction
// ---------------------------------------------------------------------------

/// Seed a context from an execution input.
///
/// Object entries are copied as top-level keys. Any other non-null value is
/// stored under [`SCALAR_INPUT_KEY`].
pub fn seed_context(input: &Value) -> Mapping {
    let mut context = Mapping::new();
    match input {
        Value::Object(map) => context.extend(map.clone()),
        Value::Null => {}
        other => {
            context.insert(SCALAR_INPUT_KEY.to_string(), other.clone());
        }
    }
    context
}

/// Rebuild a context from a checkpoint snapshot. `None` unless it is an object.
pub fn restore_context(snapshot: &Value) -> Option<Mapping> {
    snapshot.as_object().cloned()
}

/// Serialized size in bytes.
pub fn context_size(context: &Mapping) -> usize {
    serde_json::to_vec(context).map(|v| v.len()).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// The object expressions evaluate against.
///
/// Shape:
/// ```json
/// {
///   "context": { ... },
///   "input": <state input, or the execution input for context initialisers>,
///   "output": <state output>,
///   "execution": { "id": "...", "machine": "...", "state": "...", "step": 0 },
///   "<binding>": <foreach element>
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Scope {
    root: Map<String, Value>,
}

impl Scope {
    pub fn new(context: &Mapping, id: Uuid, machine: &str, state: &str, step: u32) -> Self {
        let mut root = Map::new();
        root.insert("context".to_string(), Value::Object(context.clone()));
        root.insert("input".to_string(), Value::Null);
        root.insert("output".to_string(), Value::Null);
        root.insert(
            "execution".to_string(),
            json!({
                "id": id.to_string(),
                "machine": machine,
                "state": state,
                "step": step,
            }),
        );
        Self { root }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.root.insert("input".to_string(), input);
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.root.insert("output".to_string(), output);
        self
    }

    pub fn with_binding(mut self, name: &str, value: Value) -> Self {
        self.root.insert(name.to_string(), value);
        self
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.root)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_input_becomes_top_level_keys() {
        let ctx = seed_context(&json!({ "target": "Hi", "n": 2 }));
        assert_eq!(ctx.get("target"), Some(&json!("Hi")));
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn scalar_input_is_wrapped() {
        let ctx = seed_context(&json!("hello"));
        assert_eq!(ctx.get(SCALAR_INPUT_KEY), Some(&json!("hello")));
        assert!(seed_context(&Value::Null).is_empty());
    }

    #[test]
    fn snapshot_must_be_object() {
        assert!(restore_context(&json!([1])).is_none());
        let ctx = restore_context(&json!({ "k": "v" })).unwrap();
        assert_eq!(ctx.get("k"), Some(&json!("v")));
        assert!(context_size(&ctx) > 0);
    }

    #[test]
    fn scope_exposes_roots() {
        let ctx = seed_context(&json!({ "k": 1 }));
        let id = Uuid::now_v7();
        let scope = Scope::new(&ctx, id, "m", "s", 4)
            .with_output(json!({ "o": true }))
            .with_binding("task", json!("t1"))
            .into_value();

        assert_eq!(scope["context"]["k"], 1);
        assert_eq!(scope["output"]["o"], true);
        assert_eq!(scope["input"], Value::Null);
        assert_eq!(scope["execution"]["id"], id.to_string());
        assert_eq!(scope["execution"]["step"], 4);
        assert_eq!(scope["task"], "t1");
    }
}
