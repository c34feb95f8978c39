//! JEXL expression evaluator for guards, input/output mappings, and bindings.
//!
//! Wraps `jexl_eval::Evaluator` with the standard transforms registered.
//! Context values are always passed as the evaluation scope, never
//! interpolated into expression strings.

use flowstate_types::machine::Mapping;
use serde_json::{json, Map, Value};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression `{expression}` failed: {message}")]
    EvalFailed { expression: String, message: String },

    #[error("invalid scope: {0}")]
    InvalidScope(String),

    #[error("expression `{expression}` must evaluate to a sequence, got {found}")]
    NotASequence { expression: String, found: String },
}

// ---------------------------------------------------------------------------
// ExpressionEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with the standard transforms pre-registered.
///
/// Not `Send`: the transform table holds plain boxed closures. Build one where
/// it is used rather than sharing it across tasks.
pub struct ExpressionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            // String transforms
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = s.split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!truthy(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(subject)), Some(Value::String(search))) => {
                        subject.contains(search.as_str())
                    }
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    (Some(Value::Object(map)), Some(Value::String(key))) => map.contains_key(key),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            // Length works on strings (in chars), arrays, and objects
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            .with_transform("keys", |args: &[Value]| {
                let keys: Vec<&String> = match args.first() {
                    Some(Value::Object(o)) => o.keys().collect(),
                    _ => Vec::new(),
                };
                Ok(json!(keys))
            })
            .with_transform("default", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                if val.is_null() {
                    Ok(args.get(1).cloned().unwrap_or(Value::Null))
                } else {
                    Ok(val)
                }
            });

        Self { evaluator }
    }

    /// Evaluate an expression and coerce the result with JavaScript truthiness.
    pub fn evaluate_bool(&self, expression: &str, scope: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, scope).map(|v| truthy(&v))
    }

    /// Evaluate an expression and return the raw JSON value.
    ///
    /// `scope` must be a JSON object.
    pub fn evaluate_value(&self, expression: &str, scope: &Value) -> Result<Value, ExpressionError> {
        if !scope.is_object() {
            return Err(ExpressionError::InvalidScope(
                "scope must be a JSON object".to_string(),
            ));
        }

        self.evaluator
            .eval_in_context(expression, scope)
            .map_err(|e| ExpressionError::EvalFailed {
                expression: expression.to_string(),
                message: e.to_string(),
            })
    }

    /// Evaluate a declarative mapping into a JSON object.
    ///
    /// String leaves are expressions, other scalars are literals, and nested
    /// objects/arrays are evaluated recursively.
    pub fn evaluate_mapping(&self, mapping: &Mapping, scope: &Value) -> Result<Map<String, Value>, ExpressionError> {
        let mut out = Map::with_capacity(mapping.len());
        for (key, template) in mapping {
            out.insert(key.clone(), self.evaluate_template(template, scope)?);
        }
        Ok(out)
    }

    fn evaluate_template(&self, template: &Value, scope: &Value) -> Result<Value, ExpressionError> {
        match template {
            Value::String(expression) => self.evaluate_value(expression, scope),
            Value::Object(nested) => self.evaluate_mapping(nested, scope).map(Value::Object),
            Value::Array(items) => items
                .iter()
                .map(|item| self.evaluate_template(item, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            literal => Ok(literal.clone()),
        }
    }
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator() -> ExpressionEvaluator {
        ExpressionEvaluator::new()
    }

    // -------------------------------------------------------------------
    // Value evaluation
    // -------------------------------------------------------------------

    #[test]
    fn dot_notation_and_indexing() {
        let scope = json!({ "context": { "user": { "name": "Ada" }, "tags": ["a", "b"] } });
        let eval = evaluator();
        assert_eq!(eval.evaluate_value("context.user.name", &scope).unwrap(), json!("Ada"));
        assert_eq!(eval.evaluate_value("context.tags[1]", &scope).unwrap(), json!("b"));
    }

    #[test]
    fn missing_property_is_null() {
        let scope = json!({ "context": {} });
        let result = evaluator().evaluate_value("context.nothing", &scope).unwrap();
        assert_eq!(result, Value::Null);
    }

    #[test]
    fn non_object_scope_is_rejected() {
        let err = evaluator().evaluate_value("true", &json!([1, 2])).unwrap_err();
        assert!(matches!(err, ExpressionError::InvalidScope(_)));
    }

    #[test]
    fn syntax_error_reports_expression() {
        let err = evaluator()
            .evaluate_value("context.(", &json!({ "context": {} }))
            .unwrap_err();
        assert!(err.to_string().contains("context.("));
    }

    // -------------------------------------------------------------------
    // Guards
    // -------------------------------------------------------------------

    #[test]
    fn guards_use_truthiness() {
        let scope = json!({ "context": { "empty": "", "full": "x", "flag": true } });
        let eval = evaluator();
        assert!(!eval.evaluate_bool("context.empty", &scope).unwrap());
        assert!(eval.evaluate_bool("context.full", &scope).unwrap());
        assert!(eval.evaluate_bool("context.flag && context.full == 'x'", &scope).unwrap());
        assert!(!eval.evaluate_bool("context.missing", &scope).unwrap());
    }

    #[test]
    fn string_equality_guard() {
        let scope = json!({ "context": { "result": "Hi", "target": "Hi" } });
        assert!(evaluator()
            .evaluate_bool("context.result == context.target", &scope)
            .unwrap());
    }

    // -------------------------------------------------------------------
    // Transforms
    // -------------------------------------------------------------------

    #[test]
    fn string_transforms() {
        let scope = json!({ "s": "  Hello World  " });
        let eval = evaluator();
        assert_eq!(eval.evaluate_value("s|trim|lower", &scope).unwrap(), json!("hello world"));
        assert_eq!(eval.evaluate_value("s|trim|upper", &scope).unwrap(), json!("HELLO WORLD"));
        assert!(eval.evaluate_bool("s|trim|startsWith('Hello')", &scope).unwrap());
        assert!(eval.evaluate_bool("s|trim|endsWith('World')", &scope).unwrap());
    }

    #[test]
    fn split_and_length() {
        let scope = json!({ "csv": "a,b,c", "items": ["x", "y"] });
        let eval = evaluator();
        assert_eq!(eval.evaluate_value("csv|split(',')", &scope).unwrap(), json!(["a", "b", "c"]));
        assert!(eval.evaluate_bool("items|length > 1", &scope).unwrap());
        assert!(!eval.evaluate_bool("items|length > 2", &scope).unwrap());
    }

    #[test]
    fn contains_on_strings_arrays_and_objects() {
        let scope = json!({ "msg": "charged twice", "tags": ["billing"], "obj": { "k": 1 } });
        let eval = evaluator();
        assert!(eval.evaluate_bool("msg|contains('twice')", &scope).unwrap());
        assert!(eval.evaluate_bool("tags|contains('billing')", &scope).unwrap());
        assert!(eval.evaluate_bool("obj|contains('k')", &scope).unwrap());
        assert!(!eval.evaluate_bool("tags|contains('refund')", &scope).unwrap());
    }

    #[test]
    fn keys_not_and_default() {
        let scope = json!({ "obj": { "a": 1, "b": 2 }, "none": null, "flag": false });
        let eval = evaluator();
        assert_eq!(eval.evaluate_value("obj|keys", &scope).unwrap(), json!(["a", "b"]));
        assert!(eval.evaluate_bool("flag|not", &scope).unwrap());
        assert_eq!(eval.evaluate_value("none|default('fallback')", &scope).unwrap(), json!("fallback"));
        let present = eval.evaluate_value("obj.a|default('fallback')", &scope).unwrap();
        assert_eq!(present.as_f64(), Some(1.0));
    }

    // -------------------------------------------------------------------
    // Mappings
    // -------------------------------------------------------------------

    #[test]
    fn mapping_evaluates_nested_templates() {
        let scope = json!({ "output": { "subject": "Refund", "body": "Sorry" } });
        let mapping: Mapping = serde_json::from_value(json!({
            "response": { "subject": "output.subject", "body": "output.body" },
            "needs_response": true,
            "parts": ["output.subject", 3],
        }))
        .unwrap();

        let result = evaluator().evaluate_mapping(&mapping, &scope).unwrap();
        assert_eq!(result["response"]["subject"], "Refund");
        assert_eq!(result["response"]["body"], "Sorry");
        assert_eq!(result["needs_response"], true);
        assert_eq!(result["parts"][0], "Refund");
        assert_eq!(result["parts"][1], 3);
    }

    #[test]
    fn string_literals_need_quotes() {
        let mapping: Mapping = serde_json::from_value(json!({ "label": "'fixed'" })).unwrap();
        let result = evaluator().evaluate_mapping(&mapping, &json!({})).unwrap();
        assert_eq!(result["label"], "fixed");
    }
}
