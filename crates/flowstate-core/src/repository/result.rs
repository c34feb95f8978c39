//! Result backend trait and the result addressing scheme.
//!
//! Completed executions publish their outcome under
//! `<scheme>://<execution_id>/result`. Peered callers rendezvous by reading
//! that key; nothing is pushed back to them.

use flowstate_types::error::RepositoryError;
use serde_json::Value;
use uuid::Uuid;

/// Build the result key for an execution.
pub fn result_key(scheme: &str, execution_id: &Uuid) -> String {
    format!("{scheme}://{execution_id}/result")
}

/// Split a result key into its scheme and execution id.
pub fn parse_result_key(key: &str) -> Option<(&str, Uuid)> {
    let (scheme, rest) = key.split_once("://")?;
    let id = rest.strip_suffix("/result")?;
    Some((scheme, id.parse().ok()?))
}

/// Durable key/value store for completed-execution outputs.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ResultBackend: Send + Sync {
    /// Write a value if the key is absent. Returns `false` when a value was
    /// already present (the existing value is kept).
    fn write_result(
        &self,
        key: &str,
        value: &Value,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn read_result(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<Value>, RepositoryError>> + Send;

    /// Returns `true` if a value existed.
    fn delete_result(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_key_round_trips() {
        let id = Uuid::now_v7();
        let key = result_key("flowstate", &id);
        assert_eq!(key, format!("flowstate://{id}/result"));
        assert_eq!(parse_result_key(&key), Some(("flowstate", id)));
    }

    #[test]
    fn parse_rejects_malformed_keys() {
        assert!(parse_result_key("flowstate:/abc/result").is_none());
        assert!(parse_result_key("flowstate://not-a-uuid/result").is_none());
        assert!(parse_result_key(&format!("flowstate://{}/output", Uuid::nil())).is_none());
    }
}
