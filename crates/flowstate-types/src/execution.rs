//! Execution tracking types: statuses, usage counters, failure records, and
//! the persisted shapes used by checkpoint and execution stores.

use std::fmt;
use std::ops::AddAssign;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::machine::Mapping;

// ---------------------------------------------------------------------------
// ExecutionStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal executions are eligible for cleanup.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "succeeded" => Ok(ExecutionStatus::Succeeded),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

/// External call counters reported by agents and rolled up per execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub api_calls: u64,
    #[serde(default)]
    pub cost: f64,
}

impl Usage {
    pub fn new(api_calls: u64, cost: f64) -> Self {
        Self { api_calls, cost }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, other: Self) {
        self.api_calls += other.api_calls;
        self.cost += other.cost;
    }
}

// ---------------------------------------------------------------------------
// FailureRecord
// ---------------------------------------------------------------------------

/// Why an execution stopped without reaching a final state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Error taxonomy name (`TransitionError`, `AgentCallError`, ...).
    pub error_type: String,
    pub summary: String,
    /// State the execution was in when it failed.
    pub last_state: String,
    /// Whether a retry policy may attempt the execution again.
    #[serde(default)]
    pub retryable: bool,
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// One running or completed instance of a machine.
///
/// Owned by exactly one runner at a time. The context is the complete data
/// bag; nothing else is needed to continue from `current_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub machine: String,
    pub current_state: String,
    pub context: Mapping,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launched_by: Option<Uuid>,
    /// Transitions taken so far.
    pub steps: u32,
    /// Attempt number (1-based) this runner is executing.
    pub attempt: u32,
    #[serde(default)]
    pub usage: Usage,
    /// Sequence of the latest checkpoint written for this execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Evaluated final output, set on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Mapping>,
    /// Set when the execution failed or was cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }

    /// The user-facing payload: `{success: true, ...output}` on success, or
    /// `{success: false, error_type, summary, last_state}` otherwise.
    ///
    /// `success` is written last, so an output key of the same name never
    /// masks the real status.
    pub fn outcome(&self) -> Value {
        if self.is_success() {
            let mut payload = self.output.clone().unwrap_or_default();
            payload.insert("success".to_string(), Value::Bool(true));
            return Value::Object(payload);
        }

        let (error_type, summary) = match &self.failure {
            Some(f) => (f.error_type.clone(), f.summary.clone()),
            None => (
                "Incomplete".to_string(),
                format!("execution is {}", self.status),
            ),
        };
        let mut payload = Map::new();
        payload.insert("success".to_string(), Value::Bool(false));
        payload.insert("error_type".to_string(), Value::String(error_type));
        payload.insert("summary".to_string(), Value::String(summary));
        payload.insert(
            "last_state".to_string(),
            Value::String(self.current_state.clone()),
        );
        Value::Object(payload)
    }

    /// Project onto the queryable index record.
    pub fn to_record(&self) -> ExecutionRecord {
        ExecutionRecord {
            id: self.id,
            machine: self.machine.clone(),
            status: self.status,
            current_state: self.current_state.clone(),
            parent_id: self.parent_id,
            launched_by: self.launched_by,
            attempts: self.attempt,
            error_type: self.failure.as_ref().map(|f| f.error_type.clone()),
            error: self.failure.as_ref().map(|f| f.summary.clone()),
            total_api_calls: self.usage.api_calls,
            total_cost: self.usage.cost,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// CheckpointRecord
// ---------------------------------------------------------------------------

/// Immutable snapshot of "about to enter `state` with `context`".
///
/// Records for one execution form an append-only lineage ordered by
/// `sequence`; readers always resume from the highest sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub execution_id: Uuid,
    pub machine: String,
    pub state: String,
    /// Complete context object; resume never needs anything else.
    pub context: Value,
    pub sequence: u64,
    /// Transitions taken so far (for the max-step guard).
    pub step_count: u32,
    #[serde(default)]
    pub usage: Usage,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ExecutionRecord
// ---------------------------------------------------------------------------

/// Queryable summary of one execution. The index, not the state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub machine: String,
    pub status: ExecutionStatus,
    pub current_state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launched_by: Option<Uuid>,
    /// Number of attempts made so far (1-based).
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub total_api_calls: u64,
    pub total_cost: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ExecutionFilter
// ---------------------------------------------------------------------------

/// Filter for `list_executions`. All set fields must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionFilter {
    pub status: Option<ExecutionStatus>,
    pub machine: Option<String>,
    pub parent_id: Option<Uuid>,
    /// Only records whose `updated_at` is strictly before this instant.
    pub updated_before: Option<DateTime<Utc>>,
    /// Exclude `running` executions.
    pub terminal_only: bool,
    pub limit: Option<u32>,
}

impl ExecutionFilter {
    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_machine(mut self, machine: impl Into<String>) -> Self {
        self.machine = Some(machine.into());
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a record passes every predicate except `limit`.
    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        self.status.is_none_or(|s| record.status == s)
            && self
                .machine
                .as_deref()
                .is_none_or(|m| record.machine == m)
            && self.parent_id.is_none_or(|p| record.parent_id == Some(p))
            && self
                .updated_before
                .is_none_or(|t| record.updated_at < t)
            && (!self.terminal_only || record.status.is_terminal())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: ExecutionStatus) -> ExecutionRecord {
        let now = Utc::now();
        ExecutionRecord {
            id: Uuid::now_v7(),
            machine: "triage".to_string(),
            status,
            current_state: "classify".to_string(),
            parent_id: None,
            launched_by: None,
            attempts: 1,
            error_type: None,
            error: None,
            total_api_calls: 0,
            total_cost: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    fn execution(status: ExecutionStatus) -> Execution {
        let now = Utc::now();
        Execution {
            id: Uuid::now_v7(),
            machine: "triage".to_string(),
            current_state: "done".to_string(),
            context: Mapping::new(),
            status,
            parent_id: None,
            launched_by: None,
            steps: 3,
            attempt: 2,
            usage: Usage::new(4, 0.5),
            sequence: Some(3),
            output: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn success_outcome_spreads_output() {
        let mut exec = execution(ExecutionStatus::Succeeded);
        let mut output = Mapping::new();
        output.insert("result".to_string(), Value::String("Hi".to_string()));
        output.insert("success".to_string(), Value::Bool(false));
        exec.output = Some(output);

        let outcome = exec.outcome();
        assert_eq!(outcome["success"], true);
        assert_eq!(outcome["result"], "Hi");
    }

    #[test]
    fn failure_outcome_carries_record() {
        let mut exec = execution(ExecutionStatus::Failed);
        exec.failure = Some(FailureRecord {
            error_type: "TransitionError".to_string(),
            summary: "no transition matched".to_string(),
            last_state: "done".to_string(),
            retryable: false,
        });

        let outcome = exec.outcome();
        assert_eq!(outcome["success"], false);
        assert_eq!(outcome["error_type"], "TransitionError");
        assert_eq!(outcome["last_state"], "done");

        let record = exec.to_record();
        assert_eq!(record.attempts, 2);
        assert_eq!(record.total_api_calls, 4);
        assert_eq!(record.error_type.as_deref(), Some("TransitionError"));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_value(ExecutionStatus::Succeeded).unwrap();
        assert_eq!(json, "succeeded");
        assert_eq!("cancelled".parse::<ExecutionStatus>().unwrap(), ExecutionStatus::Cancelled);
        assert!("paused".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn only_running_is_non_terminal() {
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Succeeded.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn usage_accumulates() {
        let mut total = Usage::default();
        total += Usage::new(2, 0.5);
        total += Usage::new(1, 0.25);
        assert_eq!(total.api_calls, 3);
        assert!((total.cost - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn filter_matches_status_and_machine() {
        let filter = ExecutionFilter::default()
            .with_status(ExecutionStatus::Failed)
            .with_machine("triage");
        assert!(filter.matches(&record(ExecutionStatus::Failed)));
        assert!(!filter.matches(&record(ExecutionStatus::Running)));

        let other = ExecutionFilter::default().with_machine("other");
        assert!(!other.matches(&record(ExecutionStatus::Failed)));
    }

    #[test]
    fn filter_terminal_only_and_age() {
        let filter = ExecutionFilter {
            terminal_only: true,
            updated_before: Some(Utc::now() + chrono::Duration::seconds(60)),
            ..ExecutionFilter::default()
        };
        assert!(filter.matches(&record(ExecutionStatus::Cancelled)));
        assert!(!filter.matches(&record(ExecutionStatus::Running)));

        let too_recent = ExecutionFilter {
            updated_before: Some(Utc::now() - chrono::Duration::seconds(60)),
            ..ExecutionFilter::default()
        };
        assert!(!too_recent.matches(&record(ExecutionStatus::Failed)));
    }
}
