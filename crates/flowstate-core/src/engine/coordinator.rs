//! Concurrency coordinator for `parallel` and `foreach` states.
//!
//! Every branch runs as its own task in a `JoinSet`, against a private copy
//! of the parent context. Branch results are joined deterministically no
//! matter in which order the tasks complete:
//!
//! - `parallel`: a sequence in declaration order
//! - `foreach`: a sequence in input order, or a key -> result object when a
//!   `key` expression is declared
//!
//! With `fail_fast` (the default) the first branch failure cancels the
//! siblings and fails the state with a `ConcurrencyError` once they have
//! unwound. With `collect` every branch runs to completion and each result
//! becomes `{status: "succeeded", value}` or `{status: "failed", error}`.

use std::collections::HashMap;

use flowstate_types::execution::{Execution, Usage};
use flowstate_types::machine::{BranchRef, JoinMode, Mapping, Target};
use serde_json::{json, Map, Value};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::context::Scope;
use super::error::{BranchFailure, EngineError};
use super::expression::{ExpressionError, ExpressionEvaluator};
use super::scheduler::{Engine, Frame};
use crate::repository::Backend;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Joined output of a concurrent state.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutput {
    pub value: Value,
    /// Sum of the usage reported by every branch that completed.
    pub usage: Usage,
}

/// The per-item shape of a `foreach` state.
#[derive(Debug, Clone, Copy)]
pub struct ForeachPlan<'a> {
    /// Expression that must evaluate to a sequence.
    pub source: &'a str,
    /// Name the current element is bound to.
    pub binding: &'a str,
    /// Optional key expression; switches the join to an object.
    pub key: Option<&'a str>,
    pub branch: &'a BranchRef,
    pub mode: JoinMode,
}

/// One prepared branch, ready to spawn.
struct BranchJob {
    index: usize,
    target: Target,
    input: Value,
    key: Option<String>,
}

type BranchResult = Result<(Value, Usage), EngineError>;

// ---------------------------------------------------------------------------
// Engine entry points
// ---------------------------------------------------------------------------

impl<B: Backend> Engine<B> {
    /// Run every branch concurrently and join the results in declared order.
    pub async fn run_parallel(
        &self,
        parent: &Execution,
        state: &str,
        branches: &[BranchRef],
        mode: JoinMode,
        token: &CancellationToken,
    ) -> Result<JoinOutput, EngineError> {
        let jobs = parallel_jobs(parent, state, branches)?;
        tracing::debug!(
            execution_id = %parent.id,
            state,
            branches = jobs.len(),
            mode = ?mode,
            "running parallel branches"
        );
        let results = self.join(parent, state, jobs, mode, token).await?;
        Ok(assemble(results, None, mode))
    }

    /// Run the branch once per element of the evaluated source sequence.
    pub async fn run_foreach(
        &self,
        parent: &Execution,
        state: &str,
        plan: ForeachPlan<'_>,
        token: &CancellationToken,
    ) -> Result<JoinOutput, EngineError> {
        let jobs = foreach_jobs(parent, state, &plan)?;
        tracing::debug!(
            execution_id = %parent.id,
            state,
            items = jobs.len(),
            keyed = plan.key.is_some(),
            mode = ?plan.mode,
            "running foreach branches"
        );
        let keys: Option<Vec<String>> = plan
            .key
            .map(|_| jobs.iter().map(|j| j.key.clone().unwrap_or_default()).collect());
        let results = self.join(parent, state, jobs, plan.mode, token).await?;
        Ok(assemble(results, keys.as_deref(), plan.mode))
    }

    // -----------------------------------------------------------------------
    // Join
    // -----------------------------------------------------------------------

    /// Spawn every job and wait for all of them (or the first failure in
    /// fail-fast mode). Results are indexed by job position.
    async fn join(
        &self,
        parent: &Execution,
        state: &str,
        jobs: Vec<BranchJob>,
        mode: JoinMode,
        token: &CancellationToken,
    ) -> Result<Vec<Option<BranchResult>>, EngineError> {
        let total = jobs.len();
        let branch_token = token.child_token();
        let mut join_set = JoinSet::new();
        let mut positions = HashMap::with_capacity(total);

        for job in jobs {
            let engine = self.clone();
            let frame = Frame::of(parent, state);
            let task_token = branch_token.child_token();
            let handle = join_set.spawn(async move {
                engine
                    .run_branch(frame, job.target, job.input, task_token)
                    .await
            });
            positions.insert(handle.id(), job.index);
        }

        let mut results: Vec<Option<BranchResult>> = (0..total).map(|_| None).collect();
        let mut first_failure: Option<(usize, EngineError)> = None;

        // Siblings are cancelled, never aborted: every task is drained so
        // nested executions record their own terminal status.
        while let Some(joined) = join_set.join_next_with_id().await {
            let (index, result) = match joined {
                Ok((id, result)) => (positions.get(&id).copied(), result),
                Err(join_err) => {
                    tracing::warn!(
                        execution_id = %parent.id,
                        state,
                        error = %join_err,
                        "branch task panicked"
                    );
                    (
                        positions.get(&join_err.id()).copied(),
                        Err(EngineError::Transition {
                            state: state.to_string(),
                            message: format!("branch task failed: {join_err}"),
                        }),
                    )
                }
            };
            let Some(index) = index else { continue };

            match result {
                Err(err) if mode == JoinMode::FailFast => {
                    if first_failure.is_none() {
                        tracing::debug!(
                            execution_id = %parent.id,
                            state,
                            index,
                            error = %err,
                            "branch failed, cancelling siblings"
                        );
                        branch_token.cancel();
                        first_failure = Some((index, err));
                    }
                }
                result => results[index] = Some(result),
            }
        }

        if let Some((index, err)) = first_failure {
            if matches!(err, EngineError::Cancelled) && token.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            return Err(EngineError::Concurrency {
                state: state.to_string(),
                total,
                failures: vec![err.to_branch_failure(index)],
            });
        }
        if token.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(results)
    }

    /// One branch: an agent call or a nested machine run.
    async fn run_branch(
        &self,
        frame: Frame,
        target: Target,
        input: Value,
        token: CancellationToken,
    ) -> BranchResult {
        if token.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match target {
            Target::Agent(agent) => self
                .call_agent(&frame, &agent, input, &token)
                .await
                .map(|r| (r.output, r.usage)),
            Target::Machine(machine) => self.run_child(&frame, &machine, input, token).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Job preparation
// ---------------------------------------------------------------------------
//
// Synchronous: the evaluator must not be held across an await point.

fn parallel_jobs(
    parent: &Execution,
    state: &str,
    branches: &[BranchRef],
) -> Result<Vec<BranchJob>, EngineError> {
    let evaluator = ExpressionEvaluator::new();
    branches
        .iter()
        .enumerate()
        .map(|(index, branch)| {
            let context = parent.context.clone();
            let scope = Scope::new(&context, parent.id, &parent.machine, state, parent.steps).into_value();
            let input = branch_input(&evaluator, branch.input.as_ref(), context, &scope)
                .map_err(|source| EngineError::Expression {
                    state: state.to_string(),
                    source,
                })?;
            Ok(BranchJob {
                index,
                target: branch.target.clone(),
                input,
                key: None,
            })
        })
        .collect()
}

fn foreach_jobs(
    parent: &Execution,
    state: &str,
    plan: &ForeachPlan<'_>,
) -> Result<Vec<BranchJob>, EngineError> {
    let evaluator = ExpressionEvaluator::new();
    let expression_error = |source: ExpressionError| EngineError::Expression {
        state: state.to_string(),
        source,
    };

    let scope = Scope::new(&parent.context, parent.id, &parent.machine, state, parent.steps).into_value();
    let items = match evaluator
        .evaluate_value(plan.source, &scope)
        .map_err(expression_error)?
    {
        Value::Array(items) => items,
        other => {
            return Err(expression_error(ExpressionError::NotASequence {
                expression: plan.source.to_string(),
                found: json_kind(&other).to_string(),
            }));
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let mut context = parent.context.clone();
            context.insert(plan.binding.to_string(), item.clone());
            let scope = Scope::new(&context, parent.id, &parent.machine, state, parent.steps)
                .with_binding(plan.binding, item)
                .into_value();

            let key = match plan.key {
                Some(expression) => Some(key_string(
                    evaluator
                        .evaluate_value(expression, &scope)
                        .map_err(expression_error)?,
                )),
                None => None,
            };
            let input = branch_input(&evaluator, plan.branch.input.as_ref(), context, &scope)
                .map_err(expression_error)?;

            Ok(BranchJob {
                index,
                target: plan.branch.target.clone(),
                input,
                key,
            })
        })
        .collect()
}

/// The evaluated input mapping, or the branch's whole private context.
fn branch_input(
    evaluator: &ExpressionEvaluator,
    mapping: Option<&Mapping>,
    context: Mapping,
    scope: &Value,
) -> Result<Value, ExpressionError> {
    match mapping {
        Some(mapping) => evaluator.evaluate_mapping(mapping, scope).map(Value::Object),
        None => Ok(Value::Object(context)),
    }
}

/// Object keys are strings; non-string keys use their JSON text.
fn key_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

/// Build the joined value from per-index results.
///
/// Fail-fast joins only get here when every branch succeeded and yield bare
/// values. Collect joins wrap every slot in a per-branch status.
/// With keys, duplicates resolve to the last branch in input order.
fn assemble(results: Vec<Option<BranchResult>>, keys: Option<&[String]>, mode: JoinMode) -> JoinOutput {
    let collect = mode == JoinMode::Collect;
    let total = results.len();
    let mut usage = Usage::default();
    let mut values = Vec::with_capacity(total);
    let mut failures: Vec<BranchFailure> = Vec::new();

    for (index, slot) in results.into_iter().enumerate() {
        let entry = match slot {
            Some(Ok((value, branch_usage))) => {
                usage += branch_usage;
                if collect {
                    json!({ "status": "succeeded", "value": value })
                } else {
                    value
                }
            }
            Some(Err(err)) => {
                let failure = err.to_branch_failure(index);
                let entry = json!({
                    "status": "failed",
                    "error": { "error_type": failure.error_type, "summary": failure.message },
                });
                failures.push(failure);
                entry
            }
            None => json!({
                "status": "failed",
                "error": { "error_type": "Cancelled", "summary": "branch did not complete" },
            }),
        };
        values.push(entry);
    }

    if !failures.is_empty() {
        tracing::debug!(failed = failures.len(), total, "collected partial branch results");
    }

    let value = match keys {
        Some(keys) => {
            let mut joined = Map::with_capacity(values.len());
            for (key, entry) in keys.iter().zip(values) {
                joined.insert(key.clone(), entry);
            }
            Value::Object(joined)
        }
        None => Value::Array(values),
    };
    JoinOutput { value, usage }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
