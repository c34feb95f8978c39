//! Execution engine: drives one execution from its current state to a
//! terminal state.
//!
//! # Execution flow
//!
//! 1. Validate the machine against the registries and the active backend.
//! 2. Seed the context from the input and the machine's `context` mapping.
//! 3. Loop: dispatch the current state by kind, merge `output_to_context`
//!    bindings, pick the first matching transition, advance, checkpoint.
//! 4. On `final`, evaluate the output, publish it to the result backend, and
//!    mark the execution `succeeded`. Any failure marks it `failed` with a
//!    failure record; cancellation marks it `cancelled`.
//!
//! A checkpoint always means "about to enter state S with context C": it is
//! written after the previous state's side effects and bindings completed,
//! and before the next state's side effects begin.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use flowstate_types::config::EngineSettings;
use flowstate_types::event::ExecutionEvent;
use flowstate_types::execution::{CheckpointRecord, Execution, ExecutionRecord, ExecutionStatus, Usage};
use flowstate_types::machine::{MachineConfig, Mapping, StateDef, StateKind, Transition};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::context::{restore_context, seed_context, Scope};
use super::coordinator::ForeachPlan;
use super::error::EngineError;
use super::expression::ExpressionEvaluator;
use crate::agent::{AgentRegistry, AgentRequest, AgentResponse};
use crate::event::EventBus;
use crate::machine::definition::{referenced_agents, referenced_machines, validate_config};
use crate::machine::{ConfigError, MachineRegistry};
use crate::repository::{result_key, Backend};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ---------------------------------------------------------------------------
// RunOptions
// ---------------------------------------------------------------------------

/// Per-run overrides.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Reuse an execution id (retries). A fresh v7 id is allocated otherwise.
    pub execution_id: Option<Uuid>,
    /// Attempt number recorded on the execution (defaults to 1).
    pub attempt: Option<u32>,
    pub(crate) parent_id: Option<Uuid>,
    pub(crate) launched_by: Option<Uuid>,
    /// Parent token for nested runs; launches and top-level runs get their own.
    pub(crate) token: Option<CancellationToken>,
}

impl RunOptions {
    pub fn with_execution_id(mut self, id: Uuid) -> Self {
        self.execution_id = Some(id);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

// ---------------------------------------------------------------------------
// Frame / StateResult
// ---------------------------------------------------------------------------

/// Identifies the state a call is made from. Cheap to clone into branch tasks.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub execution_id: Uuid,
    pub machine: String,
    pub state: String,
}

impl Frame {
    pub fn of(execution: &Execution, state: &str) -> Self {
        Self {
            execution_id: execution.id,
            machine: execution.machine.clone(),
            state: state.to_string(),
        }
    }
}

/// What dispatching a state produced.
pub(crate) struct StateResult {
    pub input: Value,
    pub output: Value,
    pub usage: Usage,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub(crate) struct EngineInner<B: Backend> {
    pub backend: Arc<B>,
    pub checkpoints: CheckpointManager<B>,
    pub machines: MachineRegistry,
    pub agents: AgentRegistry,
    pub events: EventBus,
    pub settings: EngineSettings,
    /// Cancellation tokens of executions currently driven by this engine.
    pub tokens: DashMap<Uuid, CancellationToken>,
}

/// The workflow engine. Cheap to clone; clones share registries, storage,
/// the event bus, and the set of active executions.
pub struct Engine<B: Backend> {
    pub(crate) inner: Arc<EngineInner<B>>,
}

impl<B: Backend> Clone for Engine<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Engine<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("backend", &self.inner.backend.name())
            .field("active", &self.inner.tokens.len())
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Engine<B> {
    pub fn new(backend: Arc<B>, settings: EngineSettings) -> Self {
        Self::with_registries(backend, settings, MachineRegistry::new(), AgentRegistry::new())
    }

    pub fn with_registries(
        backend: Arc<B>,
        settings: EngineSettings,
        machines: MachineRegistry,
        agents: AgentRegistry,
    ) -> Self {
        let events = EventBus::new(settings.event_capacity);
        Self {
            inner: Arc::new(EngineInner {
                checkpoints: CheckpointManager::new(Arc::clone(&backend)),
                backend,
                machines,
                agents,
                events,
                settings,
                tokens: DashMap::new(),
            }),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.inner.backend
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn machines(&self) -> &MachineRegistry {
        &self.inner.machines
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.inner.agents
    }

    pub fn checkpoints(&self) -> &CheckpointManager<B> {
        &self.inner.checkpoints
    }

    /// Validate and register a machine so nested states, launches, and
    /// resumes can find it by name.
    pub fn register_machine(&self, config: MachineConfig) -> Result<Arc<MachineConfig>, ConfigError> {
        self.inner.machines.register(config)
    }

    /// Receive every `ExecutionEvent` published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_active(&self, execution_id: Uuid) -> bool {
        self.inner.tokens.contains_key(&execution_id)
    }

    /// Request cancellation of an active execution. Returns `false` if this
    /// engine is not driving it.
    ///
    /// Running branches and nested machines are cancelled with it; executions
    /// it launched are not.
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        match self.inner.tokens.get(&execution_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(execution_id = %execution_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Result key of an execution under the configured scheme.
    pub fn result_key(&self, execution_id: Uuid) -> String {
        result_key(&self.inner.settings.result_scheme, &execution_id)
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Drive a fresh execution of `config` to completion.
    ///
    /// Returns `Err` only when the execution could not start (invalid or
    /// unrunnable config, id already active). Failures during the run are
    /// reported on the returned `Execution`.
    pub async fn run(&self, config: &MachineConfig, input: Value) -> Result<Execution, EngineError> {
        self.run_with(config, input, RunOptions::default()).await
    }

    pub async fn run_with(
        &self,
        config: &MachineConfig,
        input: Value,
        options: RunOptions,
    ) -> Result<Execution, EngineError> {
        let config = self.register_machine(config.clone())?;
        self.start(config, input, options).await
    }

    /// Continue an execution from its latest checkpoint.
    pub async fn resume(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        self.resume_with(execution_id, None).await
    }

    /// Resume, recording `attempt` on the execution (defaults to the attempt
    /// count already on record).
    pub async fn resume_with(
        &self,
        execution_id: Uuid,
        attempt: Option<u32>,
    ) -> Result<Execution, EngineError> {
        let checkpoint = self
            .inner
            .checkpoints
            .load_latest(execution_id)
            .await?
            .ok_or(EngineError::NotFound(execution_id))?;
        let record = self.inner.backend.get_execution(&execution_id).await?;
        if let Some(record) = &record
            && record.status == ExecutionStatus::Succeeded
        {
            return Err(EngineError::NotResumable {
                id: execution_id,
                status: record.status,
            });
        }

        let config = self
            .inner
            .machines
            .get(&checkpoint.machine)
            .ok_or_else(|| ConfigError::UnknownMachine(checkpoint.machine.clone()))?;
        self.check_runnable(&config)?;

        let (execution, token) = self.restore(checkpoint, record.as_ref(), attempt)?;
        if let Err(e) = self.persist_record(&execution).await {
            self.release(execution.id);
            return Err(e);
        }

        self.inner.events.publish(ExecutionEvent::Resumed {
            execution_id: execution.id,
            state: execution.current_state.clone(),
            sequence: execution.sequence.unwrap_or(0),
        });
        tracing::info!(
            execution_id = %execution.id,
            machine = execution.machine.as_str(),
            state = execution.current_state.as_str(),
            step = execution.steps,
            "resuming execution"
        );

        let execution = self.drive(execution, config, token).await;
        self.release(execution.id);
        Ok(execution)
    }

    /// Run a registered machine by name and return the outcome payload.
    ///
    /// Never fails: errors that prevent the run from starting are reported
    /// as a failure payload too.
    pub async fn execute(&self, machine: &str, input: Value) -> Value {
        let config = match self.inner.machines.get(machine) {
            Some(config) => config,
            None => {
                let err = EngineError::Config(ConfigError::UnknownMachine(machine.to_string()));
                return failure_payload(&err, "");
            }
        };
        let initial = config.initial.clone();
        match self.start(config, input, RunOptions::default()).await {
            Ok(execution) => execution.outcome(),
            Err(e) => failure_payload(&e, &initial),
        }
    }

    /// Resume an execution and return the outcome payload.
    pub async fn execute_resume(&self, execution_id: Uuid) -> Value {
        match self.resume(execution_id).await {
            Ok(execution) => execution.outcome(),
            Err(e) => failure_payload(&e, ""),
        }
    }

    // -----------------------------------------------------------------------
    // Setup
    // -----------------------------------------------------------------------

    pub(crate) async fn start(
        &self,
        config: Arc<MachineConfig>,
        input: Value,
        options: RunOptions,
    ) -> Result<Execution, EngineError> {
        let (execution, token) = self.prepare(&config, input, &options).await?;
        Ok(self.run_prepared(execution, config, token).await)
    }

    /// Build and register a fresh execution without driving it.
    pub(crate) async fn prepare(
        &self,
        config: &MachineConfig,
        input: Value,
        options: &RunOptions,
    ) -> Result<(Execution, CancellationToken), EngineError> {
        self.check_runnable(config)?;

        let id = options.execution_id.unwrap_or_else(Uuid::now_v7);
        let context = initial_context(config, id, &input)?;

        // Prior lineage and creation time when an id is reused.
        let (sequence, created_at) = match options.execution_id {
            Some(id) => {
                let latest = self.inner.checkpoints.load_latest(id).await?;
                let record = self.inner.backend.get_execution(&id).await?;
                (
                    latest.map(|c| c.sequence),
                    record.map(|r| r.created_at),
                )
            }
            None => (None, None),
        };

        let token = options.token.clone().unwrap_or_else(CancellationToken::new);
        self.claim(id, token.clone())?;

        let now = Utc::now();
        let execution = Execution {
            id,
            machine: config.name.clone(),
            current_state: config.initial.clone(),
            context,
            status: ExecutionStatus::Running,
            parent_id: options.parent_id,
            launched_by: options.launched_by,
            steps: 0,
            attempt: options.attempt.unwrap_or(1).max(1),
            usage: Usage::default(),
            sequence,
            output: None,
            failure: None,
            created_at: created_at.unwrap_or(now),
            updated_at: now,
        };

        if let Err(e) = self.persist_record(&execution).await {
            self.release(id);
            return Err(e);
        }

        self.inner.events.publish(ExecutionEvent::Started {
            execution_id: id,
            machine: config.name.clone(),
            parent_id: options.parent_id,
            attempt: execution.attempt,
        });
        tracing::info!(
            execution_id = %id,
            machine = config.name.as_str(),
            attempt = execution.attempt,
            parent_id = ?options.parent_id,
            "starting execution"
        );

        Ok((execution, token))
    }

    /// Take the initial checkpoint (when persisted) and drive to a terminal status.
    pub(crate) async fn run_prepared(
        &self,
        mut execution: Execution,
        config: Arc<MachineConfig>,
        token: CancellationToken,
    ) -> Execution {
        if config.persistence.enabled
            && let Err(e) = self.checkpoint(&mut execution).await
        {
            self.finish_failure(&mut execution, e).await;
            self.release(execution.id);
            return execution;
        }
        let execution = self.drive(execution, config, token).await;
        self.release(execution.id);
        execution
    }

    fn restore(
        &self,
        checkpoint: CheckpointRecord,
        record: Option<&ExecutionRecord>,
        attempt: Option<u32>,
    ) -> Result<(Execution, CancellationToken), EngineError> {
        let context = restore_context(&checkpoint.context).ok_or_else(|| {
            CheckpointError::Corrupt {
                execution_id: checkpoint.execution_id,
                message: "context snapshot is not an object".to_string(),
            }
        })?;

        let token = CancellationToken::new();
        self.claim(checkpoint.execution_id, token.clone())?;

        let execution = Execution {
            id: checkpoint.execution_id,
            machine: checkpoint.machine,
            current_state: checkpoint.state,
            context,
            status: ExecutionStatus::Running,
            parent_id: record.and_then(|r| r.parent_id),
            launched_by: record.and_then(|r| r.launched_by),
            steps: checkpoint.step_count,
            attempt: attempt.or(record.map(|r| r.attempts)).unwrap_or(1).max(1),
            usage: checkpoint.usage,
            sequence: Some(checkpoint.sequence),
            output: None,
            failure: None,
            created_at: record.map_or(checkpoint.created_at, |r| r.created_at),
            updated_at: Utc::now(),
        };
        Ok((execution, token))
    }

    /// Everything a machine needs must exist before it starts.
    fn check_runnable(&self, config: &MachineConfig) -> Result<(), ConfigError> {
        validate_config(config)?;

        let active = self.inner.backend.name();
        if let Some(requested) = &config.persistence.backend
            && requested != active
        {
            return Err(ConfigError::BackendMismatch {
                requested: requested.clone(),
                active: active.to_string(),
            });
        }
        for agent in referenced_agents(config) {
            if !self.inner.agents.contains(agent) {
                return Err(ConfigError::UnknownAgent(agent.to_string()));
            }
        }
        for machine in referenced_machines(config) {
            if !self.inner.machines.contains(machine) {
                return Err(ConfigError::UnknownMachine(machine.to_string()));
            }
        }
        Ok(())
    }

    /// Register `id` as active. One runner per execution id.
    fn claim(&self, id: Uuid, token: CancellationToken) -> Result<(), EngineError> {
        match self.inner.tokens.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyActive(id)),
            Entry::Vacant(slot) => {
                slot.insert(token);
                Ok(())
            }
        }
    }

    fn release(&self, id: Uuid) {
        self.inner.tokens.remove(&id);
    }

    // -----------------------------------------------------------------------
    // Scheduler loop
    // -----------------------------------------------------------------------

    /// Boxed so nested machine states can recurse through `start`.
    pub(crate) fn drive(
        &self,
        mut execution: Execution,
        config: Arc<MachineConfig>,
        token: CancellationToken,
    ) -> BoxFuture<'_, Execution> {
        Box::pin(async move {
            let started = Instant::now();
            let max_steps = config.max_steps.unwrap_or(self.inner.settings.max_steps);

            loop {
                if token.is_cancelled() {
                    self.finish_failure(&mut execution, EngineError::Cancelled).await;
                    break;
                }

                let state_name = execution.current_state.clone();
                let Some(state) = config.state(&state_name) else {
                    let err = EngineError::Transition {
                        state: state_name.clone(),
                        message: format!("state '{state_name}' does not exist in machine '{}'", config.name),
                    };
                    self.finish_failure(&mut execution, err).await;
                    break;
                };

                if let StateKind::Final { output } = &state.kind {
                    if let Err(e) = self.finish_success(&mut execution, output.as_ref(), started).await {
                        self.finish_failure(&mut execution, e).await;
                    }
                    break;
                }

                if execution.steps >= max_steps {
                    let err = EngineError::Transition {
                        state: state_name,
                        message: format!("exceeded the maximum of {max_steps} steps"),
                    };
                    self.finish_failure(&mut execution, err).await;
                    break;
                }

                self.inner.events.publish(ExecutionEvent::StateEntered {
                    execution_id: execution.id,
                    state: state_name.clone(),
                    kind: state.kind.name().to_string(),
                    step: execution.steps,
                });
                tracing::debug!(
                    execution_id = %execution.id,
                    state = state_name.as_str(),
                    kind = state.kind.name(),
                    step = execution.steps,
                    "entering state"
                );

                match self.step(&mut execution, &state_name, state, &token).await {
                    Ok(next) => {
                        execution.current_state = next;
                        execution.steps += 1;
                        execution.updated_at = Utc::now();

                        if config.persistence.enabled
                            && let Err(e) = self.checkpoint(&mut execution).await
                        {
                            self.finish_failure(&mut execution, e).await;
                            break;
                        }
                        self.record(&execution).await;
                    }
                    Err(e) => {
                        self.finish_failure(&mut execution, e).await;
                        break;
                    }
                }
            }

            execution
        })
    }

    /// Dispatch one non-final state, merge its bindings, and pick the next state.
    async fn step(
        &self,
        execution: &mut Execution,
        state_name: &str,
        state: &StateDef,
        token: &CancellationToken,
    ) -> Result<String, EngineError> {
        let timeout = state
            .timeout_secs
            .or(self.inner.settings.default_state_timeout_secs);

        // Interrupting a state cancels `state_token` and then waits for the
        // dispatch to unwind, so nested executions record their own terminal
        // status and leave the active set before this state fails.
        let state_token = token.child_token();
        let result = {
            let mut work = self.dispatch(execution, state_name, &state.kind, &state_token);
            let deadline = async {
                match timeout {
                    Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                    None => std::future::pending::<()>().await,
                }
            };
            let interrupted = tokio::select! {
                biased;
                _ = token.cancelled() => Err(EngineError::Cancelled),
                _ = deadline => Err(EngineError::Timeout {
                    state: state_name.to_string(),
                    secs: timeout.unwrap_or_default(),
                }),
                result = &mut work => Ok(result),
            };
            match interrupted {
                Ok(result) => result,
                Err(err) => {
                    state_token.cancel();
                    if let Err(unwound) = work.await {
                        tracing::debug!(
                            execution_id = %execution.id,
                            state = state_name,
                            error = %unwound,
                            "interrupted state unwound"
                        );
                    }
                    Err(err)
                }
            }
        }?;

        execution.usage += result.usage;
        apply_bindings(execution, state_name, state, &result)?;
        select_transition(execution, state_name, &state.transitions, &result)
    }

    /// Perform a state's side effect.
    fn dispatch<'a>(
        &'a self,
        execution: &'a Execution,
        state_name: &'a str,
        kind: &'a StateKind,
        token: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<StateResult, EngineError>> {
        Box::pin(async move {
            let frame = Frame::of(execution, state_name);
            match kind {
                StateKind::Agent { agent, input } => {
                    let input = state_input(execution, state_name, input.as_ref())?;
                    let response = self.call_agent(&frame, agent, input.clone(), token).await?;
                    Ok(StateResult {
                        input,
                        output: response.output,
                        usage: response.usage,
                    })
                }
                StateKind::Machine { machine, input } => {
                    let input = state_input(execution, state_name, input.as_ref())?;
                    let (output, usage) = self
                        .run_child(&frame, machine, input.clone(), token.child_token())
                        .await?;
                    Ok(StateResult { input, output, usage })
                }
                StateKind::Parallel { branches, on_error } => {
                    let joined = self
                        .run_parallel(execution, state_name, branches, *on_error, token)
                        .await?;
                    Ok(StateResult {
                        input: Value::Null,
                        output: joined.value,
                        usage: joined.usage,
                    })
                }
                StateKind::Foreach {
                    source,
                    binding,
                    key,
                    branch,
                    on_error,
                } => {
                    let plan = ForeachPlan {
                        source,
                        binding,
                        key: key.as_deref(),
                        branch,
                        mode: *on_error,
                    };
                    let joined = self.run_foreach(execution, state_name, plan, token).await?;
                    Ok(StateResult {
                        input: Value::Null,
                        output: joined.value,
                        usage: joined.usage,
                    })
                }
                StateKind::Launch { machine, input } => {
                    let input = state_input(execution, state_name, input.as_ref())?;
                    let handle = self.launch(machine, input.clone(), Some(execution.id)).await?;
                    Ok(StateResult {
                        input,
                        output: json!({
                            "execution_id": handle.execution_id.to_string(),
                            "result_key": handle.result_key,
                        }),
                        usage: Usage::default(),
                    })
                }
                StateKind::Final { .. } => Err(EngineError::Transition {
                    state: state_name.to_string(),
                    message: "final states are not dispatched".to_string(),
                }),
            }
        })
    }

    /// Invoke an agent; an in-flight call is abandoned when `token` fires.
    pub(crate) async fn call_agent(
        &self,
        frame: &Frame,
        agent: &str,
        input: Value,
        token: &CancellationToken,
    ) -> Result<AgentResponse, EngineError> {
        let invoker = self
            .inner
            .agents
            .get(agent)
            .ok_or_else(|| ConfigError::UnknownAgent(agent.to_string()))?;
        let request = AgentRequest {
            execution_id: frame.execution_id,
            machine: frame.machine.clone(),
            state: frame.state.clone(),
            input,
        };
        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(EngineError::Cancelled),
            response = invoker.invoke(&request) => response,
        };
        response.map_err(|e| EngineError::AgentCall {
            agent: agent.to_string(),
            state: frame.state.clone(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        })
    }

    /// Run a nested machine as a child execution and await its output.
    pub(crate) async fn run_child(
        &self,
        frame: &Frame,
        machine: &str,
        input: Value,
        token: CancellationToken,
    ) -> Result<(Value, Usage), EngineError> {
        let config = self
            .inner
            .machines
            .get(machine)
            .ok_or_else(|| ConfigError::UnknownMachine(machine.to_string()))?;
        let options = RunOptions {
            parent_id: Some(frame.execution_id),
            token: Some(token.clone()),
            ..RunOptions::default()
        };
        let child = self.start(config, input, options).await?;

        match child.status {
            ExecutionStatus::Succeeded => Ok((
                Value::Object(child.output.unwrap_or_default()),
                child.usage,
            )),
            ExecutionStatus::Cancelled if token.is_cancelled() => Err(EngineError::Cancelled),
            _ => Err(EngineError::Child {
                machine: machine.to_string(),
                failure: child.failure.unwrap_or_else(|| {
                    EngineError::Transition {
                        state: child.current_state.clone(),
                        message: format!("child ended as {}", child.status),
                    }
                    .to_failure(&child.current_state)
                }),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Persistence and termination
    // -----------------------------------------------------------------------

    /// Append the next checkpoint in the execution's lineage.
    async fn checkpoint(&self, execution: &mut Execution) -> Result<(), EngineError> {
        let sequence = execution.sequence.map_or(0, |s| s + 1);
        self.inner.checkpoints.save(execution, sequence).await?;
        execution.sequence = Some(sequence);
        self.inner.events.publish(ExecutionEvent::Checkpointed {
            execution_id: execution.id,
            state: execution.current_state.clone(),
            sequence,
        });
        Ok(())
    }

    async fn persist_record(&self, execution: &Execution) -> Result<(), EngineError> {
        self.inner
            .backend
            .upsert_execution(&execution.to_record())
            .await?;
        Ok(())
    }

    /// Best-effort index update; the checkpoint lineage is the source of truth.
    async fn record(&self, execution: &Execution) {
        if let Err(e) = self.persist_record(execution).await {
            tracing::warn!(
                execution_id = %execution.id,
                error = %e,
                "failed to update execution record"
            );
        }
    }

    async fn finish_success(
        &self,
        execution: &mut Execution,
        output: Option<&Mapping>,
        started: Instant,
    ) -> Result<(), EngineError> {
        execution.output = Some(final_output(execution, output)?);
        execution.status = ExecutionStatus::Succeeded;
        let key = self.result_key(execution.id);
        match self.inner.backend.write_result(&key, &execution.outcome()).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(execution_id = %execution.id, key = key.as_str(), "result already published");
            }
            Err(e) => {
                execution.status = ExecutionStatus::Running;
                execution.output = None;
                return Err(e.into());
            }
        }
        execution.updated_at = Utc::now();
        self.record(execution).await;

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.inner.events.publish(ExecutionEvent::Succeeded {
            execution_id: execution.id,
            machine: execution.machine.clone(),
            steps: execution.steps,
            duration_ms,
        });
        tracing::info!(
            execution_id = %execution.id,
            machine = execution.machine.as_str(),
            steps = execution.steps,
            duration_ms,
            "execution succeeded"
        );
        Ok(())
    }

    async fn finish_failure(&self, execution: &mut Execution, err: EngineError) {
        let cancelled = matches!(err, EngineError::Cancelled);
        execution.status = if cancelled {
            ExecutionStatus::Cancelled
        } else {
            ExecutionStatus::Failed
        };
        let failure = err.to_failure(&execution.current_state);
        execution.updated_at = Utc::now();

        if cancelled {
            tracing::info!(execution_id = %execution.id, "execution cancelled");
            self.inner.events.publish(ExecutionEvent::Cancelled {
                execution_id: execution.id,
            });
        } else {
            tracing::warn!(
                execution_id = %execution.id,
                machine = execution.machine.as_str(),
                state = execution.current_state.as_str(),
                error_type = failure.error_type.as_str(),
                retryable = failure.retryable,
                error = %err,
                "execution failed"
            );
            self.inner.events.publish(ExecutionEvent::Failed {
                execution_id: execution.id,
                machine: execution.machine.clone(),
                error_type: failure.error_type.clone(),
                summary: failure.summary.clone(),
            });
        }

        execution.failure = Some(failure);
        self.record(execution).await;
    }
}

// ---------------------------------------------------------------------------
// Expression helpers
// ---------------------------------------------------------------------------
//
// Kept synchronous: the evaluator is not `Send` and must never live across
// an await point.

/// Input object copied into the context, then the `context` initialisers.
fn initial_context(config: &MachineConfig, id: Uuid, input: &Value) -> Result<Mapping, EngineError> {
    let mut context = seed_context(input);
    if !config.context.is_empty() {
        let scope = Scope::new(&context, id, &config.name, &config.initial, 0)
            .with_input(input.clone())
            .into_value();
        let init = ExpressionEvaluator::new()
            .evaluate_mapping(&config.context, &scope)
            .map_err(|source| EngineError::Expression {
                state: config.initial.clone(),
                source,
            })?;
        context.extend(init);
    }
    Ok(context)
}

/// The evaluated `output` mapping of a final state, or the whole context.
fn final_output(execution: &Execution, mapping: Option<&Mapping>) -> Result<Mapping, EngineError> {
    let Some(mapping) = mapping else {
        return Ok(execution.context.clone());
    };
    let scope = Scope::new(
        &execution.context,
        execution.id,
        &execution.machine,
        &execution.current_state,
        execution.steps,
    )
    .into_value();
    ExpressionEvaluator::new()
        .evaluate_mapping(mapping, &scope)
        .map_err(|source| EngineError::Expression {
            state: execution.current_state.clone(),
            source,
        })
}

/// The evaluated `input` mapping, or the whole context when none is declared.
pub(crate) fn state_input(
    execution: &Execution,
    state: &str,
    mapping: Option<&Mapping>,
) -> Result<Value, EngineError> {
    match mapping {
        Some(mapping) => {
            let scope = Scope::new(
                &execution.context,
                execution.id,
                &execution.machine,
                state,
                execution.steps,
            )
            .into_value();
            ExpressionEvaluator::new()
                .evaluate_mapping(mapping, &scope)
                .map(Value::Object)
                .map_err(|source| EngineError::Expression {
                    state: state.to_string(),
                    source,
                })
        }
        None => Ok(Value::Object(execution.context.clone())),
    }
}

fn apply_bindings(
    execution: &mut Execution,
    state_name: &str,
    state: &StateDef,
    result: &StateResult,
) -> Result<(), EngineError> {
    if state.output_to_context.is_empty() {
        return Ok(());
    }
    let scope = Scope::new(
        &execution.context,
        execution.id,
        &execution.machine,
        state_name,
        execution.steps,
    )
    .with_input(result.input.clone())
    .with_output(result.output.clone())
    .into_value();
    let updates = ExpressionEvaluator::new()
        .evaluate_mapping(&state.output_to_context, &scope)
        .map_err(|source| EngineError::Expression {
            state: state_name.to_string(),
            source,
        })?;
    execution.context.extend(updates);
    Ok(())
}

/// First transition whose guard holds, in declared order.
fn select_transition(
    execution: &Execution,
    state_name: &str,
    transitions: &[Transition],
    result: &StateResult,
) -> Result<String, EngineError> {
    let scope = Scope::new(
        &execution.context,
        execution.id,
        &execution.machine,
        state_name,
        execution.steps,
    )
    .with_input(result.input.clone())
    .with_output(result.output.clone())
    .into_value();
    let evaluator = ExpressionEvaluator::new();

    for transition in transitions {
        let Some(condition) = &transition.condition else {
            return Ok(transition.to.clone());
        };
        let matched = evaluator
            .evaluate_bool(condition, &scope)
            .map_err(|e| EngineError::Transition {
                state: state_name.to_string(),
                message: format!("guard failed: {e}"),
            })?;
        if matched {
            return Ok(transition.to.clone());
        }
    }

    Err(EngineError::Transition {
        state: state_name.to_string(),
        message: "no transition matched".to_string(),
    })
}

fn failure_payload(err: &EngineError, last_state: &str) -> Value {
    json!({
        "success": false,
        "error_type": err.error_type(),
        "summary": err.to_string(),
        "last_state": last_state,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
