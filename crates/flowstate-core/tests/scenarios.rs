//! End-to-end workflow scenarios against the in-memory backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use flowstate_core::agent::{AgentError, AgentRequest, AgentResponse, FnAgent};
use flowstate_core::engine::{Engine, EngineError};
use flowstate_core::lifecycle::ExecutionManager;
use flowstate_core::machine::definition::parse_machine_yaml;
use flowstate_core::repository::{ExecutionStore, InMemoryBackend};
use flowstate_types::config::{Backoff, EngineSettings, RetryPolicy};
use flowstate_types::event::ExecutionEvent;
use flowstate_types::execution::{ExecutionFilter, ExecutionRecord, ExecutionStatus, Usage};
use serde_json::{json, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

const CHAR_BUILD: &str = r#"
name: char_build
initial: build
context:
  result: "''"
persistence:
  enabled: true
states:
  build:
    agent: append
    output_to_context:
      result: output.result
    transitions:
      - condition: context.result == context.target
        to: done
      - to: build
  done:
    final: true
    output:
      result: context.result
"#;

const TRIAGE: &str = r#"
name: triage
initial: analyze
states:
  analyze:
    parallel:
      - agent: classify
        input:
          message: context.customer_message
      - agent: assess_urgency
        input:
          message: context.customer_message
          tier: context.customer_tier
    output_to_context:
      category: output[0].category
      urgency: output[1].urgency
    transitions:
      - to: draft
  draft:
    agent: draft_response
    input:
      ticket: context.ticket_id
      category: context.category
    output_to_context:
      response: output
    transitions:
      - condition: context.response.body|length > 0
        to: done
  done:
    final: true
    output:
      ticket_id: context.ticket_id
      category: context.category
      urgency: context.urgency
      needs_response: true
      response:
        subject: context.response.subject
        body: context.response.body
"#;

const WORKER_NODE: &str = r#"
name: worker_node
initial: work
states:
  work:
    foreach: context.tasks
    as: task
    agent: do_task
    input:
      task: task
    output_to_context:
      results: output
    transitions:
      - to: done
  done:
    final: true
    output:
      results: context.results
"#;

const ORCHESTRATOR: &str = r#"
name: orchestrator
initial: dispatch
states:
  dispatch:
    launch: worker_node
    input:
      tasks: context.tasks
    output_to_context:
      worker_id: output.execution_id
      worker_result: output.result_key
    transitions:
      - to: done
  done:
    final: true
    output:
      worker_id: context.worker_id
      worker_result: context.worker_result
"#;

const NAPPER: &str = r#"
name: napper
initial: nap
states:
  nap:
    agent: sleepy
    transitions:
      - to: done
  done:
    final: true
"#;

fn engine() -> Engine<InMemoryBackend> {
    engine_with(EngineSettings::default())
}

fn engine_with(settings: EngineSettings) -> Engine<InMemoryBackend> {
    let engine = Engine::new(Arc::new(InMemoryBackend::new()), settings);
    let agents = engine.agents();

    agents.register(
        "append",
        FnAgent::new(|req: AgentRequest| async move {
            let target = req.input["target"].as_str().unwrap_or_default();
            let current = req.input["result"].as_str().unwrap_or_default();
            let next: String = target.chars().take(current.chars().count() + 1).collect();
            Ok(AgentResponse::new(json!({ "result": next })).with_usage(1, 0.001))
        }),
    );
    agents.register(
        "classify",
        FnAgent::new(|req: AgentRequest| async move {
            let message = req.input["message"].as_str().unwrap_or_default();
            let category = if message.contains("charged") { "billing" } else { "general" };
            Ok(AgentResponse::new(json!({ "category": category })))
        }),
    );
    agents.register(
        "assess_urgency",
        FnAgent::new(|req: AgentRequest| async move {
            let urgency = if req.input["tier"] == "pro" { "high" } else { "normal" };
            Ok(AgentResponse::new(json!({ "urgency": urgency })))
        }),
    );
    agents.register(
        "draft_response",
        FnAgent::new(|req: AgentRequest| async move {
            let category = req.input["category"].as_str().unwrap_or_default().to_string();
            let ticket = req.input["ticket"].as_str().unwrap_or_default().to_string();
            Ok(AgentResponse::new(json!({
                "subject": format!("[{ticket}] Your {category} question"),
                "body": "We are looking into the duplicate charge.",
            })))
        }),
    );
    agents.register(
        "do_task",
        FnAgent::new(|req: AgentRequest| async move {
            let task = req.input["task"].as_str().unwrap_or_default();
            // later tasks finish first
            let delay = if task == "t1" { 30 } else { 1 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(AgentResponse::new(json!({ "task": task, "done": true })))
        }),
    );
    agents.register(
        "sleepy",
        FnAgent::new(|req: AgentRequest| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(AgentResponse::new(req.input))
        }),
    );
    agents.register(
        "broken",
        FnAgent::new(|_req: AgentRequest| async {
            Err::<AgentResponse, _>(AgentError::Fatal("cannot handle this".into()))
        }),
    );
    engine
}

// ---------------------------------------------------------------------------
// Scenario A: character build
// ---------------------------------------------------------------------------

#[tokio::test]
async fn char_build_appends_one_character_per_transition() {
    let engine = engine();
    let config = parse_machine_yaml(CHAR_BUILD).unwrap();

    let execution = engine.run(&config, json!({ "target": "Hi" })).await.unwrap();
    assert_eq!(execution.outcome(), json!({ "success": true, "result": "Hi" }));
    assert_eq!(execution.steps, 2);
    assert_eq!(execution.usage, Usage::new(2, 0.002));

    let states: Vec<String> = engine
        .checkpoints()
        .history(execution.id)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.state)
        .collect();
    assert_eq!(states, vec!["build", "build", "done"]);

    let record = engine.backend().get_execution(&execution.id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Succeeded);
    assert_eq!(record.total_api_calls, 2);
}

#[tokio::test]
async fn max_steps_stops_runaway_cycles() {
    let engine = engine();
    let yaml = CHAR_BUILD.replace("initial: build", "initial: build\nmax_steps: 3");
    let config = parse_machine_yaml(&yaml).unwrap();

    let execution = engine.run(&config, json!({ "target": "Hello" })).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    let failure = execution.failure.unwrap();
    assert_eq!(failure.error_type, "TransitionError");
    assert!(failure.summary.contains("maximum of 3 steps"));
    assert_eq!(execution.steps, 3);
}

// ---------------------------------------------------------------------------
// Resume equivalence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resumed_run_matches_uninterrupted_run() {
    let baseline = engine();
    let config = parse_machine_yaml(CHAR_BUILD).unwrap();
    let expected = baseline
        .run(&config, json!({ "target": "Flow" }))
        .await
        .unwrap()
        .outcome();

    // Same machine, but the third append call fails once.
    let interrupted = engine();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    interrupted.agents().register(
        "append",
        FnAgent::new(move |req: AgentRequest| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 2 {
                    return Err(AgentError::Fatal("process crashed".into()));
                }
                let target = req.input["target"].as_str().unwrap_or_default();
                let current = req.input["result"].as_str().unwrap_or_default();
                let next: String = target.chars().take(current.chars().count() + 1).collect();
                Ok(AgentResponse::new(json!({ "result": next })))
            }
        }),
    );

    let failed = interrupted.run(&config, json!({ "target": "Flow" })).await.unwrap();
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert_eq!(failed.context["result"], "Fl");

    let resumed = interrupted.resume(failed.id).await.unwrap();
    assert_eq!(resumed.outcome(), expected);
    // two completed calls, one failure, then the remaining two: no replay
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    let sequences: Vec<u64> = interrupted
        .checkpoints()
        .history(failed.id)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.sequence)
        .collect();
    assert_eq!(sequences, (0..sequences.len() as u64).collect::<Vec<_>>());
}

// ---------------------------------------------------------------------------
// Scenario B: triage
// ---------------------------------------------------------------------------

#[tokio::test]
async fn triage_joins_parallel_analysis_into_response() {
    let engine = engine();
    let config = parse_machine_yaml(TRIAGE).unwrap();

    let outcome = engine
        .run(
            &config,
            json!({
                "ticket_id": "TCK-1042",
                "customer_message": "My account was charged twice for the same order.",
                "customer_tier": "pro",
            }),
        )
        .await
        .unwrap()
        .outcome();

    assert_eq!(outcome["success"], true);
    assert_eq!(outcome["ticket_id"], "TCK-1042");
    assert_eq!(outcome["category"], "billing");
    assert_eq!(outcome["urgency"], "high");
    assert_eq!(outcome["needs_response"], true);
    assert_eq!(outcome["response"]["subject"], "[TCK-1042] Your billing question");
    assert!(outcome["response"]["body"].as_str().unwrap().contains("duplicate"));
}

// ---------------------------------------------------------------------------
// Scenario C: peering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn orchestrator_launches_worker_and_reads_result_later() {
    let engine = engine();
    engine.register_machine(parse_machine_yaml(WORKER_NODE).unwrap()).unwrap();
    let orchestrator = parse_machine_yaml(ORCHESTRATOR).unwrap();

    let launcher = engine
        .run(&orchestrator, json!({ "tasks": ["t1", "t2"] }))
        .await
        .unwrap();
    assert!(launcher.is_success());

    let outcome = launcher.outcome();
    let worker_id: Uuid = outcome["worker_id"].as_str().unwrap().parse().unwrap();
    assert_eq!(
        outcome["worker_result"],
        format!("flowstate://{worker_id}/result")
    );

    let result = engine
        .wait_for_result(worker_id, Duration::from_millis(5), Duration::from_secs(5))
        .await
        .unwrap();
    let results = result["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    // input order, even though t2 finished first
    assert_eq!(results[0]["task"], "t1");
    assert_eq!(results[1]["task"], "t2");

    let worker = engine.backend().get_execution(&worker_id).await.unwrap().unwrap();
    assert_eq!(worker.launched_by, Some(launcher.id));
    assert_eq!(worker.parent_id, None);
}

#[tokio::test]
async fn cancelling_launcher_leaves_launched_execution_running() {
    let engine = engine();
    engine
        .register_machine(
            parse_machine_yaml(
                r#"
name: slow_worker
initial: nap
states:
  nap:
    agent: sleepy
    timeout_secs: 1
    transitions:
      - to: done
  done:
    final: true
"#,
            )
            .unwrap(),
        )
        .unwrap();
    let launcher_config = parse_machine_yaml(
        r#"
name: launcher
initial: fire
states:
  fire:
    launch: slow_worker
    output_to_context:
      worker: output.execution_id
    transitions:
      - to: hold
  hold:
    agent: sleepy
    transitions:
      - to: done
  done:
    final: true
"#,
    )
    .unwrap();

    let mut events = engine.subscribe();
    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(&launcher_config, json!({})).await })
    };

    let (launcher_id, worker_id) = loop {
        if let ExecutionEvent::Launched {
            execution_id,
            launched_by: Some(by),
            ..
        } = events.recv().await.unwrap()
        {
            break (by, execution_id);
        }
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(engine.cancel(launcher_id));

    let launcher = runner.await.unwrap().unwrap();
    assert_eq!(launcher.status, ExecutionStatus::Cancelled);
    assert_eq!(launcher.outcome()["error_type"], "Cancelled");

    // the worker was not cancelled; it runs until its own state timeout
    let err = engine
        .wait_for_result(worker_id, Duration::from_millis(10), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Child { .. }));
    assert_eq!(err.error_type(), "TimeoutError");
    let worker = engine.backend().get_execution(&worker_id).await.unwrap().unwrap();
    assert_eq!(worker.status, ExecutionStatus::Failed);
}

// ---------------------------------------------------------------------------
// Retry scenario
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_failure_then_success_records_two_attempts() {
    let engine = engine();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    engine.agents().register(
        "flaky",
        FnAgent::new(move |req: AgentRequest| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(AgentError::Transient("503 from upstream".into()))
                } else {
                    Ok(AgentResponse::new(req.input))
                }
            }
        }),
    );
    let config = parse_machine_yaml(
        r#"
name: flaky_call
initial: call
persistence:
  enabled: true
states:
  call:
    agent: flaky
    transitions:
      - to: done
  done:
    final: true
"#,
    )
    .unwrap();

    let policy = RetryPolicy::default()
        .with_max_attempts(3)
        .with_backoff(Backoff::Fixed { delay_ms: 1 });
    let manager = ExecutionManager::new(engine, policy);
    let execution = manager.run(&config, json!({ "q": 1 })).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    let record = manager.get(execution.id).await.unwrap().unwrap();
    assert_eq!(record.attempts, 2);
    assert_eq!(record.status, ExecutionStatus::Succeeded);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// ---------------------------------------------------------------------------
// Nested machines and joins
// ---------------------------------------------------------------------------

#[tokio::test]
async fn nested_machine_output_becomes_state_output() {
    let engine = engine();
    engine.register_machine(parse_machine_yaml(CHAR_BUILD).unwrap()).unwrap();
    let parent = parse_machine_yaml(
        r#"
name: parent
initial: delegate
states:
  delegate:
    machine: char_build
    input:
      target: "'ok'"
    output_to_context:
      built: output.result
    transitions:
      - to: done
  done:
    final: true
    output:
      built: context.built
"#,
    )
    .unwrap();

    let execution = engine.run(&parent, json!({})).await.unwrap();
    assert_eq!(execution.outcome()["built"], "ok");
    assert_eq!(execution.usage.api_calls, 2);

    let children = children_of(&engine, execution.id).await;
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].machine, "char_build");
    assert_eq!(children[0].status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn fail_fast_join_cancels_slow_siblings() {
    let engine = engine();
    let config = parse_machine_yaml(
        r#"
name: fan
initial: both
states:
  both:
    parallel:
      - agent: sleepy
      - agent: broken
    transitions:
      - to: done
  done:
    final: true
"#,
    )
    .unwrap();

    let started = std::time::Instant::now();
    let execution = engine.run(&config, json!({})).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    let failure = execution.failure.unwrap();
    assert_eq!(failure.error_type, "ConcurrencyError");
    assert!(!failure.retryable);
    assert_eq!(failure.last_state, "both");
}

#[tokio::test]
async fn collect_join_reports_partial_results() {
    let engine = engine();
    let config = parse_machine_yaml(
        r#"
name: fan_collect
initial: both
states:
  both:
    on_error: collect
    parallel:
      - agent: classify
        input:
          message: "'charged'"
      - agent: broken
    output_to_context:
      results: output
    transitions:
      - to: done
  done:
    final: true
"#,
    )
    .unwrap();

    let outcome = engine.run(&config, json!({})).await.unwrap().outcome();
    assert_eq!(outcome["success"], true);
    let results = &outcome["results"];
    assert_eq!(results[0]["status"], "succeeded");
    assert_eq!(results[0]["value"]["category"], "billing");
    assert_eq!(results[1]["status"], "failed");
    assert_eq!(results[1]["error"]["error_type"], "AgentCallError");
}

#[tokio::test]
async fn keyed_foreach_joins_into_mapping() {
    let engine = engine();
    let config = parse_machine_yaml(
        r#"
name: keyed
initial: each
states:
  each:
    foreach: context.tasks
    as: task
    key: task|upper
    agent: do_task
    output_to_context:
      by_task: output
    transitions:
      - to: done
  done:
    final: true
"#,
    )
    .unwrap();

    let outcome = engine
        .run(&config, json!({ "tasks": ["t1", "t2"] }))
        .await
        .unwrap()
        .outcome();
    let by_task = outcome["by_task"].as_object().unwrap();
    assert_eq!(by_task.len(), 2);
    assert_eq!(by_task["T1"]["task"], "t1");
    assert_eq!(by_task["T2"]["task"], "t2");
}

/// Child executions of `parent`, as recorded in the execution index.
async fn children_of(
    engine: &Engine<InMemoryBackend>,
    parent: Uuid,
) -> Vec<ExecutionRecord> {
    engine
        .backend()
        .list_executions(&ExecutionFilter {
            parent_id: Some(parent),
            ..Default::default()
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn fail_fast_join_settles_nested_children() {
    let engine = engine();
    engine.register_machine(parse_machine_yaml(NAPPER).unwrap()).unwrap();
    engine.agents().register(
        "late_failure",
        FnAgent::new(|_req: AgentRequest| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err::<AgentResponse, _>(AgentError::Fatal("gave up".into()))
        }),
    );
    let config = parse_machine_yaml(
        r#"
name: fan_nested
initial: both
states:
  both:
    parallel:
      - machine: napper
      - agent: late_failure
    transitions:
      - to: done
  done:
    final: true
"#,
    )
    .unwrap();

    let execution = engine.run(&config, json!({})).await.unwrap();
    assert_eq!(execution.failure.unwrap().error_type, "ConcurrencyError");

    let children = children_of(&engine, execution.id).await;
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].machine, "napper");
    assert_eq!(children[0].status, ExecutionStatus::Cancelled);
    assert!(!engine.is_active(children[0].id));

    let manager = ExecutionManager::from_settings(engine.clone());
    assert!(manager.delete(children[0].id, false).await.unwrap());
}

#[tokio::test]
async fn state_timeout_settles_nested_child() {
    let engine = engine();
    engine.register_machine(parse_machine_yaml(NAPPER).unwrap()).unwrap();
    let config = parse_machine_yaml(
        r#"
name: impatient
initial: delegate
states:
  delegate:
    machine: napper
    timeout_secs: 1
    transitions:
      - to: done
  done:
    final: true
"#,
    )
    .unwrap();

    let started = std::time::Instant::now();
    let execution = engine.run(&config, json!({})).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    let failure = execution.failure.unwrap();
    assert_eq!(failure.error_type, "TimeoutError");
    assert_eq!(failure.last_state, "delegate");

    let children = children_of(&engine, execution.id).await;
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].status, ExecutionStatus::Cancelled);
    assert!(!engine.is_active(children[0].id));
    assert!(!engine.is_active(execution.id));
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_stops_a_running_execution() {
    let engine = engine();
    let config = parse_machine_yaml(NAPPER).unwrap();

    let mut events = engine.subscribe();
    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(&config, json!({})).await })
    };

    let id = loop {
        if let ExecutionEvent::StateEntered { execution_id, .. } = events.recv().await.unwrap() {
            break execution_id;
        }
    };
    assert!(engine.is_active(id));
    assert!(engine.cancel(id));

    let execution = runner.await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert!(!engine.is_active(id));
    assert!(!engine.cancel(id));

    let record = engine.backend().get_execution(&id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Cancelled);
}

#[tokio::test]
async fn cancelling_a_parent_cancels_its_nested_child() {
    let engine = engine();
    engine.register_machine(parse_machine_yaml(NAPPER).unwrap()).unwrap();
    let config = parse_machine_yaml(
        r#"
name: delegator
initial: delegate
states:
  delegate:
    machine: napper
    transitions:
      - to: done
  done:
    final: true
"#,
    )
    .unwrap();

    let mut events = engine.subscribe();
    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(&config, json!({})).await })
    };

    let mut parent = None;
    let mut child = None;
    while child.is_none() {
        if let ExecutionEvent::StateEntered { execution_id, state, .. } = events.recv().await.unwrap() {
            match state.as_str() {
                "delegate" => parent = Some(execution_id),
                "nap" => child = Some(execution_id),
                _ => {}
            }
        }
    }
    let (parent, child) = (parent.unwrap(), child.unwrap());
    assert!(engine.cancel(parent));

    let execution = runner.await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    let record = engine.backend().get_execution(&child).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Cancelled);
    assert_eq!(record.parent_id, Some(parent));
    assert!(!engine.is_active(child));
}

#[tokio::test]
async fn execute_never_raises() {
    let engine = engine();
    engine.register_machine(parse_machine_yaml(CHAR_BUILD).unwrap()).unwrap();

    let ok: Value = engine.execute("char_build", json!({ "target": "ab" })).await;
    assert_eq!(ok["result"], "ab");

    let resumed = engine.execute_resume(Uuid::now_v7()).await;
    assert_eq!(resumed["success"], false);
    assert_eq!(resumed["error_type"], "NotFound");

    let err = engine.resume(Uuid::now_v7()).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}
