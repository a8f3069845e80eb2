// End-to-end engine behavior over the in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use subflow_core::forms::{form, FieldKind, FormPage};
use subflow_core::state;
use subflow_core::state::State;
use subflow_core::step::{callback_step, inputstep, step, retrystep, CALLBACK_TOKEN_KEY};
use subflow_core::steps::{done, init};
use subflow_core::workflow::workflow;
use subflow_core::{Assignee, StepFailure};
use subflow_engine::{DistLock, Engine, EngineConfig, EngineError, MemoryDistLock, TASK_RESUME_WORKFLOWS};
use subflow_storage::{InMemoryProcessStore, ProcessFilter, ProcessStore};

struct TestBed {
    engine: Engine,
    store: Arc<InMemoryProcessStore>,
    locks: Arc<MemoryDistLock>,
}

fn testbed() -> TestBed {
    testbed_with(EngineConfig {
        testing: true,
        ..Default::default()
    })
}

fn testbed_with(config: EngineConfig) -> TestBed {
    let store = Arc::new(InMemoryProcessStore::new());
    let locks = Arc::new(MemoryDistLock::new());
    let engine = Engine::builder(store.clone())
        .config(config)
        .locks(locks.clone())
        .build()
        .expect("engine should build");
    TestBed {
        engine,
        store,
        locks,
    }
}

fn sample_steps() -> subflow_core::StepList {
    let s1 = step("Step 1").build(|_| Ok(state!({"steps": [1]})));
    let s2 = step("Step 2").arg("steps").build(|mut args| {
        let mut steps: Vec<i64> = args.take("steps")?;
        steps.push(2);
        Ok(state!({"steps": steps}))
    });
    let s3 = step("Step 3").arg("steps").build(|mut args| {
        let mut steps: Vec<i64> = args.take("steps")?;
        steps.push(3);
        Ok(state!({"steps": steps}))
    });
    init() >> s1 >> s2 >> s3 >> done()
}

async fn statuses(store: &InMemoryProcessStore, process_id: Uuid) -> Vec<(String, String)> {
    store
        .list_steps(process_id)
        .await
        .unwrap()
        .into_iter()
        .map(|row| (row.name, row.status))
        .collect()
}

// ---------------------------------------------------------------------
// Happy path, suspend/resume, waiting retry
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_happy_path_runs_to_completion() {
    let bed = testbed();
    bed.engine
        .registry()
        .register("sample", || workflow("Sample").build(sample_steps()))
        .unwrap();

    let process_id = bed
        .engine
        .start("sample", vec![State::new()], "john.doe", None)
        .await
        .unwrap();

    let details = bed.engine.get_process(process_id).await.unwrap();
    assert_eq!(details.process.last_status, "completed");
    assert_eq!(
        statuses(&bed.store, process_id).await,
        vec![
            ("Start".to_string(), "success".to_string()),
            ("Step 1".to_string(), "success".to_string()),
            ("Step 2".to_string(), "success".to_string()),
            ("Step 3".to_string(), "success".to_string()),
            ("Done".to_string(), "complete".to_string()),
        ]
    );
    let final_state = &details.steps.last().unwrap().state;
    assert_eq!(final_state["steps"], serde_json::json!([1, 2, 3]));
}

#[tokio::test]
async fn test_suspend_and_resume_with_form_input() {
    let bed = testbed();
    bed.engine
        .registry()
        .register("interactive", || {
            let s1 = step("Step 1").build(|_| Ok(state!({"steps": [1]})));
            let ask = inputstep(
                "Input Name",
                Assignee::Changes,
                form(FormPage::new("Name").field("name", FieldKind::Text)),
            );
            let s2 = step("Step 2").arg("name").build(|mut args| {
                let name: String = args.take("name")?;
                Ok(state!({"greeting": format!("hello {name}")}))
            });
            workflow("Interactive").build(init() >> s1 >> ask >> s2 >> done())
        })
        .unwrap();

    let process_id = bed
        .engine
        .start("interactive", vec![State::new()], "john.doe", None)
        .await
        .unwrap();

    let details = bed.engine.get_process(process_id).await.unwrap();
    assert_eq!(details.process.last_status, "suspended");
    assert_eq!(details.process.assignee, "CHANGES");

    // Invalid input does not alter the process.
    let err = bed
        .engine
        .resume(process_id, vec![state!({})], "john.doe")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "form_validation_error");
    assert_eq!(
        bed.engine
            .get_process(process_id)
            .await
            .unwrap()
            .process
            .last_status,
        "suspended"
    );

    bed.engine
        .resume(process_id, vec![state!({"name": "A"})], "john.doe")
        .await
        .unwrap();

    let details = bed.engine.get_process(process_id).await.unwrap();
    assert_eq!(details.process.last_status, "completed");
    // The suspend row was rewritten to success: still five rows.
    assert_eq!(
        statuses(&bed.store, process_id).await,
        vec![
            ("Start".to_string(), "success".to_string()),
            ("Step 1".to_string(), "success".to_string()),
            ("Input Name".to_string(), "success".to_string()),
            ("Step 2".to_string(), "success".to_string()),
            ("Done".to_string(), "complete".to_string()),
        ]
    );
    let final_state = &details.steps.last().unwrap().state;
    assert_eq!(final_state["name"], "A");
    assert_eq!(final_state["greeting"], "hello A");
}

#[tokio::test]
async fn test_waiting_step_retried_by_resume_waiting() {
    let bed = testbed();
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_in_step = attempts.clone();

    bed.engine
        .registry()
        .register("flaky", move || {
            let attempts = attempts_in_step.clone();
            let flaky = retrystep("Provision upstream").build(move |_| {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(StepFailure::msg("upstream not ready"))
                } else {
                    Ok(state!({"provisioned": true}))
                }
            });
            workflow("Flaky provisioning").build(init() >> flaky >> done())
        })
        .unwrap();

    let process_id = bed
        .engine
        .start("flaky", vec![State::new()], "john.doe", None)
        .await
        .unwrap();

    let details = bed.engine.get_process(process_id).await.unwrap();
    assert_eq!(details.process.last_status, "waiting");
    assert_eq!(details.process.failed_reason.as_deref(), Some("upstream not ready"));
    let waiting_row = details.steps.last().unwrap();
    assert_eq!(waiting_row.status, "waiting");
    assert_eq!(waiting_row.state["retries"], 1);
    assert_eq!(waiting_row.state["executed_at"].as_array().unwrap().len(), 1);

    // The sweeper task picks it up and drives it to completion.
    let task_id = bed.engine.resume_waiting().await.unwrap();

    let details = bed.engine.get_process(process_id).await.unwrap();
    assert_eq!(details.process.last_status, "completed");
    // The waiting row was updated in place, history preserved.
    let retried = details
        .steps
        .iter()
        .find(|row| row.name == "Provision upstream")
        .unwrap();
    assert_eq!(retried.status, "success");
    assert_eq!(retried.state["executed_at"].as_array().unwrap().len(), 1);
    assert_eq!(
        details
            .steps
            .iter()
            .filter(|row| row.name == "Provision upstream")
            .count(),
        1
    );

    // The sweeper itself ran as a completed task process.
    let task = bed.engine.get_process(task_id).await.unwrap();
    assert_eq!(task.process.workflow_name, TASK_RESUME_WORKFLOWS);
    assert!(task.process.is_task);
    assert_eq!(task.process.last_status, "completed");
    let find_row = task
        .steps
        .iter()
        .find(|row| row.name == "Find waiting workflows")
        .unwrap();
    assert_eq!(find_row.state["number_of_waiting_processes"], 1);
}

// ---------------------------------------------------------------------
// Failure deduplication
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_repeated_failures_deduplicate_into_one_row() {
    let bed = testbed();
    bed.engine
        .registry()
        .register("doomed", || {
            let fail = step("Fail").build(|_| Err(StepFailure::msg("nope")));
            workflow("Doomed").build(init() >> fail >> done())
        })
        .unwrap();

    let process_id = bed
        .engine
        .start("doomed", vec![State::new()], "john.doe", None)
        .await
        .unwrap();
    for _ in 0..2 {
        bed.engine
            .resume(process_id, vec![State::new()], "john.doe")
            .await
            .unwrap();
    }

    let details = bed.engine.get_process(process_id).await.unwrap();
    assert_eq!(details.process.last_status, "failed");
    assert_eq!(details.steps.len(), 2, "Start plus one deduplicated Fail row");

    let fail_row = details.steps.last().unwrap();
    assert_eq!(fail_row.status, "failed");
    assert_eq!(fail_row.state["retries"], 3);
    assert_eq!(fail_row.state["executed_at"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_assertion_failure_routes_to_noc() {
    let bed = testbed();
    bed.engine
        .registry()
        .register("inconsistent", || {
            let check = step("Check data").build(|_| {
                Err(StepFailure::inconsistent("subscription has no ports"))
            });
            workflow("Validate data").build(init() >> check >> done())
        })
        .unwrap();

    let process_id = bed
        .engine
        .start("inconsistent", vec![State::new()], "john.doe", None)
        .await
        .unwrap();

    let details = bed.engine.get_process(process_id).await.unwrap();
    assert_eq!(details.process.last_status, "inconsistent_data");
    assert_eq!(details.process.assignee, "NOC");
}

// ---------------------------------------------------------------------
// Abort
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_abort_suspended_process_is_idempotent() {
    let bed = testbed();
    bed.engine
        .registry()
        .register("stuck", || {
            let ask = inputstep(
                "Input Name",
                Assignee::System,
                form(FormPage::new("Name").field("name", FieldKind::Text)),
            );
            workflow("Stuck").build(init() >> ask >> done())
        })
        .unwrap();

    let process_id = bed
        .engine
        .start("stuck", vec![State::new()], "john.doe", None)
        .await
        .unwrap();

    bed.engine.abort(process_id, "john.doe").await.unwrap();
    let details = bed.engine.get_process(process_id).await.unwrap();
    assert_eq!(details.process.last_status, "aborted");
    let last = details.steps.last().unwrap();
    assert_eq!(last.name, "User Aborted");
    assert_eq!(last.status, "abort");
    let rows_before = details.steps.len();

    // A second abort is a no-op.
    bed.engine.abort(process_id, "john.doe").await.unwrap();
    let details = bed.engine.get_process(process_id).await.unwrap();
    assert_eq!(details.process.last_status, "aborted");
    assert_eq!(details.steps.len(), rows_before);

    // And an aborted process cannot be resumed.
    let err = bed
        .engine
        .resume(process_id, vec![State::new()], "john.doe")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "conflict");
}

// ---------------------------------------------------------------------
// Start preconditions
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_start_preconditions_persist_nothing() {
    let bed = testbed();
    bed.engine
        .registry()
        .register("guarded", || {
            workflow("Guarded")
                .run_predicate(|| false)
                .build(init() >> done())
        })
        .unwrap();
    bed.engine
        .registry()
        .register("restricted", || {
            workflow("Restricted")
                .authorize(|principal| principal.is_some())
                .build(init() >> done())
        })
        .unwrap();
    bed.engine
        .registry()
        .register("with_form", || {
            workflow("With form")
                .with_form(form(FormPage::new("Input").field("speed", FieldKind::Number)))
                .build(init() >> done())
        })
        .unwrap();

    let err = bed
        .engine
        .start("missing", vec![], "john.doe", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "workflow_not_found");

    let err = bed
        .engine
        .start("guarded", vec![State::new()], "john.doe", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "start_predicate_error");

    let err = bed
        .engine
        .start("restricted", vec![State::new()], "john.doe", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");

    // No submitted pages: the next form schema is reported.
    let err = bed
        .engine
        .start("with_form", vec![], "john.doe", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "form_not_complete");

    let err = bed
        .engine
        .start("with_form", vec![state!({"speed": "fast"})], "john.doe", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "form_validation_error");

    assert_eq!(bed.store.process_count(), 0);
}

// ---------------------------------------------------------------------
// Pause / engine settings
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_pause_refuses_new_work_and_clears() {
    let bed = testbed();
    bed.engine
        .registry()
        .register("sample", || workflow("Sample").build(sample_steps()))
        .unwrap();
    bed.engine
        .registry()
        .register("stuck", || {
            let ask = inputstep(
                "Input Name",
                Assignee::System,
                form(FormPage::new("Name").field("name", FieldKind::Text)),
            );
            workflow("Stuck").build(init() >> ask >> done())
        })
        .unwrap();

    // Suspend one process while the engine is running.
    let suspended = bed
        .engine
        .start("stuck", vec![State::new()], "john.doe", None)
        .await
        .unwrap();

    let status = bed.engine.set_engine_pause(true).await.unwrap();
    assert_eq!(status.status, "paused");
    assert!(status.global_lock);
    assert_eq!(status.running_processes, 0);

    // New starts and resumes are refused while paused.
    let err = bed
        .engine
        .start("sample", vec![State::new()], "john.doe", None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ServiceUnavailable));

    let rows_before = bed.store.list_steps(suspended).await.unwrap().len();
    let err = bed
        .engine
        .resume(suspended, vec![state!({"name": "A"})], "john.doe")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ServiceUnavailable));
    assert_eq!(
        bed.store.list_steps(suspended).await.unwrap().len(),
        rows_before,
        "no step row may be written while paused"
    );

    // Clearing the lock lets the suspended process finish.
    let status = bed.engine.set_engine_pause(false).await.unwrap();
    assert_eq!(status.status, "running");
    bed.engine
        .resume(suspended, vec![state!({"name": "A"})], "john.doe")
        .await
        .unwrap();
    assert_eq!(
        bed.engine
            .get_process(suspended)
            .await
            .unwrap()
            .process
            .last_status,
        "completed"
    );

    // All inline runs finished: the counter is back to zero.
    let settings = bed.store.get_engine_settings().await.unwrap();
    assert_eq!(settings.running_processes, 0);
}

// ---------------------------------------------------------------------
// Step-list edits between runs
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_step_list_edit_between_runs() {
    let bed = testbed();
    bed.engine
        .registry()
        .register("editable", || {
            let s1 = step("Step 1").build(|_| Ok(state!({"from_v1": true})));
            let flaky = retrystep("Call upstream").build(|_| Err(StepFailure::msg("down")));
            workflow("Editable v1").build(init() >> s1 >> flaky >> done())
        })
        .unwrap();

    let process_id = bed
        .engine
        .start("editable", vec![State::new()], "john.doe", None)
        .await
        .unwrap();
    assert_eq!(
        bed.engine
            .get_process(process_id)
            .await
            .unwrap()
            .process
            .last_status,
        "waiting"
    );

    // Redeploy: same store, new engine, edited definition. The removed
    // prefix is never replayed; the new tail runs instead.
    let engine_v2 = Engine::builder(bed.store.clone() as Arc<dyn ProcessStore>)
        .config(EngineConfig {
            testing: true,
            ..Default::default()
        })
        .build()
        .unwrap();
    engine_v2
        .registry()
        .register("editable", || {
            let replayed = step("Step 1").build(|_| {
                Err(StepFailure::msg("the removed prefix must not run again"))
            });
            let appended = step("Appended step").build(|_| Ok(state!({"from_v2": true})));
            workflow("Editable v2").build(init() >> replayed >> appended >> done())
        })
        .unwrap();

    engine_v2
        .resume(process_id, vec![State::new()], "john.doe")
        .await
        .unwrap();

    let details = engine_v2.get_process(process_id).await.unwrap();
    assert_eq!(details.process.last_status, "completed");
    let names: Vec<&str> = details.steps.iter().map(|row| row.name.as_str()).collect();
    assert_eq!(
        names.iter().filter(|n| **n == "Step 1").count(),
        1,
        "the removed prefix was not replayed"
    );
    assert!(names.contains(&"Appended step"));
    let final_state = &details.steps.last().unwrap().state;
    assert_eq!(final_state["from_v2"], true);
}

#[tokio::test]
async fn test_definition_shrunk_below_executed_prefix_completes() {
    let bed = testbed();
    bed.engine
        .registry()
        .register("shrinking", || {
            let s1 = step("Step 1").build(|_| Ok(State::new()));
            let flaky = retrystep("Flaky").build(|_| Err(StepFailure::msg("down")));
            workflow("Shrinking v1").build(init() >> s1 >> flaky >> done())
        })
        .unwrap();

    let process_id = bed
        .engine
        .start("shrinking", vec![State::new()], "john.doe", None)
        .await
        .unwrap();

    let engine_v2 = Engine::builder(bed.store.clone() as Arc<dyn ProcessStore>)
        .config(EngineConfig {
            testing: true,
            ..Default::default()
        })
        .build()
        .unwrap();
    engine_v2
        .registry()
        .register("shrinking", || {
            let s1 = step("Step 1").build(|_| Ok(State::new()));
            workflow("Shrinking v2").build(init() >> s1)
        })
        .unwrap();

    // The new definition has fewer steps than already executed: the
    // executor observes no work and the run ends without advancing.
    engine_v2
        .resume(process_id, vec![State::new()], "john.doe")
        .await
        .unwrap();

    let details = engine_v2.get_process(process_id).await.unwrap();
    assert!(
        details.steps.iter().all(|row| row.name != "Flaky" || row.status == "waiting"),
        "nothing was replayed"
    );
}

// ---------------------------------------------------------------------
// Callback coordination
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_callback_round_trip() {
    let bed = testbed();
    bed.engine
        .registry()
        .register("external", || {
            let action = step("Send provisioning request").build(|_| Ok(state!({"sent": true})));
            let validate = step("Validate confirmation").arg("confirmed").build(|mut args| {
                let confirmed: bool = args.take("confirmed")?;
                if confirmed {
                    Ok(State::new())
                } else {
                    Err(StepFailure::msg("upstream rejected the request"))
                }
            });
            workflow("External provisioning")
                .build(init() >> callback_step("Await confirmation", action, validate, None) >> done())
        })
        .unwrap();

    let process_id = bed
        .engine
        .start("external", vec![State::new()], "john.doe", None)
        .await
        .unwrap();

    let details = bed.engine.get_process(process_id).await.unwrap();
    assert_eq!(details.process.last_status, "awaiting_callback");
    let token = details.steps.last().unwrap().state[CALLBACK_TOKEN_KEY]
        .as_str()
        .unwrap()
        .to_string();

    // A wrong token is rejected without touching the process.
    let err = bed
        .engine
        .deliver_callback(process_id, "forged", state!({"confirmed": true}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "token_mismatch");

    // Plain resume is not how an awaiting process continues.
    let err = bed
        .engine
        .resume(process_id, vec![State::new()], "john.doe")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "conflict");

    bed.engine
        .deliver_callback(process_id, &token, state!({"confirmed": true}))
        .await
        .unwrap();

    let details = bed.engine.get_process(process_id).await.unwrap();
    assert_eq!(details.process.last_status, "completed");
    let final_state = &details.steps.last().unwrap().state;
    assert_eq!(final_state["confirmed"], true);
    assert!(final_state.get(CALLBACK_TOKEN_KEY).is_none());

    // A second delivery finds no awaiting process.
    let err = bed
        .engine
        .deliver_callback(process_id, &token, state!({"confirmed": true}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "conflict");
}

// ---------------------------------------------------------------------
// Bulk resume and cleanup
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_bulk_resume_resumes_eligible_processes() {
    let bed = testbed();
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_in_step = attempts.clone();

    bed.engine
        .registry()
        .register("fragile", move || {
            let attempts = attempts_in_step.clone();
            let fragile = step("Fragile").build(move |_| {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StepFailure::msg("not yet"))
                } else {
                    Ok(State::new())
                }
            });
            workflow("Fragile").build(init() >> fragile >> done())
        })
        .unwrap();

    let first = bed
        .engine
        .start("fragile", vec![State::new()], "john.doe", None)
        .await
        .unwrap();
    let second = bed
        .engine
        .start("fragile", vec![State::new()], "john.doe", None)
        .await
        .unwrap();

    let count = bed.engine.bulk_resume("admin").await.unwrap();
    assert_eq!(count, 2);

    for process_id in [first, second] {
        assert_eq!(
            bed.engine
                .get_process(process_id)
                .await
                .unwrap()
                .process
                .last_status,
            "completed"
        );
    }
}

#[tokio::test]
async fn test_bulk_resume_conflicts_while_lock_held() {
    let bed = testbed();

    let _held = bed
        .locks
        .try_acquire("resume-all", Duration::from_secs(60))
        .unwrap();
    let err = bed.engine.bulk_resume("admin").await.unwrap_err();
    assert_eq!(err.kind(), "conflict");
}

#[tokio::test]
async fn test_cleanup_deletes_old_completed_tasks() {
    // Retention of zero days: every completed task is past the window.
    let bed = testbed_with(EngineConfig {
        testing: true,
        task_log_retention_days: 0,
        ..Default::default()
    });
    bed.engine
        .registry()
        .register("quick_task", || {
            let noop = step("Noop").build(|_| Ok(State::new()));
            workflow("Quick task").build(init() >> noop >> done())
        })
        .unwrap();

    let old_task = bed
        .engine
        .start("quick_task", vec![State::new()], "scheduler", None)
        .await
        .unwrap();
    assert_eq!(
        bed.engine
            .get_process(old_task)
            .await
            .unwrap()
            .process
            .last_status,
        "completed"
    );

    let cleanup_id = bed.engine.cleanup_tasks().await.unwrap();

    let err = bed.engine.get_process(old_task).await.unwrap_err();
    assert_eq!(err.kind(), "not_found");

    let cleanup = bed.engine.get_process(cleanup_id).await.unwrap();
    assert_eq!(cleanup.process.last_status, "completed");
    let removal_row = cleanup
        .steps
        .iter()
        .find(|row| row.name == "Clean up completed tasks past the retention window")
        .unwrap();
    assert_eq!(removal_row.state["tasks_removed"], 1);
}

// ---------------------------------------------------------------------
// Workflow bookkeeping
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_start_records_workflow_row() {
    let bed = testbed();
    bed.engine
        .registry()
        .register("sample", || workflow("Sample").build(sample_steps()))
        .unwrap();

    bed.engine
        .start("sample", vec![State::new()], "john.doe", None)
        .await
        .unwrap();

    let row = bed
        .store
        .get_workflow_by_name("sample")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.target, "SYSTEM");
    assert!(row.deleted_at.is_none());

    let processes = bed
        .engine
        .list_processes(ProcessFilter {
            workflow_name: Some("sample".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(processes.len(), 1);
}
