// Executor behavior: stepping, suspension, resume, abort, groups.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use subflow_core::executor::{abort_workflow, run_workflow, EngineProbe, NeverLocked, ProcessStat, StepLogger};
use subflow_core::forms::{form, FieldKind, FormPage};
use subflow_core::state;
use subflow_core::state::{deep_merge, State};
use subflow_core::step::{conditional, inputstep, step, step_group, retrystep, Step, StepContext};
use subflow_core::steplist::{begin, StepList};
use subflow_core::steps::{done, init};
use subflow_core::workflow::{workflow, Workflow};
use subflow_core::{Outcome, StepFailure};

/// Step logger collecting transitions in memory.
#[derive(Default)]
struct MemoryLog {
    entries: Mutex<Vec<(String, Outcome)>>,
}

impl MemoryLog {
    fn entries(&self) -> Vec<(String, Outcome)> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl StepLogger for MemoryLog {
    async fn log_step(
        &self,
        _pstat: &ProcessStat,
        step: &Step,
        outcome: Outcome,
    ) -> anyhow::Result<Outcome> {
        self.entries.lock().push((step.name.clone(), outcome.clone()));
        Ok(outcome)
    }
}

fn step1() -> Step {
    step("Step 1").build(|_| Ok(state!({"steps": [1]})))
}

fn step2() -> Step {
    step("Step 2").arg("steps").build(|mut args| {
        let mut steps: Vec<i64> = args.take("steps")?;
        steps.push(2);
        Ok(state!({"steps": steps}))
    })
}

fn step3() -> Step {
    step("Step 3").arg("steps").build(|mut args| {
        let mut steps: Vec<i64> = args.take("steps")?;
        steps.push(3);
        Ok(state!({"steps": steps}))
    })
}

fn user_action() -> Step {
    inputstep(
        "Input Name",
        subflow_core::Assignee::System,
        form(FormPage::new("Name").field("name", FieldKind::Text)),
    )
}

fn fail_step() -> Step {
    step("Fail").build(|_| Err(StepFailure::msg("Failure Message")))
}

fn pstat(workflow: Arc<Workflow>, state: Outcome, log: StepList) -> ProcessStat {
    ProcessStat::new(Uuid::new_v4(), workflow, state, log, "john.doe")
}

fn fresh(workflow: Arc<Workflow>, initial: State) -> ProcessStat {
    let log = workflow.steps.clone();
    pstat(workflow, Outcome::Success(initial), log)
}

async fn run(p: ProcessStat, log: &MemoryLog) -> Outcome {
    run_workflow(p, &StepContext::default(), log, &NeverLocked)
        .await
        .expect("executor should not error")
}

fn sample_workflow() -> Arc<Workflow> {
    Arc::new(workflow("Sample workflow").build(begin() >> step1() >> step2() >> step3()))
}

#[tokio::test]
async fn test_exec_through_all_steps() {
    let log = MemoryLog::default();
    let result = run(fresh(sample_workflow(), State::new()), &log).await;

    assert_eq!(result, Outcome::Success(state!({"steps": [1, 2, 3]})));
}

#[tokio::test]
async fn test_store_all_steps() {
    let log = MemoryLog::default();
    run(fresh(sample_workflow(), State::new()), &log).await;

    assert_eq!(
        log.entries(),
        vec![
            ("Step 1".into(), Outcome::Success(state!({"steps": [1]}))),
            ("Step 2".into(), Outcome::Success(state!({"steps": [1, 2]}))),
            ("Step 3".into(), Outcome::Success(state!({"steps": [1, 2, 3]}))),
        ]
    );
}

#[tokio::test]
async fn test_recover_from_mid_log() {
    let wf = sample_workflow();
    let log = MemoryLog::default();

    let p = pstat(
        wf.clone(),
        Outcome::Success(state!({"steps": [4]})),
        wf.steps.skip(1),
    );
    let result = run(p, &log).await;

    assert_eq!(result, Outcome::Success(state!({"steps": [4, 2, 3]})));
}

#[tokio::test]
async fn test_waiting_on_retrystep_failure() {
    let soft_fail = retrystep("Waiting step").build(|_| Err(StepFailure::msg("Failure Message")));
    let wf = Arc::new(
        workflow("Workflow with soft fail").build(begin() >> step1() >> soft_fail >> step2()),
    );
    let log = MemoryLog::default();

    let result = run(fresh(wf, State::new()), &log).await;

    assert!(result.is_waiting());
    assert_eq!(result.state()["error"], "Failure Message");
    let entries = log.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].0, "Waiting step");
    assert!(entries[1].1.is_waiting());
}

#[tokio::test]
async fn test_resume_waiting_workflow() {
    // The step that failed before now succeeds; Waiting resumes into it.
    let recovered = retrystep("Waiting step").build(|_| Ok(state!({"some_key": true})));
    let wf = Arc::new(
        workflow("Workflow with soft fail").build(begin() >> step1() >> recovered >> step2()),
    );
    let log = MemoryLog::default();

    let p = pstat(wf.clone(), Outcome::Waiting(state!({"steps": [1]})), wf.steps.skip(1));
    let result = run(p, &log).await;

    assert!(result.is_success());
    assert_eq!(
        log.entries(),
        vec![
            (
                "Waiting step".into(),
                Outcome::Success(state!({"steps": [1], "some_key": true}))
            ),
            (
                "Step 2".into(),
                Outcome::Success(state!({"steps": [1, 2], "some_key": true}))
            ),
        ]
    );
}

#[tokio::test]
async fn test_suspend_at_inputstep() {
    let wf = Arc::new(
        workflow("Workflow with user interaction")
            .build(begin() >> step1() >> user_action() >> step2()),
    );
    let log = MemoryLog::default();

    let result = run(fresh(wf, State::new()), &log).await;

    assert!(result.is_suspend());
    assert_eq!(
        log.entries(),
        vec![
            ("Step 1".into(), Outcome::Success(state!({"steps": [1]}))),
            ("Input Name".into(), Outcome::Suspend(state!({"steps": [1]}))),
        ]
    );
}

#[tokio::test]
async fn test_resume_suspended_workflow() {
    let wf = Arc::new(
        workflow("Workflow with user interaction")
            .build(begin() >> step1() >> user_action() >> step2()),
    );
    let log = MemoryLog::default();

    // Input was already merged into the suspended state by the form layer.
    let p = pstat(
        wf.clone(),
        Outcome::Suspend(state!({"steps": [1], "name": "Jane Doe"})),
        wf.steps.skip(1),
    );
    let result = run(p, &log).await;

    assert_eq!(
        result,
        Outcome::Success(state!({"steps": [1, 2], "name": "Jane Doe"}))
    );
    assert_eq!(
        log.entries(),
        vec![
            (
                "Input Name".into(),
                Outcome::Success(state!({"steps": [1], "name": "Jane Doe"}))
            ),
            (
                "Step 2".into(),
                Outcome::Success(state!({"steps": [1, 2], "name": "Jane Doe"}))
            ),
        ]
    );
}

#[tokio::test]
async fn test_failed_step() {
    let wf = Arc::new(workflow("Failing workflow").build(init() >> fail_step()));
    let log = MemoryLog::default();

    let result = run(fresh(wf, state!({"name": "init-state"})), &log).await;

    assert!(result.is_failed());
    assert_eq!(result.state()["error"], "Failure Message");
    let entries = log.entries();
    assert_eq!(entries[0].0, "Start");
    assert_eq!(entries[1].0, "Fail");
    assert!(entries[1].1.is_failed());
}

#[tokio::test]
async fn test_complete() {
    let wf = Arc::new(workflow("WF").build(init() >> done()));
    let log = MemoryLog::default();

    let result = run(fresh(wf, state!({"name": "completion"})), &log).await;

    assert_eq!(result, Outcome::Complete(state!({"name": "completion"})));
}

/// Logger whose persistence substitutes a Failed outcome.
struct FailingStore;

#[async_trait]
impl StepLogger for FailingStore {
    async fn log_step(
        &self,
        _pstat: &ProcessStat,
        _step: &Step,
        _outcome: Outcome,
    ) -> anyhow::Result<Outcome> {
        Ok(Outcome::Failed(state!({"error": "Failure Message"})))
    }
}

#[tokio::test]
async fn test_failed_log_step_stops_execution() {
    let wf = Arc::new(workflow("WF").build(init() >> done()));

    let result = run_workflow(
        fresh(wf, state!({"name": "init-state"})),
        &StepContext::default(),
        &FailingStore,
        &NeverLocked,
    )
    .await
    .unwrap();

    assert!(result.is_failed());
    assert_eq!(result.state()["error"], "Failure Message");
}

/// Logger that cannot persist anything at all.
struct BrokenStore;

#[async_trait]
impl StepLogger for BrokenStore {
    async fn log_step(
        &self,
        _pstat: &ProcessStat,
        _step: &Step,
        _outcome: Outcome,
    ) -> anyhow::Result<Outcome> {
        Err(anyhow::anyhow!("Failing store error"))
    }
}

#[tokio::test]
async fn test_exception_in_log_step_surfaces() {
    let wf = Arc::new(workflow("WF").build(init() >> done()));

    let err = run_workflow(
        fresh(wf, state!({"name": "init-state"})),
        &StepContext::default(),
        &BrokenStore,
        &NeverLocked,
    )
    .await
    .unwrap_err();

    assert!(err.to_string().contains("Failing store error"));
}

#[tokio::test]
async fn test_abort_workflow_logs_marker() {
    let wf = Arc::new(
        workflow("Workflow with user interaction").build(begin() >> step1() >> user_action()),
    );
    let log = MemoryLog::default();

    let p = pstat(
        wf.clone(),
        Outcome::Success(state!({"steps": [1]})),
        wf.steps.skip(1),
    );
    let result = abort_workflow(p, &log).await.unwrap();

    assert_eq!(result, Outcome::Abort(state!({"steps": [1]})));
    assert_eq!(
        log.entries(),
        vec![("User Aborted".into(), Outcome::Abort(state!({"steps": [1]})))]
    );
}

#[tokio::test]
async fn test_abort_workflow_is_noop_when_complete() {
    let wf = Arc::new(workflow("WF").build(init() >> done()));
    let log = MemoryLog::default();

    let p = pstat(wf, Outcome::Complete(state!({})), begin());
    let result = abort_workflow(p, &log).await.unwrap();

    assert!(result.is_complete());
    assert!(log.entries().is_empty());
}

#[tokio::test]
async fn test_conditionally_skip_steps() {
    let limit_to_10 = conditional(|s: &State| {
        s.get("n").and_then(Value::as_i64).unwrap_or(0) < 10
    });
    let inc_n = step("Inc N").arg_default("n", json!(0)).build(|mut args| {
        let n: i64 = args.take("n")?;
        Ok(state!({"n": n + 1}))
    });

    let mut steps = begin();
    for _ in 0..25 {
        steps = steps >> limit_to_10.apply(inc_n.clone());
    }
    let wf = Arc::new(workflow("Limit the number of increments").build(init() >> steps >> done()));
    let log = MemoryLog::default();

    let result = run(fresh(wf, State::new()), &log).await;

    assert!(result.is_complete());
    assert_eq!(result.state()["n"], 10);
    let skipped = log.entries().iter().filter(|(_, o)| o.is_skipped()).count();
    assert_eq!(skipped, 15, "15 steps should be skipped");
}

#[tokio::test]
async fn test_focus_state_in_workflow() {
    let substep = step("Step that works on substate").build(|_| Ok(state!({"result": "substep"})));
    let zoomed = subflow_core::focussteps("sub").apply(substep);
    let wf = Arc::new(workflow("Zoomed workflow").build(zoomed >> done()));
    let log = MemoryLog::default();

    let result = run(fresh(wf.clone(), state!({"sub": {}})), &log).await;
    assert!(result.is_complete());
    assert_eq!(result.state()["sub"], json!({"result": "substep"}));

    // Also works when the key is absent.
    let log = MemoryLog::default();
    let result = run(fresh(wf, State::new()), &log).await;
    assert!(result.is_complete());
    assert_eq!(result.state()["sub"], json!({"result": "substep"}));
}

#[tokio::test]
async fn test_pause_flag_stops_before_next_step() {
    /// Probe that reports the engine as locked.
    struct AlwaysLocked;

    #[async_trait]
    impl EngineProbe for AlwaysLocked {
        async fn is_locked(&self) -> bool {
            true
        }
    }

    let wf = sample_workflow();
    let log = MemoryLog::default();

    let result = run_workflow(
        fresh(wf, state!({"untouched": true})),
        &StepContext::default(),
        &log,
        &AlwaysLocked,
    )
    .await
    .unwrap();

    // No step ran, no row was written, the state is as handed in.
    assert_eq!(result, Outcome::Success(state!({"untouched": true})));
    assert!(log.entries().is_empty());
}

// ---------------------------------------------------------------------
// Step groups
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_step_group_basic() {
    let sub1 = step("Sub step 1").arg("n").build(|mut args| {
        let n: i64 = args.take("n")?;
        Ok(state!({"x": n + 1}))
    });
    let sub2 = step("Sub step 2").arg("n").arg("x").build(|mut args| {
        let n: i64 = args.take("n")?;
        let x: i64 = args.take("x")?;
        Ok(state!({"x": x * n}))
    });
    let sub3 = step("Sub step 3").arg("n").arg("x").build(|mut args| {
        let n: i64 = args.take("n")?;
        let x: i64 = args.take("x")?;
        Ok(state!({"x": x + n}))
    });

    let group = step_group("Multiple steps", begin() >> sub1 >> sub2 >> sub3);
    let wf = Arc::new(
        workflow("Workflow with step group")
            .build(init() >> step1() >> step2() >> group >> step3() >> done()),
    );
    let log = MemoryLog::default();

    let result = run(fresh(wf, state!({"n": 3})), &log).await;

    assert!(result.is_complete());
    let names: Vec<String> = log.entries().iter().map(|(n, _)| n.clone()).collect();
    assert_eq!(
        names,
        vec!["Start", "Step 1", "Step 2", "Multiple steps", "Step 3", "Done"]
    );
    // One composite transition carries the final inner state.
    let (_, group_outcome) = log.entries()[3].clone();
    assert_eq!(
        group_outcome,
        Outcome::Success(state!({"n": 3, "steps": [1, 2], "x": 15}))
    );
}

#[tokio::test]
async fn test_step_group_suspends_with_markers() {
    let validate_name = step("Validate name").arg("name").build(|mut args| {
        let name: String = args.take("name")?;
        Ok(state!({"name_validated": name}))
    });
    let group = step_group("Multistep", begin() >> step2() >> user_action() >> validate_name);
    let wf = Arc::new(
        workflow("Workflow with step group").build(init() >> step1() >> group >> step3() >> done()),
    );
    let log = MemoryLog::default();

    let result = run(fresh(wf, State::new()), &log).await;

    assert!(result.is_suspend());
    assert_eq!(
        result.state(),
        &state!({
            "steps": [1, 2],
            "__sub_step": "Input Name",
            "__step_group": "Multistep",
        })
    );
}

#[tokio::test]
async fn test_step_group_resumes_from_inner_step() {
    let validate_name = step("Validate name").build(|_| Ok(state!({"name_validated": true})));
    let group = step_group("Multistep", begin() >> step2() >> user_action() >> validate_name);
    let wf = Arc::new(
        workflow("Workflow with step group").build(init() >> step1() >> group >> step3() >> done()),
    );

    // First run suspends inside the group.
    let log = MemoryLog::default();
    let suspended = run(fresh(wf.clone(), State::new()), &log).await;
    assert!(suspended.is_suspend());
    assert_eq!(suspended.state()["__sub_step"], "Input Name");

    // Resume with the submitted input merged in; the executed prefix is
    // Start and Step 1, so the group is the first remaining step.
    let merged = deep_merge(suspended.into_state(), state!({"name": "Some name"}));
    let p = pstat(wf.clone(), Outcome::Suspend(merged), wf.steps.skip(2));
    let resume_log = MemoryLog::default();
    let result = run(p, &resume_log).await;

    assert!(result.is_complete());
    let statuses: Vec<(String, bool)> = resume_log
        .entries()
        .iter()
        .map(|(n, o)| (n.clone(), o.is_success() || o.is_complete()))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("Multistep".to_string(), true),
            ("Step 3".to_string(), true),
            ("Done".to_string(), true),
        ]
    );

    let final_state = result.state();
    assert_eq!(final_state["steps"], json!([1, 2, 3]));
    assert_eq!(final_state["name"], "Some name");
    assert_eq!(final_state["name_validated"], true);
    assert!(final_state.get("__sub_step").is_none());
    assert!(final_state.get("__step_group").is_none());
}

#[tokio::test]
async fn test_step_group_failure_retries_whole_group() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    static SIDE_EFFECTS: AtomicUsize = AtomicUsize::new(0);

    let effect_step = step("Effectful step").build(|_| {
        SIDE_EFFECTS.fetch_add(1, Ordering::SeqCst);
        Ok(State::new())
    });
    let group = step_group("Multistep", begin() >> effect_step >> step2() >> fail_step());
    let wf = Arc::new(
        workflow("Workflow with step group").build(init() >> step1() >> group >> step3() >> done()),
    );

    let log = MemoryLog::default();
    let result = run(fresh(wf.clone(), State::new()), &log).await;
    assert!(result.is_failed());
    assert_eq!(result.state()["error"], "Failure Message");
    assert_eq!(SIDE_EFFECTS.load(Ordering::SeqCst), 1);

    // Retrying replays the whole group, side effect included.
    let p = pstat(wf.clone(), Outcome::Failed(result.into_state()), wf.steps.skip(2));
    let retry_log = MemoryLog::default();
    let retried = run(p, &retry_log).await;
    assert!(retried.is_failed());
    assert_eq!(SIDE_EFFECTS.load(Ordering::SeqCst), 2);
}
