//! The executor: drives a workflow to its next observable outcome.
//!
//! Every transition is handed to the step-log hook before the next step
//! starts; if the hook cannot persist even a synthesized failure the
//! executor gives up, because it can no longer guarantee durability.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use crate::error::CLASS_PROCESS_FAILURE;
use crate::outcome::Outcome;
use crate::state::State;
use crate::step::{Step, StepContext};
use crate::steplist::StepList;
use crate::workflow::Workflow;

/// A running workflow: its identity, current outcome and remaining log.
#[derive(Clone)]
pub struct ProcessStat {
    pub process_id: Uuid,
    pub workflow: Arc<Workflow>,
    pub state: Outcome,
    pub log: StepList,
    pub current_user: String,
}

impl ProcessStat {
    pub fn new(
        process_id: Uuid,
        workflow: Arc<Workflow>,
        state: Outcome,
        log: StepList,
        current_user: impl Into<String>,
    ) -> Self {
        Self {
            process_id,
            workflow,
            state,
            log,
            current_user: current_user.into(),
        }
    }
}

/// Persists one step transition. May fail; the executor then retries
/// once with a synthesized Failed outcome describing the write error.
#[async_trait]
pub trait StepLogger: Send + Sync {
    async fn log_step(
        &self,
        pstat: &ProcessStat,
        step: &Step,
        outcome: Outcome,
    ) -> anyhow::Result<Outcome>;
}

/// Read-through view of the engine pause flag.
#[async_trait]
pub trait EngineProbe: Send + Sync {
    async fn is_locked(&self) -> bool;
}

/// Probe for contexts without engine settings (unit tests, tooling).
pub struct NeverLocked;

#[async_trait]
impl EngineProbe for NeverLocked {
    async fn is_locked(&self) -> bool {
        false
    }
}

fn persistence_failure(error: &anyhow::Error) -> Outcome {
    let mut state = State::new();
    state.insert("class".into(), json!(CLASS_PROCESS_FAILURE));
    state.insert(
        "error".into(),
        json!(format!("failed to write step to the process log: {error:#}")),
    );
    Outcome::Failed(state)
}

async fn log_with_retry(
    logger: &dyn StepLogger,
    pstat: &ProcessStat,
    step: &Step,
    outcome: Outcome,
) -> anyhow::Result<Outcome> {
    match logger.log_step(pstat, step, outcome).await {
        Ok(persisted) => Ok(persisted),
        Err(first) => {
            tracing::warn!(
                process_id = %pstat.process_id,
                step = %step.name,
                error = %first,
                "persisting step failed, logging a synthesized failure"
            );
            let fallback = persistence_failure(&first);
            logger.log_step(pstat, step, fallback).await
        }
    }
}

/// Drive the workflow until a non-advancing outcome is reached.
///
/// A suspended process resumes by replaying its first remaining step:
/// the step's resume transition runs (a no-op for plain input steps,
/// a continuation for step groups) and is logged before the loop picks
/// up the steps after it.
pub async fn run_workflow(
    pstat: ProcessStat,
    ctx: &StepContext,
    logger: &dyn StepLogger,
    probe: &dyn EngineProbe,
) -> anyhow::Result<Outcome> {
    let mut remaining = pstat.log.clone();

    let mut process = match pstat.state.clone() {
        Outcome::Suspend(state) | Outcome::AwaitingCallback(state) => {
            match remaining.pop_front() {
                Some(step) => {
                    let resumed = step.resume(state, ctx).await;
                    log_with_retry(logger, &pstat, &step, resumed).await?
                }
                None => Outcome::Success(state),
            }
        }
        other => other.resume(Outcome::Success),
    };

    for step in &remaining {
        if !process.advances() {
            break;
        }

        if probe.is_locked().await {
            tracing::info!(
                process_id = %pstat.process_id,
                step = %step.name,
                "workflow engine is paused, not executing step"
            );
            return Ok(process);
        }

        let next = step.execute(process.into_state(), ctx).await;
        process = log_with_retry(logger, &pstat, step, next).await?;
        tracing::debug!(
            process_id = %pstat.process_id,
            step = %step.name,
            status = %process.status(),
            "workflow step executed"
        );
    }

    Ok(process)
}

/// Abort a workflow between steps.
///
/// Appends a terminal "User Aborted" transition unless the process has
/// already completed, in which case this is a no-op.
pub async fn abort_workflow(
    pstat: ProcessStat,
    logger: &dyn StepLogger,
) -> anyhow::Result<Outcome> {
    if pstat.state.is_complete() {
        return Ok(pstat.state.clone());
    }

    let aborted = pstat.state.clone().abort();
    let marker = crate::step::make_step("User Aborted", Outcome::Abort);

    log_with_retry(logger, &pstat, &marker, aborted).await
}
