//! Task maintenance: the built-in system workflows and bulk resume.
//!
//! `task_resume_workflows` periodically wakes processes stuck in
//! `waiting`; `task_clean_up_tasks` prunes completed task logs past the
//! retention window. Both are ordinary workflows registered at engine
//! construction, so they run with a durable log like everything else.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use uuid::Uuid;

use subflow_core::error::StepFailure;
use subflow_core::state::State;
use subflow_core::step::step;
use subflow_core::steps::{done, init};
use subflow_core::workflow::{workflow, Workflow};
use subflow_core::state;
use subflow_storage::ProcessFilter;

use crate::error::EngineError;
use crate::service::{Engine, EngineInner, SYSTEM_USER};

/// Registered name of the waiting-process sweeper.
pub const TASK_RESUME_WORKFLOWS: &str = "task_resume_workflows";

/// Registered name of the task-log cleanup.
pub const TASK_CLEAN_UP_TASKS: &str = "task_clean_up_tasks";

/// Lock name serializing bulk resumes across callers.
const RESUME_ALL_LOCK: &str = "resume-all";

/// Statuses eligible for bulk resume.
const BULK_RESUMABLE: [&str; 5] = [
    "failed",
    "waiting",
    "api_unavailable",
    "inconsistent_data",
    "resumed",
];

fn engine_of(weak: &Weak<EngineInner>) -> Result<Engine, StepFailure> {
    weak.upgrade()
        .map(|inner| Engine { inner })
        .ok_or_else(|| StepFailure::msg("engine has shut down"))
}

fn resume_workflows_task(engine: Weak<EngineInner>) -> Workflow {
    let find_engine = engine.clone();
    let find_waiting = step("Find waiting workflows").build_async(move |_args, _ctx| {
        let engine = find_engine.clone();
        async move {
            let engine = engine_of(&engine)?;
            let waiting = engine
                .inner
                .store
                .list_processes(ProcessFilter {
                    last_status: Some(vec!["waiting".into()]),
                    ..Default::default()
                })
                .await
                .map_err(|e| StepFailure::msg(e.to_string()))?;

            let waiting_ids: Vec<String> = waiting
                .iter()
                .map(|row| row.process_id.to_string())
                .collect();
            Ok(state!({
                "number_of_waiting_processes": waiting_ids.len(),
                "waiting_process_ids": waiting_ids,
            }))
        }
        .boxed()
    });

    let resume_engine = engine;
    let resume_found = step("Resume found workflows")
        .arg("waiting_process_ids")
        .build_async(move |mut args, _ctx| {
            let engine = resume_engine.clone();
            async move {
                let engine = engine_of(&engine)?;
                let waiting_ids: Vec<Uuid> = args.take("waiting_process_ids")?;

                let mut resumed = Vec::new();
                for process_id in waiting_ids {
                    match engine.resume(process_id, vec![State::new()], SYSTEM_USER).await {
                        Ok(()) => resumed.push(process_id.to_string()),
                        Err(e) => {
                            tracing::warn!(
                                process_id = %process_id,
                                error = %e,
                                "could not resume waiting process"
                            );
                        }
                    }
                }
                Ok(state!({
                    "number_of_resumed_processes": resumed.len(),
                    "resumed_process_ids": resumed,
                }))
            }
            .boxed()
        });

    workflow("Resume all workflows that are stuck on tasks with the status 'waiting'")
        .build(init() >> find_waiting >> resume_found >> done())
}

fn cleanup_tasks_task(engine: Weak<EngineInner>, retention_days: i64) -> Workflow {
    let remove_tasks = step("Clean up completed tasks past the retention window").build_async(
        move |_args, _ctx| {
            let engine = engine.clone();
            async move {
                let engine = engine_of(&engine)?;
                let cutoff = chrono::Utc::now() - chrono::Duration::days(retention_days);
                let removed = engine
                    .inner
                    .store
                    .delete_completed_tasks_before(cutoff)
                    .await
                    .map_err(|e| StepFailure::msg(e.to_string()))?;
                tracing::info!(removed, retention_days, "cleaned up completed tasks");
                Ok(state!({"tasks_removed": removed}))
            }
            .boxed()
        },
    );

    workflow("Clean up old tasks").build(init() >> remove_tasks >> done())
}

/// Register the built-in maintenance workflows.
pub(crate) fn register_builtin_workflows(engine: &Engine) -> Result<(), EngineError> {
    let registry = engine.registry();
    let retention_days = engine.config().task_log_retention_days;

    let weak = Arc::downgrade(&engine.inner);
    registry
        .register(TASK_RESUME_WORKFLOWS, move || {
            resume_workflows_task(weak.clone())
        })
        .map_err(|e| EngineError::Internal(anyhow::anyhow!(e)))?;

    let weak = Arc::downgrade(&engine.inner);
    registry
        .register(TASK_CLEAN_UP_TASKS, move || {
            cleanup_tasks_task(weak.clone(), retention_days)
        })
        .map_err(|e| EngineError::Internal(anyhow::anyhow!(e)))?;

    Ok(())
}

impl Engine {
    /// Run the waiting-process sweeper; returns the task's process id.
    pub async fn resume_waiting(&self) -> Result<Uuid, EngineError> {
        self.start(TASK_RESUME_WORKFLOWS, vec![State::new()], SYSTEM_USER, None)
            .await
    }

    /// Run the task-log cleanup; returns the task's process id.
    pub async fn cleanup_tasks(&self) -> Result<Uuid, EngineError> {
        self.start(TASK_CLEAN_UP_TASKS, vec![State::new()], SYSTEM_USER, None)
            .await
    }

    /// Resume every process stuck in a resumable failure state.
    ///
    /// Holds the `resume-all` named lock; a concurrent invocation
    /// returns `conflict`. Per-process errors are logged and skipped;
    /// the count of successfully resumed processes is returned.
    pub async fn bulk_resume(&self, user: &str) -> Result<usize, EngineError> {
        let _guard = self
            .inner
            .locks
            .try_acquire(RESUME_ALL_LOCK, Duration::from_secs(600))
            .ok_or_else(|| EngineError::conflict("a bulk resume is already running"))?;

        let eligible = self
            .inner
            .store
            .list_processes(ProcessFilter {
                last_status: Some(BULK_RESUMABLE.iter().map(|s| s.to_string()).collect()),
                ..Default::default()
            })
            .await?;

        let mut count = 0;
        for row in eligible {
            match self
                .resume_internal(row.process_id, vec![State::new()], user, true)
                .await
            {
                Ok(()) => count += 1,
                Err(e) => {
                    tracing::warn!(
                        process_id = %row.process_id,
                        error = %e,
                        "bulk resume skipped process"
                    );
                }
            }
        }

        tracing::info!(count, "bulk resume finished");
        Ok(count)
    }
}
