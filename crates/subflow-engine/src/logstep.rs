//! The durable step log: persisting one transition at a time.
//!
//! Writing a transition also maintains the process row (last status,
//! last step, assignee, failure columns) and applies the deduplication
//! rule: a step that keeps failing updates its existing row in place,
//! counting retries and collecting execution timestamps, instead of
//! growing the log unboundedly.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use subflow_core::error::{CLASS_API_UNAVAILABLE, CLASS_INCONSISTENT_DATA, StepFailure};
use subflow_core::executor::{EngineProbe, ProcessStat, StepLogger};
use subflow_core::state::keys;
use subflow_core::step::{Step, WorkflowHooks};
use subflow_core::types::{Assignee, StepStatus, Target};
use subflow_core::Outcome;
use subflow_storage::{
    CreateProcessStep, CreateProcessSubscription, ProcessStepRow, ProcessStore, UpdateProcess,
    UpdateProcessStep,
};

/// Called with the process id after every persisted transition.
pub type BroadcastFn = Arc<dyn Fn(Uuid) + Send + Sync>;

/// Called by the search-index refresh step; wired to the indexer
/// collaborator, a no-op by default.
pub type SearchIndexFn = Arc<dyn Fn(Uuid) + Send + Sync>;

/// Per-run hook sink.
///
/// Subscription links recorded by a step are buffered here and flushed
/// together with the step's log write, so the relation persists with
/// the transition that created it.
pub struct RunHooks {
    pending_links: Mutex<Vec<CreateProcessSubscription>>,
    search_index: SearchIndexFn,
}

impl RunHooks {
    pub fn new(search_index: SearchIndexFn) -> Self {
        Self {
            pending_links: Mutex::new(Vec::new()),
            search_index,
        }
    }

    fn drain_links(&self) -> Vec<CreateProcessSubscription> {
        std::mem::take(&mut self.pending_links.lock())
    }
}

impl WorkflowHooks for RunHooks {
    fn link_subscription(
        &self,
        process_id: Uuid,
        subscription_id: Uuid,
        target: Target,
    ) -> Result<(), StepFailure> {
        self.pending_links.lock().push(CreateProcessSubscription {
            process_id,
            subscription_id,
            workflow_target: target.to_string(),
        });
        Ok(())
    }

    fn refresh_search_index(&self, subscription_id: Uuid) -> Result<(), StepFailure> {
        (self.search_index)(subscription_id);
        Ok(())
    }
}

/// Step statuses that may be rewritten in place by the next attempt of
/// the same step.
fn is_replaceable(status: &str) -> bool {
    matches!(
        status,
        "suspend" | "awaiting_callback" | "waiting" | "failed"
    )
}

fn retries_of(state: &Value) -> i64 {
    state
        .get(keys::RETRIES)
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

fn executed_at_of(state: &Value) -> Vec<Value> {
    state
        .get(keys::EXECUTED_AT)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// The persisting step logger used for every dispatched run.
pub struct DbStepLogger {
    store: Arc<dyn ProcessStore>,
    hooks: Arc<RunHooks>,
    broadcast: Option<BroadcastFn>,
    reset_retries_after_success: bool,
}

impl DbStepLogger {
    pub fn new(
        store: Arc<dyn ProcessStore>,
        hooks: Arc<RunHooks>,
        broadcast: Option<BroadcastFn>,
        reset_retries_after_success: bool,
    ) -> Self {
        Self {
            store,
            hooks,
            broadcast,
            reset_retries_after_success,
        }
    }

    /// Base for the retry bookkeeping of a fresh failure row.
    ///
    /// With `reset_retries_after_success` off, the counter continues
    /// from the latest earlier row of the same step and status even
    /// when a successful attempt has been logged in between.
    async fn carried_bookkeeping(
        &self,
        process_id: Uuid,
        step_name: &str,
        status: StepStatus,
    ) -> anyhow::Result<(i64, Vec<Value>)> {
        if self.reset_retries_after_success {
            return Ok((0, Vec::new()));
        }
        let rows = self.store.list_steps(process_id).await?;
        let prior = rows
            .iter()
            .rev()
            .find(|row| row.name == step_name && row.retained_status_matches(status));
        Ok(match prior {
            Some(row) => (retries_of(&row.state), executed_at_of(&row.state)),
            None => (0, Vec::new()),
        })
    }
}

trait RetainedStatus {
    fn retained_status_matches(&self, status: StepStatus) -> bool;
}

impl RetainedStatus for ProcessStepRow {
    /// A row counts as carrying retry history for `status` when it is
    /// that status, or a later success that kept the bookkeeping keys.
    fn retained_status_matches(&self, status: StepStatus) -> bool {
        self.status == status.to_string()
            || (self.state.get(keys::RETRIES).is_some() && self.status == "success")
    }
}

#[async_trait]
impl StepLogger for DbStepLogger {
    async fn log_step(
        &self,
        pstat: &ProcessStat,
        step: &Step,
        outcome: Outcome,
    ) -> anyhow::Result<Outcome> {
        let process_id = pstat.process_id;
        let status = outcome.status();
        let now = json!(Utc::now().to_rfc3339());

        // Relations recorded by the step persist with its transition.
        for link in self.hooks.drain_links() {
            self.store.link_subscription(link).await?;
        }

        let last = self.store.last_step(process_id).await?;
        let mut state = outcome.state().clone();

        let written = match last {
            // The previous attempt of this same step left a
            // non-advancing row: rewrite it in place.
            Some(prior) if prior.name == step.name && is_replaceable(&prior.status) => {
                if matches!(status, StepStatus::Failed | StepStatus::Waiting) {
                    let mut executed_at = executed_at_of(&prior.state);
                    executed_at.push(now);
                    state.insert(keys::RETRIES.into(), json!(retries_of(&prior.state) + 1));
                    state.insert(keys::EXECUTED_AT.into(), Value::Array(executed_at));
                } else {
                    // Keep the history the failed attempts accumulated.
                    for key in [keys::RETRIES, keys::EXECUTED_AT] {
                        if let Some(value) = prior.state.get(key) {
                            state.entry(key.to_string()).or_insert(value.clone());
                        }
                    }
                }
                self.store
                    .update_step(
                        prior.step_id,
                        UpdateProcessStep {
                            status: Some(status.to_string()),
                            state: Some(Value::Object(state.clone())),
                        },
                    )
                    .await?
            }
            _ => {
                if matches!(status, StepStatus::Failed | StepStatus::Waiting) {
                    let (base_retries, mut executed_at) = self
                        .carried_bookkeeping(process_id, &step.name, status)
                        .await?;
                    executed_at.push(now);
                    state.insert(keys::RETRIES.into(), json!(base_retries + 1));
                    state.insert(keys::EXECUTED_AT.into(), Value::Array(executed_at));
                }
                self.store
                    .insert_step(CreateProcessStep {
                        process_id,
                        name: step.name.clone(),
                        status: status.to_string(),
                        state: Value::Object(state.clone()),
                        created_by: Some(pstat.current_user.clone()),
                    })
                    .await?
            }
        };

        let persisted = Outcome::from_status(status, state);

        // Maintain the process row.
        let overall = persisted.overall_status();
        let assignee = match (&persisted, persisted.state().get("class").and_then(Value::as_str)) {
            (Outcome::Failed(_), Some(CLASS_INCONSISTENT_DATA)) => Some(Assignee::Noc),
            (Outcome::Failed(_), Some(CLASS_API_UNAVAILABLE)) => Some(Assignee::System),
            _ => step.assignee,
        };
        let failure = if persisted.is_failed() || persisted.is_waiting() {
            let reason = persisted
                .state()
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string);
            let traceback = persisted
                .state()
                .get("traceback")
                .and_then(Value::as_str)
                .map(str::to_string);
            Some((reason, traceback))
        } else {
            Some((None, None))
        };

        self.store
            .update_process(
                process_id,
                UpdateProcess {
                    last_status: Some(overall.to_string()),
                    last_step: Some(written.name.clone()),
                    assignee: assignee.map(|a| a.to_string()),
                    failure,
                },
            )
            .await?;

        tracing::debug!(
            process_id = %process_id,
            step = %written.name,
            status = %written.status,
            "step transition persisted"
        );

        if let Some(broadcast) = &self.broadcast {
            broadcast(process_id);
        }

        Ok(persisted)
    }
}

/// Pause-flag probe over the store.
pub struct StoreEngineProbe {
    store: Arc<dyn ProcessStore>,
}

impl StoreEngineProbe {
    pub fn new(store: Arc<dyn ProcessStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EngineProbe for StoreEngineProbe {
    async fn is_locked(&self) -> bool {
        match self.store.get_engine_settings().await {
            Ok(settings) => settings.global_lock,
            Err(e) => {
                tracing::warn!(error = %e, "could not read engine settings; assuming unlocked");
                false
            }
        }
    }
}
