//! The process service: start, resume, abort and callback delivery,
//! plus the concurrency controls that dispatch runs to the pool.

use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use uuid::Uuid;

use subflow_core::executor::{abort_workflow, run_workflow, ProcessStat};
use subflow_core::forms::post_form;
use subflow_core::inject::{NoSubscriptions, SubscriptionResolver};
use subflow_core::registry::WorkflowRegistry;
use subflow_core::state::{deep_merge, keys, merge, State};
use subflow_core::step::{StepContext, CALLBACK_TOKEN_KEY};
use subflow_core::types::{ProcessStatus, StepStatus};
use subflow_core::workflow::{AuthPrincipal, Workflow};
use subflow_core::Outcome;
use subflow_storage::{
    CreateProcess, ProcessFilter, ProcessRow, ProcessStepRow, ProcessStore,
    ProcessSubscriptionRow, UpdateProcess,
};

use crate::config::EngineConfig;
use crate::distlock::{DistLock, MemoryDistLock};
use crate::error::EngineError;
use crate::logstep::{BroadcastFn, DbStepLogger, RunHooks, SearchIndexFn, StoreEngineProbe};

/// User recorded on engine-initiated runs.
pub const SYSTEM_USER: &str = "SYSTEM";

/// A process record together with its step log and affected
/// subscriptions.
#[derive(Debug, Clone)]
pub struct ProcessDetails {
    pub process: ProcessRow,
    pub steps: Vec<ProcessStepRow>,
    pub subscriptions: Vec<ProcessSubscriptionRow>,
}

/// Projection of the engine settings row.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub global_lock: bool,
    pub running_processes: i32,
    pub status: String,
}

pub(crate) struct EngineInner {
    pub(crate) store: Arc<dyn ProcessStore>,
    pub(crate) registry: Arc<WorkflowRegistry>,
    pub(crate) config: EngineConfig,
    pub(crate) resolver: Arc<dyn SubscriptionResolver>,
    pub(crate) search_index: SearchIndexFn,
    pub(crate) broadcast: Option<BroadcastFn>,
    pub(crate) locks: Arc<dyn DistLock>,
    pub(crate) semaphore: Arc<Semaphore>,
}

/// The workflow engine control surface.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

/// Builder wiring the engine to its store and collaborators.
pub struct EngineBuilder {
    store: Arc<dyn ProcessStore>,
    registry: Arc<WorkflowRegistry>,
    config: EngineConfig,
    resolver: Arc<dyn SubscriptionResolver>,
    search_index: SearchIndexFn,
    broadcast: Option<BroadcastFn>,
    locks: Arc<dyn DistLock>,
}

impl EngineBuilder {
    pub fn new(store: Arc<dyn ProcessStore>) -> Self {
        Self {
            store,
            registry: Arc::new(WorkflowRegistry::new()),
            config: EngineConfig::default(),
            resolver: Arc::new(NoSubscriptions),
            search_index: Arc::new(|_| {}),
            broadcast: None,
            locks: Arc::new(MemoryDistLock::new()),
        }
    }

    pub fn registry(mut self, registry: Arc<WorkflowRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn SubscriptionResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn search_index(mut self, search_index: SearchIndexFn) -> Self {
        self.search_index = search_index;
        self
    }

    pub fn broadcast(mut self, broadcast: BroadcastFn) -> Self {
        self.broadcast = Some(broadcast);
        self
    }

    pub fn locks(mut self, locks: Arc<dyn DistLock>) -> Self {
        self.locks = locks;
        self
    }

    /// Build the engine and register the built-in maintenance
    /// workflows. Fails when a workflow name is already taken.
    pub fn build(self) -> Result<Engine, EngineError> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let inner = Arc::new(EngineInner {
            store: self.store,
            registry: self.registry,
            config: self.config,
            resolver: self.resolver,
            search_index: self.search_index,
            broadcast: self.broadcast,
            locks: self.locks,
            semaphore,
        });

        let engine = Engine { inner };
        crate::tasks::register_builtin_workflows(&engine)?;
        Ok(engine)
    }
}

impl Engine {
    pub fn builder(store: Arc<dyn ProcessStore>) -> EngineBuilder {
        EngineBuilder::new(store)
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Start a workflow; returns the id of the created process.
    ///
    /// Preconditions (unknown workflow, authorization, run predicate,
    /// form validation, engine pause) are checked before any row is
    /// persisted.
    pub async fn start(
        &self,
        workflow_name: &str,
        user_inputs: Vec<State>,
        user: &str,
        principal: Option<&AuthPrincipal>,
    ) -> Result<Uuid, EngineError> {
        let inner = &self.inner;
        let workflow = inner
            .registry
            .get(workflow_name)
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_name.to_string()))?;

        if !workflow.authorize(principal) {
            return Err(EngineError::Forbidden);
        }
        if !workflow.may_start() {
            return Err(EngineError::StartPredicate(workflow_name.to_string()));
        }
        if inner.store.get_engine_settings().await?.global_lock {
            return Err(EngineError::ServiceUnavailable);
        }

        let process_id = Uuid::new_v4();
        let mut initial = State::new();
        initial.insert(keys::PROCESS_ID.into(), json!(process_id.to_string()));
        initial.insert(keys::REPORTER.into(), json!(user));
        initial.insert(keys::WORKFLOW_NAME.into(), json!(workflow.name));
        initial.insert(
            keys::WORKFLOW_TARGET.into(),
            json!(workflow.target.to_string()),
        );

        // Consume the initial input form. Failing validation leaves no
        // trace of the attempted start.
        let user_input = post_form(&workflow.initial_input_form, &initial, &user_inputs)?;
        let state = merge(user_input, initial);

        let workflow_row = inner
            .store
            .upsert_workflow(
                &workflow.name,
                &workflow.target.to_string(),
                &workflow.description,
            )
            .await?;

        inner
            .store
            .create_process(CreateProcess {
                process_id,
                workflow_id: workflow_row.workflow_id,
                last_status: ProcessStatus::Created.to_string(),
                created_by: Some(user.to_string()),
                is_task: workflow.is_task(),
            })
            .await?;

        tracing::info!(process_id = %process_id, workflow = %workflow.name, "process created");

        let log = workflow.steps.clone();
        let pstat = ProcessStat::new(process_id, workflow, Outcome::Success(state), log, user);
        inner.clone().dispatch(pstat).await?;

        Ok(process_id)
    }

    /// Resume a suspended, waiting or failed process.
    pub async fn resume(
        &self,
        process_id: Uuid,
        user_inputs: Vec<State>,
        user: &str,
    ) -> Result<(), EngineError> {
        self.resume_internal(process_id, user_inputs, user, false)
            .await
    }

    pub(crate) async fn resume_internal(
        &self,
        process_id: Uuid,
        user_inputs: Vec<State>,
        user: &str,
        allow_queued: bool,
    ) -> Result<(), EngineError> {
        let inner = &self.inner;
        if inner.store.get_engine_settings().await?.global_lock {
            return Err(EngineError::ServiceUnavailable);
        }
        let row = inner.store.get_process(process_id).await?;

        let blocked = if allow_queued {
            ["running", "completed", "aborted"].as_slice()
        } else {
            ["running", "resumed", "completed", "aborted"].as_slice()
        };
        if blocked.contains(&row.last_status.as_str()) {
            return Err(EngineError::conflict(format!(
                "process is {}",
                row.last_status
            )));
        }

        let (workflow, mut outcome, remaining) = inner.load_process(&row).await?;

        if outcome.is_awaiting_callback() {
            return Err(EngineError::conflict(
                "process awaits an external callback; deliver it instead of resuming",
            ));
        }
        if outcome.is_suspend() {
            // Drive the pending form with the submitted input.
            let form = remaining.first().and_then(|step| step.form.clone());
            let user_input = match form {
                Some(form) => post_form(&form, outcome.state(), &user_inputs)?,
                None => State::new(),
            };
            outcome = outcome.map(|state| deep_merge(state, user_input));
        }

        inner
            .store
            .update_process(
                process_id,
                UpdateProcess {
                    last_status: Some(ProcessStatus::Resumed.to_string()),
                    ..Default::default()
                },
            )
            .await?;

        let pstat = ProcessStat::new(process_id, workflow, outcome, remaining, user);
        inner.clone().dispatch(pstat).await
    }

    /// Abort a process between steps. Re-aborting is a no-op, as is
    /// aborting a completed process.
    pub async fn abort(&self, process_id: Uuid, user: &str) -> Result<(), EngineError> {
        let inner = &self.inner;
        let row = inner.store.get_process(process_id).await?;
        if row.last_status == ProcessStatus::Aborted.to_string() {
            return Ok(());
        }

        let (workflow, outcome, remaining) = inner.load_process(&row).await?;
        let pstat = ProcessStat::new(process_id, workflow, outcome, remaining, user);

        let hooks = Arc::new(RunHooks::new(inner.search_index.clone()));
        let logger = DbStepLogger::new(
            inner.store.clone(),
            hooks,
            inner.broadcast.clone(),
            inner.config.reset_retries_after_success,
        );
        abort_workflow(pstat, &logger).await?;
        Ok(())
    }

    /// Deliver an external callback payload to an awaiting process.
    pub async fn deliver_callback(
        &self,
        process_id: Uuid,
        token: &str,
        payload: State,
    ) -> Result<(), EngineError> {
        let inner = &self.inner;
        if inner.store.get_engine_settings().await?.global_lock {
            return Err(EngineError::ServiceUnavailable);
        }
        let row = inner.store.get_process(process_id).await?;
        if row.last_status != ProcessStatus::AwaitingCallback.to_string() {
            return Err(EngineError::conflict(format!(
                "process is {}, not awaiting a callback",
                row.last_status
            )));
        }

        let (workflow, outcome, remaining) = inner.load_process(&row).await?;
        let state = outcome.state();
        let expected = state.get(CALLBACK_TOKEN_KEY).and_then(Value::as_str);
        if expected != Some(token) {
            return Err(EngineError::TokenMismatch);
        }

        let merged = outcome.map(|mut state| {
            state.remove(CALLBACK_TOKEN_KEY);
            deep_merge(state, payload)
        });

        inner
            .store
            .update_process(
                process_id,
                UpdateProcess {
                    last_status: Some(ProcessStatus::Resumed.to_string()),
                    ..Default::default()
                },
            )
            .await?;

        let pstat = ProcessStat::new(process_id, workflow, merged, remaining, SYSTEM_USER);
        inner.clone().dispatch(pstat).await
    }

    /// A process record with its step log and subscription relations.
    pub async fn get_process(&self, process_id: Uuid) -> Result<ProcessDetails, EngineError> {
        let process = self.inner.store.get_process(process_id).await?;
        let steps = self.inner.store.list_steps(process_id).await?;
        let subscriptions = self
            .inner
            .store
            .list_process_subscriptions(process_id)
            .await?;
        Ok(ProcessDetails {
            process,
            steps,
            subscriptions,
        })
    }

    pub async fn list_processes(
        &self,
        filter: ProcessFilter,
    ) -> Result<Vec<ProcessRow>, EngineError> {
        Ok(self.inner.store.list_processes(filter).await?)
    }

    /// Set or clear the engine pause lock.
    pub async fn set_engine_pause(&self, pause: bool) -> Result<EngineStatus, EngineError> {
        self.inner
            .store
            .update_engine_settings(&move |settings| {
                settings.global_lock = pause;
                Ok(())
            })
            .await?;
        self.engine_status().await
    }

    /// Current engine pause/running view.
    pub async fn engine_status(&self) -> Result<EngineStatus, EngineError> {
        let settings = self.inner.store.get_engine_settings().await?;
        let status = match (settings.global_lock, settings.running_processes) {
            (false, _) => "running",
            (true, n) if n > 0 => "pausing",
            (true, _) => "paused",
        };
        Ok(EngineStatus {
            global_lock: settings.global_lock,
            running_processes: settings.running_processes,
            status: status.to_string(),
        })
    }
}

impl EngineInner {
    /// Rebuild the runtime view of a persisted process, reconciling its
    /// step history against the current workflow definition.
    pub(crate) async fn load_process(
        &self,
        row: &ProcessRow,
    ) -> Result<(Arc<Workflow>, Outcome, subflow_core::StepList), EngineError> {
        let workflow = self
            .registry
            .get(&row.workflow_name)
            .ok_or_else(|| EngineError::WorkflowNotFound(row.workflow_name.clone()))?;

        let steps = self.store.list_steps(row.process_id).await?;
        let executed = steps
            .iter()
            .filter(|step| {
                StepStatus::from_str(&step.status)
                    .map(|s| s.is_executed())
                    .unwrap_or(false)
            })
            .count();
        let remaining = workflow.steps.skip(executed);

        let outcome = match steps.last() {
            Some(last) => {
                let status = StepStatus::from_str(&last.status)
                    .map_err(|e| EngineError::Internal(anyhow::anyhow!(e)))?;
                let state = match &last.state {
                    Value::Object(map) => map.clone(),
                    other => {
                        return Err(EngineError::Internal(anyhow::anyhow!(
                            "step state is not an object: {other}"
                        )))
                    }
                };
                Outcome::from_status(status, state)
            }
            // Never ran: rebuild the initial state.
            None => {
                let mut state = State::new();
                state.insert(keys::PROCESS_ID.into(), json!(row.process_id.to_string()));
                state.insert(
                    keys::REPORTER.into(),
                    json!(row.created_by.clone().unwrap_or_else(|| SYSTEM_USER.into())),
                );
                state.insert(keys::WORKFLOW_NAME.into(), json!(row.workflow_name));
                state.insert(keys::WORKFLOW_TARGET.into(), json!(row.workflow_target));
                Outcome::Success(state)
            }
        };

        Ok((workflow, outcome, remaining))
    }

    /// Dispatch a process run to the worker pool.
    ///
    /// Refused while the engine is paused. The running-process counter
    /// tracks runs that actually hold a pool slot.
    pub(crate) async fn dispatch(self: Arc<Self>, pstat: ProcessStat) -> Result<(), EngineError> {
        if self.store.get_engine_settings().await?.global_lock {
            return Err(EngineError::ServiceUnavailable);
        }

        if self.config.testing {
            self.run_in_slot(pstat).await;
            return Ok(());
        }

        tokio::spawn(async move {
            self.run_in_slot(pstat).await;
        });
        Ok(())
    }

    async fn run_in_slot(self: Arc<Self>, pstat: ProcessStat) {
        let Ok(_permit) = self.semaphore.clone().acquire_owned().await else {
            tracing::error!("worker pool is shut down; dropping dispatch");
            return;
        };

        let process_id = pstat.process_id;
        if let Err(e) = self
            .store
            .update_engine_settings(&|settings| {
                settings.running_processes += 1;
                Ok(())
            })
            .await
        {
            tracing::error!(error = %e, "could not increment running_processes");
            return;
        }

        let run = AssertUnwindSafe(self.execute_process(pstat)).catch_unwind().await;
        match run {
            Ok(Ok(outcome)) => {
                tracing::debug!(process_id = %process_id, status = %outcome.status(), "run finished");
            }
            Ok(Err(e)) => {
                tracing::error!(process_id = %process_id, error = %e, "run could not persist");
                self.record_run_failure(process_id, &format!("{e:#}")).await;
            }
            Err(_) => {
                tracing::error!(process_id = %process_id, "run panicked");
                self.record_run_failure(process_id, "workflow run panicked")
                    .await;
            }
        }

        if let Err(e) = self
            .store
            .update_engine_settings(&|settings| {
                settings.running_processes -= 1;
                Ok(())
            })
            .await
        {
            tracing::error!(error = %e, "could not decrement running_processes");
        }
    }

    async fn execute_process(&self, pstat: ProcessStat) -> anyhow::Result<Outcome> {
        let hooks = Arc::new(RunHooks::new(self.search_index.clone()));
        let ctx = StepContext::new(self.resolver.clone(), hooks.clone());
        let logger = DbStepLogger::new(
            self.store.clone(),
            hooks,
            self.broadcast.clone(),
            self.config.reset_retries_after_success,
        );
        let probe = StoreEngineProbe::new(self.store.clone());
        run_workflow(pstat, &ctx, &logger, &probe).await
    }

    /// Best-effort failure record for a run the executor gave up on.
    async fn record_run_failure(&self, process_id: Uuid, reason: &str) {
        let update = UpdateProcess {
            last_status: Some(ProcessStatus::Failed.to_string()),
            failure: Some((Some(reason.to_string()), None)),
            ..Default::default()
        };
        if let Err(e) = self.store.update_process(process_id, update).await {
            tracing::error!(process_id = %process_id, error = %e, "could not record run failure");
        }
    }
}
