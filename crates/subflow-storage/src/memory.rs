//! In-memory implementation of ProcessStore.
//!
//! Same semantics as the PostgreSQL implementation, including the
//! engine-settings row lock (a mutex here). Backs tests and
//! single-replica tooling.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::models::*;
use crate::store::{ProcessStore, SettingsUpdate, StoreError};

#[derive(Default)]
pub struct InMemoryProcessStore {
    workflows: RwLock<HashMap<String, WorkflowRow>>,
    processes: RwLock<HashMap<Uuid, ProcessRow>>,
    steps: RwLock<HashMap<Uuid, Vec<ProcessStepRow>>>,
    subscriptions: RwLock<Vec<ProcessSubscriptionRow>>,
    settings: Mutex<EngineSettingsRow>,
}

impl InMemoryProcessStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored processes; test support.
    pub fn process_count(&self) -> usize {
        self.processes.read().len()
    }

    fn workflow_by_id(&self, workflow_id: Uuid) -> Option<WorkflowRow> {
        self.workflows
            .read()
            .values()
            .find(|w| w.workflow_id == workflow_id)
            .cloned()
    }
}

#[async_trait]
impl ProcessStore for InMemoryProcessStore {
    async fn upsert_workflow(
        &self,
        name: &str,
        target: &str,
        description: &str,
    ) -> Result<WorkflowRow, StoreError> {
        let mut workflows = self.workflows.write();
        let row = workflows
            .entry(name.to_string())
            .and_modify(|row| {
                row.target = target.to_string();
                row.description = Some(description.to_string());
                row.deleted_at = None;
            })
            .or_insert_with(|| WorkflowRow {
                workflow_id: Uuid::new_v4(),
                name: name.to_string(),
                target: target.to_string(),
                description: Some(description.to_string()),
                created_at: Utc::now(),
                deleted_at: None,
            });
        Ok(row.clone())
    }

    async fn get_workflow_by_name(&self, name: &str) -> Result<Option<WorkflowRow>, StoreError> {
        Ok(self.workflows.read().get(name).cloned())
    }

    async fn delete_workflow(&self, name: &str) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let row = workflows
            .get_mut(name)
            .ok_or_else(|| StoreError::WorkflowNotFound(name.to_string()))?;
        row.deleted_at = Some(Utc::now());
        Ok(())
    }

    async fn create_process(&self, input: CreateProcess) -> Result<ProcessRow, StoreError> {
        let workflow = self
            .workflow_by_id(input.workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(input.workflow_id.to_string()))?;

        let now = Utc::now();
        let row = ProcessRow {
            process_id: input.process_id,
            workflow_id: input.workflow_id,
            workflow_name: workflow.name,
            workflow_target: workflow.target,
            last_status: input.last_status,
            last_step: None,
            assignee: "SYSTEM".to_string(),
            started_at: now,
            last_modified_at: now,
            failed_reason: None,
            traceback: None,
            created_by: input.created_by,
            is_task: input.is_task,
            version_id: 1,
        };
        self.processes.write().insert(row.process_id, row.clone());
        Ok(row)
    }

    async fn get_process(&self, process_id: Uuid) -> Result<ProcessRow, StoreError> {
        self.processes
            .read()
            .get(&process_id)
            .cloned()
            .ok_or(StoreError::ProcessNotFound(process_id))
    }

    async fn list_processes(&self, filter: ProcessFilter) -> Result<Vec<ProcessRow>, StoreError> {
        let mut rows: Vec<ProcessRow> = self
            .processes
            .read()
            .values()
            .filter(|row| {
                filter
                    .last_status
                    .as_ref()
                    .map(|statuses| statuses.contains(&row.last_status))
                    .unwrap_or(true)
                    && filter.is_task.map(|t| row.is_task == t).unwrap_or(true)
                    && filter
                        .workflow_name
                        .as_ref()
                        .map(|name| &row.workflow_name == name)
                        .unwrap_or(true)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.started_at);
        Ok(rows)
    }

    async fn update_process(
        &self,
        process_id: Uuid,
        update: UpdateProcess,
    ) -> Result<ProcessRow, StoreError> {
        let mut processes = self.processes.write();
        let row = processes
            .get_mut(&process_id)
            .ok_or(StoreError::ProcessNotFound(process_id))?;

        if let Some(last_status) = update.last_status {
            row.last_status = last_status;
        }
        if let Some(last_step) = update.last_step {
            row.last_step = Some(last_step);
        }
        if let Some(assignee) = update.assignee {
            row.assignee = assignee;
        }
        if let Some((failed_reason, traceback)) = update.failure {
            row.failed_reason = failed_reason;
            row.traceback = traceback;
        }
        row.last_modified_at = Utc::now();
        row.version_id += 1;
        Ok(row.clone())
    }

    async fn delete_process(&self, process_id: Uuid) -> Result<(), StoreError> {
        let removed = self.processes.write().remove(&process_id);
        if removed.is_none() {
            return Err(StoreError::ProcessNotFound(process_id));
        }
        // Step rows and subscription links cascade.
        self.steps.write().remove(&process_id);
        self.subscriptions
            .write()
            .retain(|link| link.process_id != process_id);
        Ok(())
    }

    async fn delete_completed_tasks_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let ids: Vec<Uuid> = self
            .processes
            .read()
            .values()
            .filter(|row| {
                row.is_task && row.last_status == "completed" && row.last_modified_at < cutoff
            })
            .map(|row| row.process_id)
            .collect();

        for id in &ids {
            self.delete_process(*id).await?;
        }
        Ok(ids.len() as u64)
    }

    async fn insert_step(&self, input: CreateProcessStep) -> Result<ProcessStepRow, StoreError> {
        if !self.processes.read().contains_key(&input.process_id) {
            return Err(StoreError::ProcessNotFound(input.process_id));
        }
        let row = ProcessStepRow {
            step_id: Uuid::new_v4(),
            process_id: input.process_id,
            name: input.name,
            status: input.status,
            state: input.state,
            created_by: input.created_by,
            executed_at: Utc::now(),
            commit_hash: None,
        };
        self.steps
            .write()
            .entry(input.process_id)
            .or_default()
            .push(row.clone());
        Ok(row)
    }

    async fn update_step(
        &self,
        step_id: Uuid,
        update: UpdateProcessStep,
    ) -> Result<ProcessStepRow, StoreError> {
        let mut steps = self.steps.write();
        let row = steps
            .values_mut()
            .flat_map(|rows| rows.iter_mut())
            .find(|row| row.step_id == step_id)
            .ok_or(StoreError::StepNotFound(step_id))?;

        if let Some(status) = update.status {
            row.status = status;
        }
        if let Some(state) = update.state {
            row.state = state;
        }
        Ok(row.clone())
    }

    async fn list_steps(&self, process_id: Uuid) -> Result<Vec<ProcessStepRow>, StoreError> {
        let mut rows = self
            .steps
            .read()
            .get(&process_id)
            .cloned()
            .unwrap_or_default();
        rows.sort_by_key(|row| row.executed_at);
        Ok(rows)
    }

    async fn last_step(&self, process_id: Uuid) -> Result<Option<ProcessStepRow>, StoreError> {
        Ok(self.list_steps(process_id).await?.into_iter().next_back())
    }

    async fn link_subscription(
        &self,
        input: CreateProcessSubscription,
    ) -> Result<ProcessSubscriptionRow, StoreError> {
        let row = ProcessSubscriptionRow {
            id: Uuid::new_v4(),
            process_id: input.process_id,
            subscription_id: input.subscription_id,
            workflow_target: input.workflow_target,
            created_at: Utc::now(),
        };
        self.subscriptions.write().push(row.clone());
        Ok(row)
    }

    async fn list_process_subscriptions(
        &self,
        process_id: Uuid,
    ) -> Result<Vec<ProcessSubscriptionRow>, StoreError> {
        Ok(self
            .subscriptions
            .read()
            .iter()
            .filter(|link| link.process_id == process_id)
            .cloned()
            .collect())
    }

    async fn get_engine_settings(&self) -> Result<EngineSettingsRow, StoreError> {
        Ok(self.settings.lock().clone())
    }

    async fn update_engine_settings(
        &self,
        update: SettingsUpdate<'_>,
    ) -> Result<EngineSettingsRow, StoreError> {
        let mut settings = self.settings.lock();
        let mut candidate = settings.clone();
        update(&mut candidate)?;
        if candidate.running_processes < 0 {
            return Err(StoreError::SettingsConstraint(
                "running_processes must be >= 0".into(),
            ));
        }
        *settings = candidate.clone();
        Ok(candidate)
    }
}
