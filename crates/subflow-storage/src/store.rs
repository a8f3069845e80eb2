//! ProcessStore trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::*;

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Process not found
    #[error("process not found: {0}")]
    ProcessNotFound(Uuid),

    /// Step row not found
    #[error("process step not found: {0}")]
    StepNotFound(Uuid),

    /// Workflow row not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// An engine-settings invariant would be violated
    #[error("engine settings constraint violated: {0}")]
    SettingsConstraint(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Mutation applied to the engine-settings row while it is held under
/// the row lock. Returning an error aborts the update.
pub type SettingsUpdate<'a> =
    &'a (dyn Fn(&mut EngineSettingsRow) -> Result<(), StoreError> + Send + Sync);

/// Store for processes, their step logs and the engine settings.
///
/// Implementations must be thread-safe; per process, writers are the
/// single worker currently executing it.
#[async_trait]
pub trait ProcessStore: Send + Sync + 'static {
    // =========================================================================
    // Workflow bookkeeping
    // =========================================================================

    /// Insert the workflow row or revive/refresh an existing one.
    async fn upsert_workflow(
        &self,
        name: &str,
        target: &str,
        description: &str,
    ) -> Result<WorkflowRow, StoreError>;

    /// Look up a workflow row by name.
    ///
    /// Soft-deleted workflows still resolve so processes already in
    /// flight can finish; discovery surfaces must filter `deleted_at`.
    async fn get_workflow_by_name(&self, name: &str) -> Result<Option<WorkflowRow>, StoreError>;

    /// Soft-delete a workflow row.
    async fn delete_workflow(&self, name: &str) -> Result<(), StoreError>;

    // =========================================================================
    // Processes
    // =========================================================================

    async fn create_process(&self, input: CreateProcess) -> Result<ProcessRow, StoreError>;

    async fn get_process(&self, process_id: Uuid) -> Result<ProcessRow, StoreError>;

    async fn list_processes(&self, filter: ProcessFilter) -> Result<Vec<ProcessRow>, StoreError>;

    async fn update_process(
        &self,
        process_id: Uuid,
        update: UpdateProcess,
    ) -> Result<ProcessRow, StoreError>;

    async fn delete_process(&self, process_id: Uuid) -> Result<(), StoreError>;

    /// Delete completed task processes last modified before the cutoff.
    /// Returns the number of deleted processes.
    async fn delete_completed_tasks_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    // =========================================================================
    // Step log
    // =========================================================================

    async fn insert_step(&self, input: CreateProcessStep) -> Result<ProcessStepRow, StoreError>;

    async fn update_step(
        &self,
        step_id: Uuid,
        update: UpdateProcessStep,
    ) -> Result<ProcessStepRow, StoreError>;

    /// All step rows of a process in `executed_at` order.
    async fn list_steps(&self, process_id: Uuid) -> Result<Vec<ProcessStepRow>, StoreError>;

    /// The most recent step row of a process.
    async fn last_step(&self, process_id: Uuid) -> Result<Option<ProcessStepRow>, StoreError>;

    // =========================================================================
    // Process/subscription relations
    // =========================================================================

    async fn link_subscription(
        &self,
        input: CreateProcessSubscription,
    ) -> Result<ProcessSubscriptionRow, StoreError>;

    async fn list_process_subscriptions(
        &self,
        process_id: Uuid,
    ) -> Result<Vec<ProcessSubscriptionRow>, StoreError>;

    // =========================================================================
    // Engine settings
    // =========================================================================

    async fn get_engine_settings(&self) -> Result<EngineSettingsRow, StoreError>;

    /// Apply a mutation to the engine-settings row under its row lock.
    ///
    /// The `running_processes >= 0` constraint is enforced after the
    /// mutation ran.
    async fn update_engine_settings(
        &self,
        update: SettingsUpdate<'_>,
    ) -> Result<EngineSettingsRow, StoreError>;
}
