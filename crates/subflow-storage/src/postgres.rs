//! PostgreSQL implementation of ProcessStore.
//!
//! Raw-SQL queries over a connection pool; the engine-settings row is
//! always taken with `SELECT ... FOR UPDATE` so the pause flag and the
//! running-process counter change atomically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, error};
use uuid::Uuid;

use crate::models::*;
use crate::store::{ProcessStore, SettingsUpdate, StoreError};

const PROCESS_COLUMNS: &str = "p.process_id, p.workflow_id, w.name AS workflow_name, \
     w.target AS workflow_target, p.last_status, p.last_step, p.assignee, p.started_at, \
     p.last_modified_at, p.failed_reason, p.traceback, p.created_by, p.is_task, p.version_id";

#[derive(Clone)]
pub struct PostgresProcessStore {
    pool: PgPool,
}

impl PostgresProcessStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a store from a database URL.
    pub async fn from_url(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    error!("database error: {}", e);
    StoreError::Database(e.to_string())
}

#[async_trait]
impl ProcessStore for PostgresProcessStore {
    async fn upsert_workflow(
        &self,
        name: &str,
        target: &str,
        description: &str,
    ) -> Result<WorkflowRow, StoreError> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            INSERT INTO workflows (name, target, description)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE
                SET target = EXCLUDED.target,
                    description = EXCLUDED.description,
                    deleted_at = NULL
            RETURNING workflow_id, name, target, description, created_at, deleted_at
            "#,
        )
        .bind(name)
        .bind(target)
        .bind(description)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(workflow = %name, "workflow row upserted");
        Ok(row)
    }

    async fn get_workflow_by_name(&self, name: &str) -> Result<Option<WorkflowRow>, StoreError> {
        sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT workflow_id, name, target, description, created_at, deleted_at
            FROM workflows
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn delete_workflow(&self, name: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE workflows SET deleted_at = NOW() WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn create_process(&self, input: CreateProcess) -> Result<ProcessRow, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO processes (process_id, workflow_id, last_status, created_by, is_task)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(input.process_id)
        .bind(input.workflow_id)
        .bind(&input.last_status)
        .bind(&input.created_by)
        .bind(input.is_task)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        self.get_process(input.process_id).await
    }

    async fn get_process(&self, process_id: Uuid) -> Result<ProcessRow, StoreError> {
        sqlx::query_as::<_, ProcessRow>(&format!(
            r#"
            SELECT {PROCESS_COLUMNS}
            FROM processes p
            JOIN workflows w ON w.workflow_id = p.workflow_id
            WHERE p.process_id = $1
            "#
        ))
        .bind(process_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::ProcessNotFound(process_id))
    }

    async fn list_processes(&self, filter: ProcessFilter) -> Result<Vec<ProcessRow>, StoreError> {
        sqlx::query_as::<_, ProcessRow>(&format!(
            r#"
            SELECT {PROCESS_COLUMNS}
            FROM processes p
            JOIN workflows w ON w.workflow_id = p.workflow_id
            WHERE ($1::text[] IS NULL OR p.last_status = ANY($1))
              AND ($2::boolean IS NULL OR p.is_task = $2)
              AND ($3::text IS NULL OR w.name = $3)
            ORDER BY p.started_at
            "#
        ))
        .bind(&filter.last_status)
        .bind(filter.is_task)
        .bind(&filter.workflow_name)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn update_process(
        &self,
        process_id: Uuid,
        update: UpdateProcess,
    ) -> Result<ProcessRow, StoreError> {
        let (set_failure, failed_reason, traceback) = match update.failure {
            Some((reason, traceback)) => (true, reason, traceback),
            None => (false, None, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE processes
            SET
                last_status = COALESCE($2, last_status),
                last_step = COALESCE($3, last_step),
                assignee = COALESCE($4, assignee),
                failed_reason = CASE WHEN $5 THEN $6 ELSE failed_reason END,
                traceback = CASE WHEN $5 THEN $7 ELSE traceback END,
                last_modified_at = NOW(),
                version_id = version_id + 1
            WHERE process_id = $1
            "#,
        )
        .bind(process_id)
        .bind(&update.last_status)
        .bind(&update.last_step)
        .bind(&update.assignee)
        .bind(set_failure)
        .bind(&failed_reason)
        .bind(&traceback)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ProcessNotFound(process_id));
        }
        self.get_process(process_id).await
    }

    async fn delete_process(&self, process_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM processes WHERE process_id = $1")
            .bind(process_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ProcessNotFound(process_id));
        }
        Ok(())
    }

    async fn delete_completed_tasks_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM processes
            WHERE is_task = TRUE
              AND last_status = 'completed'
              AND last_modified_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn insert_step(&self, input: CreateProcessStep) -> Result<ProcessStepRow, StoreError> {
        sqlx::query_as::<_, ProcessStepRow>(
            r#"
            INSERT INTO process_steps (process_id, name, status, state, created_by)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING step_id, process_id, name, status, state, created_by, executed_at, commit_hash
            "#,
        )
        .bind(input.process_id)
        .bind(&input.name)
        .bind(&input.status)
        .bind(&input.state)
        .bind(&input.created_by)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn update_step(
        &self,
        step_id: Uuid,
        update: UpdateProcessStep,
    ) -> Result<ProcessStepRow, StoreError> {
        sqlx::query_as::<_, ProcessStepRow>(
            r#"
            UPDATE process_steps
            SET
                status = COALESCE($2, status),
                state = COALESCE($3, state)
            WHERE step_id = $1
            RETURNING step_id, process_id, name, status, state, created_by, executed_at, commit_hash
            "#,
        )
        .bind(step_id)
        .bind(&update.status)
        .bind(&update.state)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::StepNotFound(step_id))
    }

    async fn list_steps(&self, process_id: Uuid) -> Result<Vec<ProcessStepRow>, StoreError> {
        sqlx::query_as::<_, ProcessStepRow>(
            r#"
            SELECT step_id, process_id, name, status, state, created_by, executed_at, commit_hash
            FROM process_steps
            WHERE process_id = $1
            ORDER BY executed_at
            "#,
        )
        .bind(process_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn last_step(&self, process_id: Uuid) -> Result<Option<ProcessStepRow>, StoreError> {
        sqlx::query_as::<_, ProcessStepRow>(
            r#"
            SELECT step_id, process_id, name, status, state, created_by, executed_at, commit_hash
            FROM process_steps
            WHERE process_id = $1
            ORDER BY executed_at DESC
            LIMIT 1
            "#,
        )
        .bind(process_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn link_subscription(
        &self,
        input: CreateProcessSubscription,
    ) -> Result<ProcessSubscriptionRow, StoreError> {
        sqlx::query_as::<_, ProcessSubscriptionRow>(
            r#"
            INSERT INTO process_subscriptions (process_id, subscription_id, workflow_target)
            VALUES ($1, $2, $3)
            RETURNING id, process_id, subscription_id, workflow_target, created_at
            "#,
        )
        .bind(input.process_id)
        .bind(input.subscription_id)
        .bind(&input.workflow_target)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn list_process_subscriptions(
        &self,
        process_id: Uuid,
    ) -> Result<Vec<ProcessSubscriptionRow>, StoreError> {
        sqlx::query_as::<_, ProcessSubscriptionRow>(
            r#"
            SELECT id, process_id, subscription_id, workflow_target, created_at
            FROM process_subscriptions
            WHERE process_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(process_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn get_engine_settings(&self) -> Result<EngineSettingsRow, StoreError> {
        sqlx::query_as::<_, EngineSettingsRow>(
            "SELECT global_lock, running_processes FROM engine_settings",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn update_engine_settings(
        &self,
        update: SettingsUpdate<'_>,
    ) -> Result<EngineSettingsRow, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let mut row = sqlx::query_as::<_, EngineSettingsRow>(
            "SELECT global_lock, running_processes FROM engine_settings FOR UPDATE",
        )
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        let previous_lock = row.global_lock;
        update(&mut row)?;
        if row.running_processes < 0 {
            return Err(StoreError::SettingsConstraint(
                "running_processes must be >= 0".into(),
            ));
        }

        sqlx::query(
            r#"
            UPDATE engine_settings
            SET global_lock = $2, running_processes = $3
            WHERE global_lock = $1
            "#,
        )
        .bind(previous_lock)
        .bind(row.global_lock)
        .bind(row.running_processes)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(row)
    }
}
