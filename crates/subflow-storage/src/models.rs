// Database models (internal, may differ from public DTOs)

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

// ============================================
// Process models
// ============================================

/// Process row joined with its workflow's name and target.
#[derive(Debug, Clone, FromRow)]
pub struct ProcessRow {
    pub process_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub workflow_target: String,
    pub last_status: String,
    pub last_step: Option<String>,
    pub assignee: String,
    pub started_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    pub failed_reason: Option<String>,
    pub traceback: Option<String>,
    pub created_by: Option<String>,
    pub is_task: bool,
    pub version_id: i32,
}

/// Input for creating a process row.
#[derive(Debug, Clone)]
pub struct CreateProcess {
    pub process_id: Uuid,
    pub workflow_id: Uuid,
    pub last_status: String,
    pub created_by: Option<String>,
    pub is_task: bool,
}

/// Partial update of a process row.
#[derive(Debug, Clone, Default)]
pub struct UpdateProcess {
    pub last_status: Option<String>,
    pub last_step: Option<String>,
    pub assignee: Option<String>,
    /// When set, overwrites `(failed_reason, traceback)`; inner `None`s
    /// clear the columns.
    pub failure: Option<(Option<String>, Option<String>)>,
}

/// Filter for listing processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessFilter {
    pub last_status: Option<Vec<String>>,
    pub is_task: Option<bool>,
    pub workflow_name: Option<String>,
}

// ============================================
// Process step models
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct ProcessStepRow {
    pub step_id: Uuid,
    pub process_id: Uuid,
    pub name: String,
    pub status: String,
    pub state: Value,
    pub created_by: Option<String>,
    pub executed_at: DateTime<Utc>,
    pub commit_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateProcessStep {
    pub process_id: Uuid,
    pub name: String,
    pub status: String,
    pub state: Value,
    pub created_by: Option<String>,
}

/// In-place rewrite of an existing step row (retry deduplication and
/// suspend-to-success transitions).
#[derive(Debug, Clone)]
pub struct UpdateProcessStep {
    pub status: Option<String>,
    pub state: Option<Value>,
}

// ============================================
// Workflow models (definition bookkeeping)
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct WorkflowRow {
    pub workflow_id: Uuid,
    pub name: String,
    pub target: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

// ============================================
// Process/subscription relation
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct ProcessSubscriptionRow {
    pub id: Uuid,
    pub process_id: Uuid,
    pub subscription_id: Uuid,
    pub workflow_target: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateProcessSubscription {
    pub process_id: Uuid,
    pub subscription_id: Uuid,
    pub workflow_target: String,
}

// ============================================
// Engine settings (exactly one row)
// ============================================

#[derive(Debug, Clone, FromRow)]
pub struct EngineSettingsRow {
    pub global_lock: bool,
    pub running_processes: i32,
}

impl Default for EngineSettingsRow {
    fn default() -> Self {
        Self {
            global_lock: false,
            running_processes: 0,
        }
    }
}
