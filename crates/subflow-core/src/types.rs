//! Shared enums: targets, assignees, lifecycle values and statuses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Classification of a workflow; shapes the standard step prologue/epilogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Target {
    Create,
    Modify,
    Terminate,
    Validate,
    Reconcile,
    System,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Modify => write!(f, "MODIFY"),
            Self::Terminate => write!(f, "TERMINATE"),
            Self::Validate => write!(f, "VALIDATE"),
            Self::Reconcile => write!(f, "RECONCILE"),
            Self::System => write!(f, "SYSTEM"),
        }
    }
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Self::Create),
            "MODIFY" => Ok(Self::Modify),
            "TERMINATE" => Ok(Self::Terminate),
            "VALIDATE" => Ok(Self::Validate),
            "RECONCILE" => Ok(Self::Reconcile),
            "SYSTEM" => Ok(Self::System),
            other => Err(format!("unknown target: {other}")),
        }
    }
}

/// Who must act next on a suspended or failed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Assignee {
    System,
    Changes,
    Noc,
}

impl fmt::Display for Assignee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "SYSTEM"),
            Self::Changes => write!(f, "CHANGES"),
            Self::Noc => write!(f, "NOC"),
        }
    }
}

impl FromStr for Assignee {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SYSTEM" => Ok(Self::System),
            "CHANGES" => Ok(Self::Changes),
            "NOC" => Ok(Self::Noc),
            other => Err(format!("unknown assignee: {other}")),
        }
    }
}

/// Lifecycle a subscription moves through; used by the standard steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionLifecycle {
    Initial,
    Provisioning,
    Active,
    Terminated,
}

impl fmt::Display for SubscriptionLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::Provisioning => write!(f, "provisioning"),
            Self::Active => write!(f, "active"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Status persisted on a single step row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Skipped,
    Suspend,
    AwaitingCallback,
    Waiting,
    Failed,
    Abort,
    Complete,
}

impl StepStatus {
    /// Statuses that count as executed when reconciling a step log
    /// against the current workflow definition.
    pub fn is_executed(&self) -> bool {
        matches!(self, Self::Success | Self::Skipped | Self::Complete)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Skipped => write!(f, "skipped"),
            Self::Suspend => write!(f, "suspend"),
            Self::AwaitingCallback => write!(f, "awaiting_callback"),
            Self::Waiting => write!(f, "waiting"),
            Self::Failed => write!(f, "failed"),
            Self::Abort => write!(f, "abort"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "skipped" => Ok(Self::Skipped),
            "suspend" => Ok(Self::Suspend),
            "awaiting_callback" => Ok(Self::AwaitingCallback),
            "waiting" => Ok(Self::Waiting),
            "failed" => Ok(Self::Failed),
            "abort" => Ok(Self::Abort),
            "complete" => Ok(Self::Complete),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

/// Overall status of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Created,
    Running,
    Resumed,
    Suspended,
    AwaitingCallback,
    Waiting,
    Aborted,
    Failed,
    ApiUnavailable,
    InconsistentData,
    Completed,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Resumed => write!(f, "resumed"),
            Self::Suspended => write!(f, "suspended"),
            Self::AwaitingCallback => write!(f, "awaiting_callback"),
            Self::Waiting => write!(f, "waiting"),
            Self::Aborted => write!(f, "aborted"),
            Self::Failed => write!(f, "failed"),
            Self::ApiUnavailable => write!(f, "api_unavailable"),
            Self::InconsistentData => write!(f, "inconsistent_data"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

impl FromStr for ProcessStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "resumed" => Ok(Self::Resumed),
            "suspended" => Ok(Self::Suspended),
            "awaiting_callback" => Ok(Self::AwaitingCallback),
            "waiting" => Ok(Self::Waiting),
            "aborted" => Ok(Self::Aborted),
            "failed" => Ok(Self::Failed),
            "api_unavailable" => Ok(Self::ApiUnavailable),
            "inconsistent_data" => Ok(Self::InconsistentData),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown process status: {other}")),
        }
    }
}

impl ProcessStatus {
    /// Statuses from which `resume` is allowed to proceed.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Self::Created
                | Self::Suspended
                | Self::Waiting
                | Self::Failed
                | Self::ApiUnavailable
                | Self::InconsistentData
        )
    }
}
