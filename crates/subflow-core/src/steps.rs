//! Standard steps shared by the workflow builders.
//!
//! These bracket user-provided steps: marking the start and end of a
//! workflow, locking/unlocking the affected subscription, recording the
//! process/subscription relation and refreshing the search index.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::StepFailure;
use crate::outcome::Outcome;
use crate::state::{keys, State};
use crate::step::{purestep, step, Step};
use crate::steplist::StepList;
use crate::types::{SubscriptionLifecycle, Target};
use crate::state;

/// Start of workflow.
pub fn init() -> StepList {
    purestep("Start", Outcome::Success)
}

/// End of workflow.
pub fn done() -> StepList {
    purestep("Done", Outcome::Complete)
}

/// End of an aborted workflow.
pub fn abort() -> StepList {
    purestep("Abort", Outcome::Abort)
}

/// No-op step to keep step counts equal when editing a deployed
/// workflow that may have suspended instances in production.
pub fn obsolete_step() -> Step {
    step("Equalize workflow step count").build(|_| Ok(State::new()))
}

/// Record which subscription this process affects.
pub fn store_process_subscription(workflow_target: Target) -> Step {
    step("Create process subscription relation")
        .arg(keys::PROCESS_ID)
        .arg("subscription_id")
        .build_with_ctx(move |mut args, ctx| {
            let process_id: Uuid = args.take(keys::PROCESS_ID)?;
            let subscription_id: Uuid = args.take("subscription_id")?;
            ctx.hooks
                .link_subscription(process_id, subscription_id, workflow_target)?;
            Ok(State::new())
        })
}

fn backup_of(model: &Value, existing: Value) -> Value {
    if existing.is_null() {
        model.clone()
    } else {
        existing
    }
}

/// Transition the subscription to out of sync so no concurrent workflow
/// can touch it. Keeps a backup of the pre-change model in the state
/// unless one is already there.
pub fn lock_subscription() -> Step {
    step("Lock subscription")
        .subscription("subscription_id")
        .arg_default(OLD_SUBSCRIPTION_KEY, Value::Null)
        .build(|mut args| {
            let mut model: Value = args.take("subscription_id")?;
            let existing_backup: Value = args.take(OLD_SUBSCRIPTION_KEY)?;
            let backup = backup_of(&model, existing_backup);

            if model.get("insync").and_then(Value::as_bool) == Some(false) {
                return Err(StepFailure::msg(
                    "subscription is already out of sync, cannot continue",
                ));
            }
            model["insync"] = json!(false);

            Ok(state!({"subscription": model, "__old_subscription__": backup}))
        })
}

/// Lock variant for validation workflows, which must run even when the
/// subscription is already out of sync.
pub fn lock_subscription_unchecked() -> Step {
    step("Lock subscription")
        .subscription("subscription_id")
        .build(|mut args| {
            let mut model: Value = args.take("subscription_id")?;
            model["insync"] = json!(false);
            Ok(state!({"subscription": model}))
        })
}

/// Transition the subscription back to in sync.
pub fn unlock_subscription() -> Step {
    step("Unlock subscription")
        .subscription("subscription")
        .build(|mut args| {
            let mut model: Value = args.take("subscription")?;
            model["insync"] = json!(true);
            Ok(state!({"subscription": model}))
        })
}

/// Move the subscription to the given lifecycle value.
pub fn set_lifecycle(lifecycle: SubscriptionLifecycle) -> Step {
    step(format!("Set subscription to '{lifecycle}'"))
        .subscription("subscription")
        .build(move |mut args| {
            let mut model: Value = args.take("subscription")?;
            model["status"] = json!(lifecycle.to_string());
            Ok(state!({"subscription": model}))
        })
}

/// Ask the search collaborator to re-index the subscription.
pub fn refresh_search_index() -> Step {
    step("Refresh subscription search index")
        .arg("subscription_id")
        .build_with_ctx(|mut args, ctx| {
            let subscription_id: Uuid = args.take("subscription_id")?;
            ctx.hooks.refresh_search_index(subscription_id)?;
            Ok(State::new())
        })
}

/// State key holding the pre-modification backup of the subscription.
pub const OLD_SUBSCRIPTION_KEY: &str = "__old_subscription__";
