//! Process state: a JSON object threaded through the steps.
//!
//! The state is the sole channel for inter-step data. Steps receive it,
//! return a delta, and the delta is shallow-merged back (returned keys
//! overwrite). Resume input on the other hand is merged recursively so a
//! form that submits a nested object does not clobber sibling keys.

use serde_json::{Map, Value};

/// A JSON-serializable mapping threaded through the steps.
pub type State = Map<String, Value>;

/// Well-known state keys written by the engine.
pub mod keys {
    pub const PROCESS_ID: &str = "process_id";
    pub const REPORTER: &str = "reporter";
    pub const WORKFLOW_NAME: &str = "workflow_name";
    pub const WORKFLOW_TARGET: &str = "workflow_target";

    /// Markers a step group leaves behind when an inner step suspends.
    pub const STEP_GROUP: &str = "__step_group";
    pub const SUB_STEP: &str = "__sub_step";

    /// Retry bookkeeping kept on deduplicated Failed/Waiting rows.
    pub const RETRIES: &str = "retries";
    pub const EXECUTED_AT: &str = "executed_at";
}

/// Build a [`State`] from a JSON object literal.
///
/// ```
/// use subflow_core::state;
///
/// let s = state!({ "steps": [1, 2], "name": "A" });
/// assert_eq!(s["name"], "A");
/// ```
#[macro_export]
macro_rules! state {
    ($($json:tt)+) => {
        $crate::state::expect_object(::serde_json::json!($($json)+))
    };
}

/// Unwrap a JSON value that is statically known to be an object.
///
/// Support function for the [`state!`] macro; panics on non-objects,
/// which the macro rules out.
pub fn expect_object(value: Value) -> State {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got: {other}"),
    }
}

/// Shallow-merge `delta` into `base`; keys from `delta` overwrite.
pub fn merge(mut base: State, delta: State) -> State {
    for (k, v) in delta {
        base.insert(k, v);
    }
    base
}

/// Recursively merge `delta` into `base`.
///
/// Objects are merged key-wise; everything else (including arrays) is
/// replaced by the value from `delta`. Used when merging user input into
/// a suspended state so nested form sections keep their siblings.
pub fn deep_merge(mut base: State, delta: State) -> State {
    for (k, v) in delta {
        match (base.remove(&k), v) {
            (Some(Value::Object(old)), Value::Object(new)) => {
                base.insert(k, Value::Object(deep_merge(old, new)));
            }
            (_, new) => {
                base.insert(k, new);
            }
        }
    }
    base
}
