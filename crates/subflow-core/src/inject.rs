//! Argument injection: an explicit per-step manifest and its hydration.
//!
//! Each step records at construction time which state keys it consumes
//! and how (plain value, subscription reference, whole state). Hydration
//! is a pure function of the manifest, the state and the domain-model
//! resolver, so it can be tested without running a step.

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::error::StepFailure;
use crate::state::State;

/// How a declared parameter is resolved from the state.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgKind {
    /// Plain lookup of `state[name]`, with an optional default.
    Value,
    /// A subscription reference; hydrated through the resolver.
    Subscription,
    /// A list of subscription references.
    SubscriptionList,
    /// An optional subscription reference; missing resolves to null.
    OptionalSubscription,
    /// The whole state.
    WholeState,
}

/// A single declared parameter.
#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub name: String,
    pub kind: ArgKind,
    pub default: Option<Value>,
}

/// The declared parameter list of a step.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    specs: Vec<ArgSpec>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, spec: ArgSpec) {
        self.specs.push(spec);
    }

    pub fn specs(&self) -> &[ArgSpec] {
        &self.specs
    }
}

/// Errors produced while building step arguments.
#[derive(Debug, Error)]
pub enum InjectError {
    #[error("could not find key '{key}' in state")]
    MissingKey { key: String },

    #[error("key '{key}' does not hold a subscription reference")]
    BadSubscriptionRef { key: String },

    #[error("argument '{key}' has the wrong shape: {source}")]
    Deserialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("loading subscription for '{key}' failed: {message}")]
    Resolver { key: String, message: String },
}

impl From<InjectError> for StepFailure {
    fn from(err: InjectError) -> Self {
        StepFailure::msg(err.to_string())
    }
}

/// Loads and saves domain models on behalf of the engine.
///
/// The engine only ever touches subscriptions through this trait: it
/// hydrates step arguments with `load` and persists models found in a
/// step's returned state with `save`.
pub trait SubscriptionResolver: Send + Sync {
    fn load(&self, subscription_id: Uuid) -> Result<Value, StepFailure>;

    fn save(&self, model: &Value) -> Result<(), StepFailure>;
}

/// Resolver for deployments without a domain layer: loading always
/// fails, saving is a no-op.
pub struct NoSubscriptions;

impl SubscriptionResolver for NoSubscriptions {
    fn load(&self, subscription_id: Uuid) -> Result<Value, StepFailure> {
        Err(StepFailure::msg(format!(
            "no subscription resolver configured (requested {subscription_id})"
        )))
    }

    fn save(&self, _model: &Value) -> Result<(), StepFailure> {
        Ok(())
    }
}

/// The hydrated arguments handed to a step body.
#[derive(Debug)]
pub struct ArgValues {
    values: Vec<(String, Value)>,
}

impl ArgValues {
    /// Take an argument by name, deserializing it into the requested type.
    pub fn take<T: DeserializeOwned>(&mut self, name: &str) -> Result<T, InjectError> {
        let idx = self
            .values
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| InjectError::MissingKey { key: name.into() })?;
        let (key, value) = self.values.remove(idx);
        serde_json::from_value(value).map_err(|source| InjectError::Deserialize { key, source })
    }

    /// Borrow an argument value without consuming it.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// Extract the subscription id out of a state value.
///
/// By convention the value is either the UUID itself (as a string) or a
/// serialized domain model carrying a `subscription_id` key.
fn subscription_id_of(value: &Value) -> Option<Uuid> {
    let candidate = match value {
        Value::Object(map) => map.get("subscription_id")?,
        other => other,
    };
    candidate.as_str().and_then(|s| Uuid::parse_str(s).ok())
}

fn load_one(
    key: &str,
    value: &Value,
    resolver: &dyn SubscriptionResolver,
) -> Result<Value, InjectError> {
    let id = subscription_id_of(value).ok_or_else(|| InjectError::BadSubscriptionRef {
        key: key.to_string(),
    })?;
    resolver.load(id).map_err(|e| InjectError::Resolver {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Hydrate the declared arguments from the state.
pub fn build_arguments(
    manifest: &Manifest,
    state: &State,
    resolver: &dyn SubscriptionResolver,
) -> Result<ArgValues, InjectError> {
    let mut values = Vec::with_capacity(manifest.specs().len());

    for spec in manifest.specs() {
        let value = match spec.kind {
            ArgKind::WholeState => Value::Object(state.clone()),
            ArgKind::Value => match state.get(&spec.name) {
                Some(v) => v.clone(),
                None => spec.default.clone().ok_or_else(|| InjectError::MissingKey {
                    key: spec.name.clone(),
                })?,
            },
            ArgKind::Subscription => {
                let raw = state.get(&spec.name).ok_or_else(|| InjectError::MissingKey {
                    key: spec.name.clone(),
                })?;
                load_one(&spec.name, raw, resolver)?
            }
            ArgKind::OptionalSubscription => match state.get(&spec.name) {
                Some(raw) if subscription_id_of(raw).is_some() => {
                    load_one(&spec.name, raw, resolver)?
                }
                _ => Value::Null,
            },
            ArgKind::SubscriptionList => {
                let raw = state
                    .get(&spec.name)
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let mut models = Vec::with_capacity(raw.len());
                for item in &raw {
                    models.push(load_one(&spec.name, item, resolver)?);
                }
                Value::Array(models)
            }
        };
        values.push((spec.name.clone(), value));
    }

    Ok(ArgValues { values })
}

/// Persist every domain model found in a step's returned state.
///
/// Walks the returned delta depth-first; any JSON object carrying a
/// `subscription_id` key is treated as a serialized domain model and
/// handed to the resolver before the delta is merged into the state.
pub fn save_models(delta: &State, resolver: &dyn SubscriptionResolver) -> Result<(), StepFailure> {
    for value in delta.values() {
        save_value(value, resolver)?;
    }
    Ok(())
}

fn save_value(value: &Value, resolver: &dyn SubscriptionResolver) -> Result<(), StepFailure> {
    match value {
        Value::Object(map) => {
            if map.contains_key("subscription_id") {
                resolver.save(value)?;
            }
            for nested in map.values() {
                save_value(nested, resolver)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                save_value(item, resolver)?;
            }
        }
        _ => {}
    }
    Ok(())
}
