//! Steps as values, and the combinators that wrap them.
//!
//! A step bundles a name, an optional assignee and form, and the state
//! transition itself. Most step bodies are plain synchronous functions
//! returning the delta to merge into the state; engine-internal steps
//! may be async to reach the store. Failures are reified into the
//! outcome, they never escape the executor.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::RngCore;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{error_state, panic_error_state, StepFailure};
use crate::forms::{FormFactory, FormFlow, FormPage};
use crate::inject::{
    build_arguments, save_models, ArgKind, ArgSpec, ArgValues, Manifest, NoSubscriptions,
    SubscriptionResolver,
};
use crate::outcome::Outcome;
use crate::state::{keys, merge, State};
use crate::steplist::{begin, StepList};
use crate::types::{Assignee, Target};

/// Engine facilities a step body may call into.
///
/// Implemented by the engine over its store; the defaults are no-ops so
/// the algebra can run without any persistence wired up.
pub trait WorkflowHooks: Send + Sync {
    fn link_subscription(
        &self,
        _process_id: Uuid,
        _subscription_id: Uuid,
        _target: Target,
    ) -> Result<(), StepFailure> {
        Ok(())
    }

    fn refresh_search_index(&self, _subscription_id: Uuid) -> Result<(), StepFailure> {
        Ok(())
    }
}

/// Hooks that do nothing.
pub struct NoopHooks;

impl WorkflowHooks for NoopHooks {}

/// Collaborators available to a step while it runs.
#[derive(Clone)]
pub struct StepContext {
    pub resolver: Arc<dyn SubscriptionResolver>,
    pub hooks: Arc<dyn WorkflowHooks>,
}

impl StepContext {
    pub fn new(resolver: Arc<dyn SubscriptionResolver>, hooks: Arc<dyn WorkflowHooks>) -> Self {
        Self { resolver, hooks }
    }
}

impl Default for StepContext {
    fn default() -> Self {
        Self {
            resolver: Arc::new(NoSubscriptions),
            hooks: Arc::new(NoopHooks),
        }
    }
}

/// The future a step execution resolves to.
pub type StepFuture = BoxFuture<'static, Outcome>;

type ExecFn = Arc<dyn Fn(State, StepContext) -> StepFuture + Send + Sync>;

/// An atomic unit of work with a name and a deterministic outcome.
///
/// Steps are values: two steps wrapping the same function under
/// different names are distinct.
#[derive(Clone)]
pub struct Step {
    pub name: String,
    pub assignee: Option<Assignee>,
    pub form: Option<FormFactory>,
    exec: ExecFn,
    resume_exec: Option<ExecFn>,
}

async fn run_caught(exec: &ExecFn, state: State, ctx: &StepContext, name: &str) -> Outcome {
    let fut = match catch_unwind(AssertUnwindSafe(|| exec(state, ctx.clone()))) {
        Ok(fut) => fut,
        Err(panic) => {
            tracing::error!(step = %name, "step body panicked");
            return Outcome::Failed(panic_error_state(panic.as_ref()));
        }
    };
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            tracing::error!(step = %name, "step body panicked");
            Outcome::Failed(panic_error_state(panic.as_ref()))
        }
    }
}

impl Step {
    /// Run the step. Panics in the body are converted to Failed.
    pub async fn execute(&self, state: State, ctx: &StepContext) -> Outcome {
        run_caught(&self.exec, state, ctx, &self.name).await
    }

    /// Continue the step after a suspension was answered.
    ///
    /// For ordinary input steps the merged state simply becomes Success;
    /// composite steps (groups) override this to pick up where their
    /// inner step left off.
    pub async fn resume(&self, state: State, ctx: &StepContext) -> Outcome {
        match &self.resume_exec {
            Some(exec) => run_caught(exec, state, ctx, &self.name).await,
            None => Outcome::Success(state),
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("assignee", &self.assignee)
            .finish()
    }
}

/// Whether step-body errors become Failed or Waiting.
#[derive(Clone, Copy)]
enum ErrorMode {
    Failed,
    Waiting,
}

fn failure_outcome(mode: ErrorMode, err: &StepFailure) -> Outcome {
    match mode {
        ErrorMode::Failed => Outcome::Failed(error_state(err)),
        ErrorMode::Waiting => Outcome::Waiting(error_state(err)),
    }
}

/// Builder recording a step's name, assignee and argument manifest.
pub struct StepBuilder {
    name: String,
    manifest: Manifest,
    assignee: Option<Assignee>,
    on_error: ErrorMode,
}

/// Start building a workflow step. Errors map to `Failed`.
pub fn step(name: impl Into<String>) -> StepBuilder {
    StepBuilder {
        name: name.into(),
        manifest: Manifest::new(),
        assignee: Some(Assignee::System),
        on_error: ErrorMode::Failed,
    }
}

/// Start building a retryable step. Errors map to `Waiting`, to be
/// retried periodically by the waiting daemon.
pub fn retrystep(name: impl Into<String>) -> StepBuilder {
    StepBuilder {
        on_error: ErrorMode::Waiting,
        ..step(name)
    }
}

impl StepBuilder {
    /// Declare a plain argument resolved from `state[name]`.
    pub fn arg(mut self, name: impl Into<String>) -> Self {
        self.manifest.push(ArgSpec {
            name: name.into(),
            kind: ArgKind::Value,
            default: None,
        });
        self
    }

    /// Declare an argument with a default for when the key is absent.
    pub fn arg_default(mut self, name: impl Into<String>, default: Value) -> Self {
        self.manifest.push(ArgSpec {
            name: name.into(),
            kind: ArgKind::Value,
            default: Some(default),
        });
        self
    }

    /// Declare a subscription argument, hydrated through the resolver.
    pub fn subscription(mut self, name: impl Into<String>) -> Self {
        self.manifest.push(ArgSpec {
            name: name.into(),
            kind: ArgKind::Subscription,
            default: None,
        });
        self
    }

    pub fn subscription_list(mut self, name: impl Into<String>) -> Self {
        self.manifest.push(ArgSpec {
            name: name.into(),
            kind: ArgKind::SubscriptionList,
            default: None,
        });
        self
    }

    pub fn optional_subscription(mut self, name: impl Into<String>) -> Self {
        self.manifest.push(ArgSpec {
            name: name.into(),
            kind: ArgKind::OptionalSubscription,
            default: None,
        });
        self
    }

    /// Bind the whole state under the argument name `state`.
    pub fn state_arg(mut self) -> Self {
        self.manifest.push(ArgSpec {
            name: "state".into(),
            kind: ArgKind::WholeState,
            default: None,
        });
        self
    }

    pub fn assignee(mut self, assignee: Assignee) -> Self {
        self.assignee = Some(assignee);
        self
    }

    /// Finish the step with a body that does not need the context.
    pub fn build<F>(self, f: F) -> Step
    where
        F: Fn(ArgValues) -> Result<State, StepFailure> + Send + Sync + 'static,
    {
        self.build_with_ctx(move |args, _ctx| f(args))
    }

    /// Finish the step with a body that can reach the engine hooks.
    pub fn build_with_ctx<F>(self, f: F) -> Step
    where
        F: Fn(ArgValues, &StepContext) -> Result<State, StepFailure> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.build_async(move |args, ctx| {
            let f = f.clone();
            async move { f(args, &ctx) }.boxed()
        })
    }

    /// Finish the step with an async body.
    ///
    /// Used by engine-internal steps that talk to the store; workflow
    /// authors normally use [`StepBuilder::build`].
    pub fn build_async<F>(self, f: F) -> Step
    where
        F: Fn(ArgValues, StepContext) -> BoxFuture<'static, Result<State, StepFailure>>
            + Send
            + Sync
            + 'static,
    {
        let manifest = self.manifest;
        let on_error = self.on_error;
        let name = self.name.clone();
        let f = Arc::new(f);

        let exec: ExecFn = Arc::new(move |state, ctx| {
            let manifest = manifest.clone();
            let name = name.clone();
            let f = f.clone();
            async move {
                let args = match build_arguments(&manifest, &state, ctx.resolver.as_ref()) {
                    Ok(args) => args,
                    Err(e) => {
                        tracing::warn!(step = %name, error = %e, "argument injection failed");
                        return failure_outcome(on_error, &StepFailure::from(e));
                    }
                };
                match f(args, ctx.clone()).await {
                    Ok(delta) => {
                        if let Err(e) = save_models(&delta, ctx.resolver.as_ref()) {
                            return failure_outcome(on_error, &e);
                        }
                        Outcome::Success(merge(state, delta))
                    }
                    Err(e) => {
                        tracing::warn!(step = %name, error = %e, "step failed");
                        failure_outcome(on_error, &e)
                    }
                }
            }
            .boxed()
        });

        Step {
            name: self.name,
            assignee: self.assignee,
            form: None,
            exec,
            resume_exec: None,
        }
    }
}

/// A user-input step: running it suspends the process until the form is
/// answered. The form factory is only ever driven by the form protocol,
/// never by the executor.
pub fn inputstep(name: impl Into<String>, assignee: Assignee, form: FormFactory) -> Step {
    Step {
        name: name.into(),
        assignee: Some(assignee),
        form: Some(form),
        exec: Arc::new(|state, _ctx| async move { Outcome::Suspend(state) }.boxed()),
        resume_exec: None,
    }
}

/// Wrap a raw `State -> Outcome` function into a step.
pub(crate) fn make_step<F>(name: impl Into<String>, f: F) -> Step
where
    F: Fn(State) -> Outcome + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Step {
        name: name.into(),
        assignee: Some(Assignee::System),
        form: None,
        exec: Arc::new(move |state, _ctx| {
            let f = f.clone();
            async move { f(state) }.boxed()
        }),
        resume_exec: None,
    }
}

/// Map a raw `State -> Outcome` function into a one-step list.
pub fn purestep<F>(name: impl Into<String>, f: F) -> StepList
where
    F: Fn(State) -> Outcome + Send + Sync + 'static,
{
    StepList::from(make_step(name, f))
}

/// Use a predicate to control whether steps run or are skipped.
pub struct Conditional {
    pred: Arc<dyn Fn(&State) -> bool + Send + Sync>,
}

pub fn conditional<P>(pred: P) -> Conditional
where
    P: Fn(&State) -> bool + Send + Sync + 'static,
{
    Conditional {
        pred: Arc::new(pred),
    }
}

impl Conditional {
    /// Wrap steps so they return `Skipped` when the predicate is false.
    pub fn apply(&self, steps: impl Into<StepList>) -> StepList {
        let steps: StepList = steps.into();
        steps.map(|inner| {
            let pred = self.pred.clone();
            let wrapped = inner.clone();
            Step {
                name: inner.name.clone(),
                assignee: inner.assignee,
                form: inner.form.clone(),
                exec: Arc::new(move |state, ctx| {
                    let wrapped = wrapped.clone();
                    let pred = pred.clone();
                    async move {
                        if pred(&state) {
                            wrapped.execute(state, &ctx).await
                        } else {
                            Outcome::Skipped(state)
                        }
                    }
                    .boxed()
                }),
                resume_exec: inner.resume_exec.clone(),
            }
        })
    }
}

/// Zoom steps into the sub-state under a single key.
pub struct Focus {
    key: String,
}

pub fn focussteps(key: impl Into<String>) -> Focus {
    Focus { key: key.into() }
}

impl Focus {
    /// Wrap steps to read `state[key]` (default `{}`) and merge their
    /// result back under `key`. Failed and Waiting pass through as-is.
    pub fn apply(&self, steps: impl Into<StepList>) -> StepList {
        let steps: StepList = steps.into();
        let key = self.key.clone();
        steps.map(move |inner| {
            let key = key.clone();
            let wrapped = inner.clone();
            Step {
                name: inner.name.clone(),
                assignee: inner.assignee,
                form: inner.form.clone(),
                exec: Arc::new(move |state, ctx| {
                    let key = key.clone();
                    let wrapped = wrapped.clone();
                    async move {
                        let sub = match state.get(&key) {
                            Some(Value::Object(map)) => map.clone(),
                            _ => State::new(),
                        };
                        let result = wrapped.execute(sub, &ctx).await;
                        if result.is_failed() || result.is_waiting() {
                            result
                        } else {
                            result.map(|substate| {
                                let mut outer = state.clone();
                                outer.insert(key.clone(), Value::Object(substate));
                                outer
                            })
                        }
                    }
                    .boxed()
                }),
                resume_exec: None,
            }
        })
    }
}

async fn run_group(
    group_name: String,
    steps: StepList,
    state: State,
    ctx: StepContext,
    start: usize,
) -> Outcome {
    let mut process = Outcome::Success(state);

    for step in steps.iter().skip(start) {
        if !process.advances() {
            break;
        }
        let next = step.execute(process.into_state(), &ctx).await;
        match next {
            Outcome::Suspend(mut s) => {
                s.insert(keys::STEP_GROUP.into(), json!(group_name));
                s.insert(keys::SUB_STEP.into(), json!(step.name.clone()));
                return Outcome::Suspend(s);
            }
            Outcome::AwaitingCallback(mut s) => {
                s.insert(keys::STEP_GROUP.into(), json!(group_name));
                s.insert(keys::SUB_STEP.into(), json!(step.name.clone()));
                return Outcome::AwaitingCallback(s);
            }
            other => process = other,
        }
    }

    match process {
        Outcome::Success(mut s) | Outcome::Skipped(mut s) => {
            s.remove(keys::STEP_GROUP);
            s.remove(keys::SUB_STEP);
            Outcome::Success(s)
        }
        other => other,
    }
}

/// Run an inner step list as one composite transition in the parent log.
///
/// When an inner step suspends, the composite outcome carries the group
/// and sub-step markers so that resume replays from the inner step; the
/// markers are stripped once the group completes.
pub fn step_group(name: impl Into<String>, steps: StepList) -> Step {
    let name = name.into();

    let exec_name = name.clone();
    let exec_steps = steps.clone();
    let exec: ExecFn = Arc::new(move |state, ctx| {
        run_group(exec_name.clone(), exec_steps.clone(), state, ctx, 0).boxed()
    });

    let resume_name = name.clone();
    let resume_steps = steps.clone();
    let resume_exec: ExecFn = Arc::new(move |mut state, ctx| {
        let sub_step = state
            .get(keys::SUB_STEP)
            .and_then(Value::as_str)
            .map(str::to_string);
        state.remove(keys::SUB_STEP);
        state.remove(keys::STEP_GROUP);
        match sub_step.and_then(|sub| resume_steps.iter().position(|s| s.name == sub)) {
            Some(idx) => {
                run_group(resume_name.clone(), resume_steps.clone(), state, ctx, idx + 1).boxed()
            }
            None => async move { Outcome::Success(state) }.boxed(),
        }
    });

    // The group exposes the suspended inner step's form as its own.
    let form_steps = steps;
    let form: FormFactory = Arc::new(move |state| {
        let sub_form = state
            .get(keys::SUB_STEP)
            .and_then(Value::as_str)
            .and_then(|sub| form_steps.iter().find(|s| s.name == sub))
            .and_then(|s| s.form.clone());
        match sub_form {
            Some(factory) => factory(state),
            None => Box::new(EmptyFlow),
        }
    });

    Step {
        name,
        assignee: Some(Assignee::System),
        form: Some(form),
        exec,
        resume_exec: Some(resume_exec),
    }
}

/// Flow yielding a single empty page; used when a suspended group has no
/// inner form to present.
struct EmptyFlow;

impl FormFlow for EmptyFlow {
    fn next(&mut self, input: Option<State>) -> crate::forms::FlowStep {
        match input {
            None => crate::forms::FlowStep::Page(FormPage::new("Resume")),
            Some(input) => crate::forms::FlowStep::Done(input),
        }
    }
}

/// Default state key the callback route token is emitted under.
pub const DEFAULT_CALLBACK_ROUTE_KEY: &str = "callback_route";

/// Reserved state key holding the token the engine validates deliveries
/// against. Stripped when the callback is accepted.
pub const CALLBACK_TOKEN_KEY: &str = "__callback_token";

/// A fresh opaque route token from a cryptographically strong RNG.
pub fn new_route_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Expand an action/validate pair into a callback-awaiting sequence.
///
/// The action step emits the request to the external system; the await
/// substep parks the process as AwaitingCallback with a fresh route
/// token; the validate step checks the delivered payload.
pub fn callback_step(
    name: impl Into<String>,
    action: Step,
    validate: Step,
    route_key: Option<&str>,
) -> StepList {
    let name = name.into();
    let route_key = route_key.unwrap_or(DEFAULT_CALLBACK_ROUTE_KEY).to_string();

    let await_step = Step {
        name,
        assignee: Some(Assignee::System),
        form: None,
        exec: Arc::new(move |mut state, _ctx| {
            let token = new_route_token();
            state.insert(route_key.clone(), json!(token));
            state.insert(CALLBACK_TOKEN_KEY.into(), json!(token));
            async move { Outcome::AwaitingCallback(state) }.boxed()
        }),
        resume_exec: None,
    };

    begin() >> action >> await_step >> validate
}
