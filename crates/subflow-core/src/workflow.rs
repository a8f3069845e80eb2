//! Workflow definitions and the builders that assemble them.
//!
//! A builder wraps the user's core steps with the standard prologue and
//! epilogue for the workflow's target, mirroring how every provisioning
//! workflow starts by recording what it touches and ends by releasing it.

use std::fmt;
use std::sync::Arc;

use crate::forms::{no_form, FormFactory};
use crate::steplist::{begin, StepList};
use crate::steps::{
    done, init, lock_subscription, lock_subscription_unchecked, refresh_search_index,
    set_lifecycle, store_process_subscription, unlock_subscription,
};
use crate::types::{SubscriptionLifecycle, Target};

/// The authenticated principal a start request is authorized against.
#[derive(Debug, Clone, Default)]
pub struct AuthPrincipal {
    pub user: String,
    pub roles: Vec<String>,
}

type AuthorizeFn = Arc<dyn Fn(Option<&AuthPrincipal>) -> bool + Send + Sync>;
type RunPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// A named, ordered sequence of steps plus an initial input form and a
/// target classification. Immutable once registered.
#[derive(Clone)]
pub struct Workflow {
    /// Unique name; stamped by the registry at instantiation.
    pub name: String,
    pub description: String,
    pub target: Target,
    pub initial_input_form: FormFactory,
    pub steps: StepList,
    pub authorize_callback: Option<AuthorizeFn>,
    pub run_predicate: Option<RunPredicate>,
}

impl Workflow {
    /// Processes of SYSTEM workflows are tasks, subject to retention
    /// cleanup.
    pub fn is_task(&self) -> bool {
        self.target == Target::System
    }

    pub fn authorize(&self, principal: Option<&AuthPrincipal>) -> bool {
        match &self.authorize_callback {
            Some(check) => check(principal),
            None => true,
        }
    }

    /// Whether the start predicate (if any) allows starting now.
    pub fn may_start(&self) -> bool {
        match &self.run_predicate {
            Some(pred) => pred(),
            None => true,
        }
    }
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("steps", &self.steps)
            .finish()
    }
}

/// Builder for workflow definitions.
pub struct WorkflowBuilder {
    description: String,
    target: Target,
    initial_input_form: Option<FormFactory>,
    additional_steps: StepList,
    lifecycle: SubscriptionLifecycle,
    authorize_callback: Option<AuthorizeFn>,
    run_predicate: Option<RunPredicate>,
}

impl WorkflowBuilder {
    fn new(description: impl Into<String>, target: Target) -> Self {
        Self {
            description: description.into(),
            target,
            initial_input_form: None,
            additional_steps: begin(),
            lifecycle: SubscriptionLifecycle::Active,
            authorize_callback: None,
            run_predicate: None,
        }
    }

    pub fn with_form(mut self, form: FormFactory) -> Self {
        self.initial_input_form = Some(form);
        self
    }

    /// Extra steps appended after the core steps, before the epilogue.
    pub fn additional_steps(mut self, steps: StepList) -> Self {
        self.additional_steps = steps;
        self
    }

    /// Lifecycle a create workflow leaves the subscription in.
    pub fn lifecycle(mut self, lifecycle: SubscriptionLifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn authorize<F>(mut self, check: F) -> Self
    where
        F: Fn(Option<&AuthPrincipal>) -> bool + Send + Sync + 'static,
    {
        self.authorize_callback = Some(Arc::new(check));
        self
    }

    pub fn run_predicate<F>(mut self, pred: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.run_predicate = Some(Arc::new(pred));
        self
    }

    /// Assemble the workflow around the given core steps.
    pub fn build(self, core: StepList) -> Workflow {
        let additional = self.additional_steps.clone();
        let steps = match self.target {
            // Plain workflows (tasks included) bring their own framing.
            Target::System => core >> additional,
            Target::Create => {
                init()
                    >> core
                    >> additional
                    >> set_lifecycle(self.lifecycle)
                    >> unlock_subscription()
                    >> refresh_search_index()
                    >> done()
            }
            Target::Modify => {
                init()
                    >> store_process_subscription(Target::Modify)
                    >> lock_subscription()
                    >> core
                    >> additional
                    >> unlock_subscription()
                    >> refresh_search_index()
                    >> done()
            }
            Target::Terminate => {
                init()
                    >> store_process_subscription(Target::Terminate)
                    >> lock_subscription()
                    >> core
                    >> additional
                    >> set_lifecycle(SubscriptionLifecycle::Terminated)
                    >> unlock_subscription()
                    >> refresh_search_index()
                    >> done()
            }
            Target::Validate => {
                init()
                    >> store_process_subscription(Target::System)
                    >> lock_subscription_unchecked()
                    >> core
                    >> additional
                    >> unlock_subscription()
                    >> done()
            }
            Target::Reconcile => {
                init()
                    >> store_process_subscription(Target::Reconcile)
                    >> lock_subscription_unchecked()
                    >> core
                    >> additional
                    >> unlock_subscription()
                    >> refresh_search_index()
                    >> done()
            }
        };

        Workflow {
            name: String::new(),
            description: self.description,
            target: self.target,
            initial_input_form: self.initial_input_form.unwrap_or_else(no_form),
            steps,
            authorize_callback: self.authorize_callback,
            run_predicate: self.run_predicate,
        }
    }
}

/// A plain workflow; the step list is used as given.
pub fn workflow(description: impl Into<String>) -> WorkflowBuilder {
    WorkflowBuilder::new(description, Target::System)
}

/// A workflow that provisions a new subscription.
pub fn create_workflow(description: impl Into<String>) -> WorkflowBuilder {
    WorkflowBuilder::new(description, Target::Create)
}

/// A workflow that modifies an existing subscription.
pub fn modify_workflow(description: impl Into<String>) -> WorkflowBuilder {
    WorkflowBuilder::new(description, Target::Modify)
}

/// A workflow that terminates a subscription.
pub fn terminate_workflow(description: impl Into<String>) -> WorkflowBuilder {
    WorkflowBuilder::new(description, Target::Terminate)
}

/// A workflow that checks a subscription against the real world.
pub fn validate_workflow(description: impl Into<String>) -> WorkflowBuilder {
    WorkflowBuilder::new(description, Target::Validate)
}

/// A workflow that reconciles a subscription with external systems.
pub fn reconcile_workflow(description: impl Into<String>) -> WorkflowBuilder {
    WorkflowBuilder::new(description, Target::Reconcile)
}
