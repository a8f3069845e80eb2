// Step algebra, outcome sum type and the workflow executor.

pub mod error;
pub mod executor;
pub mod forms;
pub mod inject;
pub mod outcome;
pub mod registry;
pub mod state;
pub mod step;
pub mod steplist;
pub mod steps;
pub mod types;
pub mod workflow;

pub use error::{error_state, StepFailure};
pub use executor::{
    abort_workflow, run_workflow, EngineProbe, NeverLocked, ProcessStat, StepLogger,
};
pub use forms::{
    form, form_with, no_form, post_form, wizard, FieldKind, FormError, FormFactory, FormPage,
};
pub use inject::{
    build_arguments, ArgKind, ArgSpec, ArgValues, InjectError, Manifest, NoSubscriptions,
    SubscriptionResolver,
};
pub use outcome::Outcome;
pub use registry::{RegistryError, WorkflowRegistry};
pub use state::{deep_merge, merge, State};
pub use step::{
    callback_step, conditional, focussteps, inputstep, purestep, retrystep, step, step_group,
    NoopHooks, Step, StepContext, WorkflowHooks, CALLBACK_TOKEN_KEY, DEFAULT_CALLBACK_ROUTE_KEY,
};
pub use steplist::{begin, StepList};
pub use steps::{done, init, obsolete_step};
pub use types::{Assignee, ProcessStatus, StepStatus, SubscriptionLifecycle, Target};
pub use workflow::{
    create_workflow, modify_workflow, reconcile_workflow, terminate_workflow, validate_workflow,
    workflow, AuthPrincipal, Workflow, WorkflowBuilder,
};
