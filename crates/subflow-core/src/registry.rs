//! Process-wide workflow registry with lazy instantiation.
//!
//! Workflows register a factory under a unique name; the factory runs on
//! first lookup and the instance is cached for the process lifetime.
//! Duplicate names are fatal at registration, before dispatch begins.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use thiserror::Error;

use crate::workflow::Workflow;

/// Factory producing a workflow definition on first use.
pub type WorkflowFactory = Arc<dyn Fn() -> Workflow + Send + Sync>;

struct LazyWorkflow {
    name: String,
    factory: WorkflowFactory,
    instance: OnceLock<Arc<Workflow>>,
}

impl LazyWorkflow {
    fn instantiate(&self) -> Arc<Workflow> {
        self.instance
            .get_or_init(|| {
                let mut workflow = (self.factory)();
                // The registered name is authoritative.
                workflow.name = self.name.clone();
                Arc::new(workflow)
            })
            .clone()
    }
}

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A workflow with this name is already registered.
    #[error("workflow '{0}' is already registered")]
    Duplicate(String),
}

/// The process-wide mapping from workflow name to definition.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: RwLock<HashMap<String, Arc<LazyWorkflow>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow factory under a unique name.
    pub fn register<F>(&self, name: impl Into<String>, factory: F) -> Result<(), RegistryError>
    where
        F: Fn() -> Workflow + Send + Sync + 'static,
    {
        let name = name.into();
        let mut workflows = self.workflows.write();
        if workflows.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        workflows.insert(
            name.clone(),
            Arc::new(LazyWorkflow {
                name,
                factory: Arc::new(factory),
                instance: OnceLock::new(),
            }),
        );
        Ok(())
    }

    /// Look up a workflow, instantiating it on first use.
    pub fn get(&self, name: &str) -> Option<Arc<Workflow>> {
        let lazy = self.workflows.read().get(name).cloned();
        lazy.map(|l| l.instantiate())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workflows.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workflows.read().keys().cloned().collect();
        names.sort();
        names
    }
}
