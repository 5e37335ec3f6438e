//! Action lifecycle contract and registry
//!
//! Every step is carried out by an action with three phases:
//! - `pre` validates and prepares; a failure aborts the stage
//! - `hook` does the work and may produce an `ActionResult`
//! - `post` cleans up and runs for every action whose `pre` succeeded
//!
//! The executor only sees `Box<dyn Action>`; which implementation a step gets
//! is decided by the factories registered under its `uses` identifier.

mod shell;
mod workdir;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tether_core::domain::job::Step;
use tether_core::domain::result::ActionResult;

use crate::context::ExecutionContext;

pub use shell::ShellAction;
pub use workdir::WorkdirAction;

/// Identifier of the default action
pub const SHELL: &str = "shell";

#[async_trait]
pub trait Action: Send {
    async fn pre(&mut self, ctx: &mut ExecutionContext) -> Result<()>;

    async fn hook(&mut self, ctx: &mut ExecutionContext) -> Result<Option<ActionResult>>;

    async fn post(&mut self, ctx: &mut ExecutionContext) -> Result<()>;
}

/// Builds the action for one step
pub type ActionFactory = Arc<dyn Fn(&Step) -> Box<dyn Action> + Send + Sync>;

/// Maps `uses` identifiers to action factories
///
/// Empty or unknown identifiers fall back to the shell action. Steps naming a
/// `runs-on` environment get an extra action from the environment factory,
/// run before the step's own action and cleaned up after it.
#[derive(Clone)]
pub struct ActionRegistry {
    factories: HashMap<String, ActionFactory>,
    environment: Option<ActionFactory>,
}

impl ActionRegistry {
    /// A registry with the built-in actions
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
            environment: None,
        };
        registry.register(SHELL, |step| Box::new(ShellAction::new(step)));
        registry.register("workdir", |step| Box::new(WorkdirAction::new(step)));
        registry
    }

    pub fn register<F>(&mut self, uses: impl Into<String>, factory: F)
    where
        F: Fn(&Step) -> Box<dyn Action> + Send + Sync + 'static,
    {
        self.factories.insert(uses.into(), Arc::new(factory));
    }

    /// Sets the factory that materializes `runs-on` environments
    pub fn register_environment<F>(&mut self, factory: F)
    where
        F: Fn(&Step) -> Box<dyn Action> + Send + Sync + 'static,
    {
        self.environment = Some(Arc::new(factory));
    }

    pub fn contains(&self, uses: &str) -> bool {
        self.factories.contains_key(uses)
    }

    /// Builds the action for a step
    pub fn create(&self, step: &Step) -> Box<dyn Action> {
        let uses = step.uses.as_str();
        match self.factories.get(uses) {
            Some(factory) => factory(step),
            None => {
                if !uses.is_empty() {
                    tracing::warn!(
                        "Unknown action `{}` in step {}, running as shell",
                        uses,
                        step.name
                    );
                }
                Box::new(ShellAction::new(step))
            }
        }
    }

    /// Builds the environment action for a step, if it names one and a factory exists
    pub fn environment(&self, step: &Step) -> Option<Box<dyn Action>> {
        step.runs_on.as_ref()?;
        self.environment.as_ref().map(|factory| factory(step))
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
