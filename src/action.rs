//! Procedure actions and their registry.
//!
//! An [`Action`] is the single capability the core executes: invoke with an
//! ordered argument list plus a keyword map, return a JSON value. Actions are
//! registered under a fully-qualified name (FQN); enqueueing resolves the FQN
//! through the [`ActionRegistry`] and the resulting checkpoint records carry
//! only the FQN, which is what makes replay after a restart possible.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::errors::ExecutorError;

/// Argument bundle handed to an action: positional `args` and keyword
/// `kwargs`, both JSON-shaped so heterogeneous administrative payloads can
/// cross the enqueue boundary without a closure-packaging step.
#[derive(Debug, Clone, Default)]
pub struct ActionArgs {
    pub args: Vec<Value>,
    pub kwargs: FxHashMap<String, Value>,
}

impl ActionArgs {
    #[must_use]
    pub fn new(args: Vec<Value>, kwargs: FxHashMap<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Positional argument by index.
    #[must_use]
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Keyword argument by name.
    #[must_use]
    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    /// Positional argument that must be present.
    pub fn require_arg(&self, index: usize) -> Result<&Value, ActionError> {
        self.arg(index).ok_or(ActionError::MissingArgument {
            what: "positional argument out of range",
        })
    }
}

/// Errors raised by actions during execution.
///
/// These never escape [`Job::execute`](crate::job::Job::execute): they are
/// rolled back, diagnosed, and recorded as a `(Complete, Error)` status entry.
#[derive(Debug, Error, Diagnostic)]
pub enum ActionError {
    /// Free-form action failure.
    #[error("{0}")]
    #[diagnostic(code(fabricore::action::failed))]
    Failed(String),

    /// A required argument was absent or out of range.
    #[error("missing argument: {what}")]
    #[diagnostic(
        code(fabricore::action::missing_argument),
        help("Check the args/kwargs the procedure was enqueued with.")
    )]
    MissingArgument { what: &'static str },

    /// Argument or result (de)serialization failed.
    #[error(transparent)]
    #[diagnostic(code(fabricore::action::serde))]
    Serde(#[from] serde_json::Error),
}

impl ActionError {
    /// Convenience constructor for free-form failures.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// A single administrative operation executable by the worker pool.
///
/// Implementations should be stateless; anything mutable belongs in the
/// transactional context owned by the executing worker. Nested submissions
/// happen by calling back into the executor facade from inside `run`; the
/// worker publishes itself through task-local state, so no plumbing is
/// required here.
#[async_trait]
pub trait Action: Send + Sync {
    /// Execute the action with the stored arguments.
    async fn run(&self, args: &ActionArgs) -> Result<Value, ActionError>;
}

/// One entry of an `enqueue_procedures` / `reschedule_procedure` batch.
///
/// `job_uuid` is only supplied when replaying a checkpointed job after a
/// restart, so the recovered job keeps its original identity.
#[derive(Debug, Clone)]
pub struct ActionCall {
    pub fqn: String,
    pub description: String,
    pub args: Vec<Value>,
    pub kwargs: FxHashMap<String, Value>,
    pub job_uuid: Option<Uuid>,
}

impl ActionCall {
    pub fn new(fqn: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            fqn: fqn.into(),
            description: description.into(),
            args: Vec::new(),
            kwargs: FxHashMap::default(),
            job_uuid: None,
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn with_kwargs(mut self, kwargs: FxHashMap<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    #[must_use]
    pub fn with_job_uuid(mut self, job_uuid: Uuid) -> Self {
        self.job_uuid = Some(job_uuid);
        self
    }
}

/// FQN-keyed registry of actions.
///
/// The registry is shared between the executor facade (enqueue-time
/// resolution) and recovery (checkpoint replay). Registration after `start`
/// is allowed; lookups take a read lock only.
#[derive(Default)]
pub struct ActionRegistry {
    actions: RwLock<FxHashMap<String, Arc<dyn Action>>>,
}

impl ActionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `action` under `fqn`, replacing any previous registration.
    pub fn register(&self, fqn: impl Into<String>, action: Arc<dyn Action>) {
        let fqn = fqn.into();
        tracing::debug!(%fqn, "registering action");
        self.actions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fqn, action);
    }

    /// Resolve an FQN to its action.
    pub fn resolve(&self, fqn: &str) -> Result<Arc<dyn Action>, ExecutorError> {
        self.actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(fqn)
            .cloned()
            .ok_or_else(|| ExecutorError::NotCallable {
                fqn: fqn.to_string(),
            })
    }

    /// Whether an FQN is known to the registry.
    #[must_use]
    pub fn contains(&self, fqn: &str) -> bool {
        self.actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(fqn)
    }
}
