//! Facade-level error taxonomy.
//!
//! Everything the [`Executor`](crate::executor::Executor) raises synchronously
//! to callers lives here. Failures *inside* a running job never surface as
//! errors; they are captured into the job's status trail (see
//! [`Job::execute`](crate::job::Job::execute)).

use miette::Diagnostic;
use thiserror::Error;

use crate::checkpoint::CheckpointError;

/// Errors raised by the executor facade and the procedure/job state machine.
#[derive(Debug, Error, Diagnostic)]
pub enum ExecutorError {
    /// The requested action name is not registered.
    #[error("action is not callable: {fqn}")]
    #[diagnostic(
        code(fabricore::executor::not_callable),
        help("Register the action under `{fqn}` in the ActionRegistry before enqueueing it.")
    )]
    NotCallable { fqn: String },

    /// API misuse: an operation was invoked from the wrong caller context.
    #[error("programming error: {0}")]
    #[diagnostic(code(fabricore::executor::programming))]
    Programming(&'static str),

    /// `start` / `set_number_executors` called while workers exist.
    #[error("executor is already running")]
    #[diagnostic(
        code(fabricore::executor::already_running),
        help("Call shutdown() before reconfiguring or restarting the executor.")
    )]
    AlreadyRunning,

    /// `shutdown` / `enqueue_*` called with no workers running.
    #[error("executor is not running")]
    #[diagnostic(
        code(fabricore::executor::not_running),
        help("Call start() before submitting procedures.")
    )]
    NotRunning,

    /// The procedure/job state machine was driven into an illegal transition.
    #[error("invariant violation: {0}")]
    #[diagnostic(code(fabricore::executor::invariant))]
    InvariantViolation(&'static str),

    /// The checkpoint store failed while recording top-level intent. Raised
    /// only on the enqueue/recovery path. Inside a running job, store
    /// failures are captured into the job status instead.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Checkpoint(#[from] CheckpointError),
}
