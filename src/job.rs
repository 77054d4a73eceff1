//! Jobs: one transactional unit of work.
//!
//! A job wraps a registered action and is scheduled through the executor
//! within the context of a [`Procedure`]. [`Job::execute`] is the hot path of
//! the core: it drives the action through the worker's transactional context
//! with crash-recovery checkpoints, captures failures into the status trail,
//! and flushes nested submissions staged by the action.
//!
//! The step ordering in `execute` is load-bearing: child checkpoints are
//! registered *before* the commit so intent is durable, and children are
//! enqueued *after* the commit so they never run on behalf of a transaction
//! that failed to commit.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;
use uuid::Uuid;

use crate::action::{Action, ActionArgs, ActionError};
use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use crate::errors::ExecutorError;
use crate::persister::{Persister, PersisterError};
use crate::procedure::Procedure;
use crate::queue::JobQueue;
use crate::scheduler::Scheduler;

/// Execution phase recorded in a status entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    Created,
    Processing,
    Complete,
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Processing => write!(f, "Processing"),
            Self::Complete => write!(f, "Complete"),
        }
    }
}

/// Outcome recorded in a status entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    Success,
    Error,
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// One entry of a job's status trail. The RPC layer above returns these
/// verbatim, hence the serde derives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEntry {
    pub when: DateTime<Utc>,
    pub state: ExecutionState,
    pub outcome: ExecutionOutcome,
    pub description: String,
    pub diagnosis: Option<String>,
}

/// Failures that can interrupt the pre-commit half of `execute`. They are
/// captured into the status trail, never propagated to the worker.
#[derive(Debug, thiserror::Error)]
enum ExecFailure {
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Persister(#[from] PersisterError),
}

impl ExecFailure {
    /// Render the failure and its source chain into a diagnosis string.
    fn diagnosis(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str("\ncaused by: ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }
}

struct JobState {
    status: Vec<StatusEntry>,
    result: Option<Value>,
    complete: bool,
    child_jobs: Vec<Arc<Job>>,
    child_procedures: Vec<Arc<Procedure>>,
}

/// A code block scheduled through the executor within the context of a
/// procedure.
pub struct Job {
    uuid: Uuid,
    procedure: Weak<Procedure>,
    action: Arc<dyn Action>,
    action_fqn: String,
    description: String,
    args: ActionArgs,
    is_recoverable: bool,
    checkpoint: Checkpoint,
    checkpoints: Arc<dyn CheckpointStore>,
    state: Mutex<JobState>,
}

impl Job {
    /// Create a job and register it with its procedure's scheduled set.
    ///
    /// The action has already been resolved through the registry (an unknown
    /// FQN fails there with `NotCallable`). When the checkpoint store does
    /// not know the FQN as recoverable a warning is emitted and the job
    /// proceeds without checkpoint begin/finish marks.
    pub fn new(
        procedure: &Arc<Procedure>,
        action: Arc<dyn Action>,
        action_fqn: impl Into<String>,
        description: impl Into<String>,
        args: ActionArgs,
        uuid: Option<Uuid>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Result<Arc<Self>, ExecutorError> {
        let action_fqn = action_fqn.into();
        let description = description.into();
        let is_recoverable = checkpoints.is_recoverable(&action_fqn);
        if !is_recoverable {
            tracing::warn!(
                action = %action_fqn,
                "action is not recoverable; after a failure the fabric may not \
                 be able to restore the system to a consistent state"
            );
        }

        let uuid = uuid.unwrap_or_else(Uuid::new_v4);
        let checkpoint = Checkpoint::new(
            procedure.uuid(),
            procedure.lockable_objects().clone(),
            uuid,
            action_fqn.clone(),
            args.args.clone(),
            args.kwargs.clone(),
        );

        let job = Arc::new(Self {
            uuid,
            procedure: Arc::downgrade(procedure),
            action,
            action_fqn,
            description: description.clone(),
            args,
            is_recoverable,
            checkpoint,
            checkpoints,
            state: Mutex::new(JobState {
                status: Vec::new(),
                result: None,
                complete: false,
                child_jobs: Vec::new(),
                child_procedures: Vec::new(),
            }),
        });

        job.add_status(ExecutionState::Created, ExecutionOutcome::Success, description, None);
        procedure.add_scheduled_job(&job)?;
        Ok(job)
    }

    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The procedure this job belongs to. `None` only if the procedure was
    /// dropped, which cannot happen while the job is scheduled or executing.
    #[must_use]
    pub fn procedure(&self) -> Option<Arc<Procedure>> {
        self.procedure.upgrade()
    }

    #[must_use]
    pub fn action_fqn(&self) -> &str {
        &self.action_fqn
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub fn args(&self) -> &ActionArgs {
        &self.args
    }

    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.is_recoverable
    }

    #[must_use]
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    #[must_use]
    pub fn checkpoint_store(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.lock().complete
    }

    /// Status trail. Readable only after completion.
    #[must_use]
    pub fn status(&self) -> Vec<StatusEntry> {
        let state = self.lock();
        debug_assert!(state.complete, "status read before completion");
        state.status.clone()
    }

    /// The action's return value, or `false` after a failed execution.
    /// Readable only after completion.
    #[must_use]
    pub fn result(&self) -> Option<Value> {
        let state = self.lock();
        debug_assert!(state.complete, "result read before completion");
        state.result.clone()
    }

    /// Stage jobs to be scheduled on this job's own procedure after the
    /// current execution commits. Callable only while executing.
    pub fn append_jobs(&self, jobs: Vec<Arc<Job>>) {
        let mut state = self.lock();
        debug_assert!(!state.complete, "append_jobs on a complete job");
        state.child_jobs.extend(jobs);
    }

    /// Stage procedures to be offered to the scheduler after the current
    /// execution commits. Callable only while executing.
    pub fn append_procedures(&self, procedures: Vec<Arc<Procedure>>) {
        let mut state = self.lock();
        debug_assert!(!state.complete, "append_procedures on a complete job");
        state.child_procedures.extend(procedures);
    }

    /// Execute the job under the worker's transactional context.
    ///
    /// Failures never escape: action, checkpoint and database errors all end
    /// up as status entries, and the owning procedure continues with its next
    /// job. The completion handshake with the procedure always runs, even on
    /// the failure path: it is what may complete the procedure and wake its
    /// waiters.
    #[instrument(skip_all, fields(job = %self.uuid, action = %self.action_fqn))]
    pub async fn execute(
        self: &Arc<Self>,
        persister: &mut dyn Persister,
        scheduler: &Scheduler,
        queue: &JobQueue,
    ) {
        match self.run_action(persister).await {
            Err(failure) => {
                tracing::error!(error = %failure, "action execution failed");
                if let Err(rollback_error) = persister.rollback().await {
                    tracing::error!(error = %rollback_error, "rollback failed");
                }
                self.lock().result = Some(Value::Bool(false));
                self.add_status(
                    ExecutionState::Complete,
                    ExecutionOutcome::Error,
                    format!("Tried to execute action ({}).", self.action_fqn),
                    Some(failure.diagnosis()),
                );
            }
            Ok(result) => {
                self.lock().result = Some(result);
                if let Err(commit_error) = self.flush_children(persister, scheduler, queue).await {
                    // The success status below is appended regardless: the
                    // job is not reclassified on a commit failure. Recovery
                    // replays the procedure from its checkpoints instead.
                    tracing::error!(error = %commit_error, "commit of job context failed");
                }
                self.add_status(
                    ExecutionState::Complete,
                    ExecutionOutcome::Success,
                    format!("Executed action ({}).", self.action_fqn),
                    None,
                );
            }
        }

        self.lock().complete = true;
        match self.procedure.upgrade() {
            Some(procedure) => {
                if let Err(invariant) = procedure.add_executed_job(self).await {
                    tracing::error!(error = %invariant, "completion handshake failed");
                }
            }
            None => {
                tracing::error!("owning procedure dropped before job completion");
            }
        }
    }

    /// Steps up to and including the action invocation: Processing status,
    /// checkpoint begin, transaction begin, action run.
    async fn run_action(&self, persister: &mut dyn Persister) -> Result<Value, ExecFailure> {
        self.add_status(
            ExecutionState::Processing,
            ExecutionOutcome::Success,
            format!("Executing action ({}).", self.action_fqn),
            None,
        );
        if self.is_recoverable {
            self.checkpoints.begin(&self.checkpoint).await?;
        }
        persister.begin().await?;
        let result = self.action.run(&self.args).await?;
        Ok(result)
    }

    /// Post-action success path: make child intent durable, finish the
    /// checkpoint, commit, and only then hand children over for execution.
    async fn flush_children(
        &self,
        persister: &mut dyn Persister,
        scheduler: &Scheduler,
        queue: &JobQueue,
    ) -> Result<(), ExecFailure> {
        let (child_jobs, child_procedures) = {
            let state = self.lock();
            (state.child_jobs.clone(), state.child_procedures.clone())
        };

        let records: Vec<Checkpoint> = child_jobs
            .iter()
            .map(|job| job.checkpoint().clone())
            .collect();
        if !records.is_empty() {
            self.checkpoints.register(records, true).await?;
        }
        for procedure in &child_procedures {
            debug_assert!(procedure.executed_jobs().is_empty());
            let records: Vec<Checkpoint> = procedure
                .scheduled_jobs()
                .iter()
                .map(|job| job.checkpoint().clone())
                .collect();
            if !records.is_empty() {
                self.checkpoints.register(records, true).await?;
            }
        }

        if self.is_recoverable {
            self.checkpoints.finish(&self.checkpoint).await?;
        }
        persister.commit().await?;

        queue.schedule(child_jobs).await;
        scheduler.enqueue_procedures(child_procedures);
        Ok(())
    }

    fn add_status(
        &self,
        state: ExecutionState,
        outcome: ExecutionOutcome,
        description: String,
        diagnosis: Option<String>,
    ) {
        tracing::debug!(
            job = %self.uuid,
            action = %self.action_fqn,
            %state,
            %outcome,
            "{description}"
        );
        self.lock().status.push(StatusEntry {
            when: Utc::now(),
            state,
            outcome,
            description,
            diagnosis,
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}

impl Eq for Job {}

impl Hash for Job {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uuid.hash(state);
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("uuid", &self.uuid)
            .field("action_fqn", &self.action_fqn)
            .field("is_recoverable", &self.is_recoverable)
            .field("complete", &self.is_complete())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Job uuid={}, action={}, complete={}>",
            self.uuid,
            self.action_fqn,
            self.is_complete()
        )
    }
}
