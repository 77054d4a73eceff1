//! Procedures: the unit of admission control and the synchronisation handle
//! returned to callers.
//!
//! A procedure groups one or more [`Job`]s under a shared lockable-object
//! set. Jobs are added to the *scheduled* set when created and moved to the
//! *executed* list as they finish; the procedure completes exactly when at
//! least one job has executed and the scheduled set is empty, and the flag
//! never flips back. During the execution of a job, new jobs may be scheduled
//! in the context of the current procedure.
//!
//! Ownership: a procedure owns its jobs (`Arc<Job>`); each job points back
//! with a `Weak` reference. The executor facade indexes procedures weakly by
//! uuid, so a completed procedure is reclaimed as soon as the caller drops
//! the handle returned from enqueue.

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::errors::ExecutorError;
use crate::job::{Job, StatusEntry};

/// The well-known lockable object used when a procedure does not name any.
pub const DEFAULT_LOCKABLE_OBJECT: &str = "lock";

struct ProcedureState {
    complete: bool,
    result: Value,
    status: Vec<StatusEntry>,
    scheduled: Vec<Arc<Job>>,
    executed: Vec<Arc<Job>>,
}

/// The context within which jobs execute, and the handle callers wait on.
pub struct Procedure {
    uuid: Uuid,
    lockable_objects: BTreeSet<String>,
    priority: bool,
    state: Mutex<ProcedureState>,
    completed: watch::Sender<bool>,
}

impl Procedure {
    /// Create a procedure with a fresh uuid.
    #[must_use]
    pub fn new(lockable_objects: Option<BTreeSet<String>>) -> Arc<Self> {
        Self::build(None, lockable_objects, false)
    }

    /// Create a procedure under a caller-supplied uuid (checkpoint replay).
    #[must_use]
    pub fn with_uuid(uuid: Uuid, lockable_objects: Option<BTreeSet<String>>) -> Arc<Self> {
        Self::build(Some(uuid), lockable_objects, false)
    }

    /// Create a high-priority procedure: the scheduler admits it ahead of
    /// FIFO order when its lockable objects are free.
    #[must_use]
    pub fn with_priority(lockable_objects: Option<BTreeSet<String>>) -> Arc<Self> {
        Self::build(None, lockable_objects, true)
    }

    fn build(
        uuid: Option<Uuid>,
        lockable_objects: Option<BTreeSet<String>>,
        priority: bool,
    ) -> Arc<Self> {
        let uuid = uuid.unwrap_or_else(Uuid::new_v4);
        let lockable_objects = match lockable_objects {
            Some(set) if !set.is_empty() => set,
            _ => BTreeSet::from([DEFAULT_LOCKABLE_OBJECT.to_string()]),
        };
        let (completed, _) = watch::channel(false);
        tracing::debug!(procedure = %uuid, "created procedure");
        Arc::new(Self {
            uuid,
            lockable_objects,
            priority,
            state: Mutex::new(ProcedureState {
                complete: false,
                result: Value::Bool(true),
                status: Vec::new(),
                scheduled: Vec::new(),
                executed: Vec::new(),
            }),
            completed,
        })
    }

    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The objects that must be locked before this procedure starts
    /// executing.
    #[must_use]
    pub fn lockable_objects(&self) -> &BTreeSet<String> {
        &self.lockable_objects
    }

    /// Whether this procedure takes precedence over others contending for a
    /// common subset of lockable objects.
    #[must_use]
    pub fn priority(&self) -> bool {
        self.priority
    }

    /// Whether the procedure has finished.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.lock().complete
    }

    /// Jobs scheduled on behalf of this procedure, in insertion order.
    #[must_use]
    pub fn scheduled_jobs(&self) -> Vec<Arc<Job>> {
        self.lock().scheduled.clone()
    }

    /// Jobs executed on behalf of this procedure, in completion order.
    #[must_use]
    pub fn executed_jobs(&self) -> Vec<Arc<Job>> {
        self.lock().executed.clone()
    }

    /// The procedure's aggregate result: the result of the last executed job
    /// that produced one. For jobs added `within_procedure`, execution order
    /// equals insertion order on the pinned worker, so "last" is
    /// well-defined. Readable only after completion.
    #[must_use]
    pub fn result(&self) -> Value {
        let state = self.lock();
        debug_assert!(state.complete, "result read before completion");
        state.result.clone()
    }

    /// Concatenated status entries of every executed job. Readable only
    /// after completion.
    #[must_use]
    pub fn status(&self) -> Vec<StatusEntry> {
        let state = self.lock();
        debug_assert!(state.complete, "status read before completion");
        state.status.clone()
    }

    /// Register that a job has been scheduled on behalf of this procedure.
    pub fn add_scheduled_job(&self, job: &Arc<Job>) -> Result<(), ExecutorError> {
        let mut state = self.lock();
        if state.complete {
            return Err(ExecutorError::InvariantViolation(
                "cannot schedule a job on a complete procedure",
            ));
        }
        if Self::contains(&state.scheduled, job) || Self::contains(&state.executed, job) {
            return Err(ExecutorError::InvariantViolation(
                "job is already known to the procedure",
            ));
        }
        state.scheduled.push(job.clone());
        Ok(())
    }

    /// Register that a job has been executed on behalf of this procedure.
    ///
    /// Moves the job from scheduled to executed, folds its result and status
    /// into the aggregates, and, when the scheduled set drains, marks the
    /// procedure complete, wakes all waiters and removes the procedure's
    /// checkpoint records.
    pub async fn add_executed_job(&self, job: &Arc<Job>) -> Result<(), ExecutorError> {
        let completed = {
            let mut state = self.lock();
            if state.complete {
                return Err(ExecutorError::InvariantViolation(
                    "procedure is already complete",
                ));
            }
            let position = state
                .scheduled
                .iter()
                .position(|scheduled| scheduled.uuid() == job.uuid())
                .ok_or(ExecutorError::InvariantViolation(
                    "executed job was never scheduled",
                ))?;
            let job = state.scheduled.remove(position);

            match job.result() {
                Some(result) if !result.is_null() => state.result = result,
                _ => {}
            }
            state.status.extend(job.status());
            state.executed.push(job);

            if state.scheduled.is_empty() {
                state.complete = true;
                true
            } else {
                false
            }
        };

        if completed {
            let _ = self.completed.send(true);
            if let Err(error) = job.checkpoint_store().remove(job.checkpoint()).await {
                tracing::error!(
                    procedure = %self.uuid,
                    %error,
                    "failed to remove checkpoints of completed procedure"
                );
            }
            tracing::debug!(procedure = %self.uuid, "complete procedure");
        }
        Ok(())
    }

    /// Wait until the procedure finishes its execution.
    pub async fn wait(&self) {
        let mut completed = self.completed.subscribe();
        // wait_for re-checks the flag on every change, so spurious wake-ups
        // are harmless; an error means the sender side is gone, which cannot
        // happen while `self` is alive.
        let _ = completed.wait_for(|done| *done).await;
    }

    fn contains(jobs: &[Arc<Job>], job: &Arc<Job>) -> bool {
        jobs.iter().any(|known| known.uuid() == job.uuid())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProcedureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PartialEq for Procedure {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}

impl Eq for Procedure {}

impl Hash for Procedure {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uuid.hash(state);
    }
}

impl fmt::Debug for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Procedure")
            .field("uuid", &self.uuid)
            .field("lockable_objects", &self.lockable_objects)
            .field("priority", &self.priority)
            .field("complete", &self.is_complete())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        let executed: Vec<String> = state
            .executed
            .iter()
            .map(|job| job.uuid().to_string())
            .collect();
        let scheduled: Vec<String> = state
            .scheduled
            .iter()
            .map(|job| job.uuid().to_string())
            .collect();
        write!(
            f,
            "<Procedure uuid={}, complete={}, exec_jobs={:?}, sche_jobs={:?}>",
            self.uuid, state.complete, executed, scheduled
        )
    }
}
