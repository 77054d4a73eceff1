//! Checkpoint store infrastructure.
//!
//! A [`Checkpoint`] is the durable intent record of one job: enough to replay
//! the job after a crash (procedure uuid, lockable set, job uuid, action FQN
//! and arguments). Records move through a registered → begun → finished
//! lifecycle and are removed together, procedure-wide, when the owning
//! procedure completes.
//!
//! Two implementations ship: [`InMemoryCheckpointStore`] (volatile, for tests
//! and ephemeral deployments) and `SqliteCheckpointStore` (durable, behind
//! the `sqlite` feature).

pub mod models;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use uuid::Uuid;

/// Durable intent record for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub proc_uuid: Uuid,
    pub lockable_objects: BTreeSet<String>,
    pub job_uuid: Uuid,
    pub action_fqn: String,
    pub args: Vec<Value>,
    pub kwargs: FxHashMap<String, Value>,
}

impl Checkpoint {
    #[must_use]
    pub fn new(
        proc_uuid: Uuid,
        lockable_objects: BTreeSet<String>,
        job_uuid: Uuid,
        action_fqn: impl Into<String>,
        args: Vec<Value>,
        kwargs: FxHashMap<String, Value>,
    ) -> Self {
        Self {
            proc_uuid,
            lockable_objects,
            job_uuid,
            action_fqn: action_fqn.into(),
            args,
            kwargs,
        }
    }
}

/// Store-side lifecycle phase of a checkpoint record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointPhase {
    /// Durably recorded, execution not yet started.
    Registered,
    /// The owning job entered its transactional context.
    Begun,
    /// The action returned successfully; awaiting procedure completion.
    Finished,
}

/// Errors from checkpoint store operations.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CheckpointError {
    /// No record exists for the given job.
    #[error("checkpoint not found for job {job_uuid}")]
    #[diagnostic(
        code(fabricore::checkpoint::not_found),
        help("The record may have been removed when its procedure completed.")
    )]
    NotFound { job_uuid: Uuid },

    /// Backend storage error (database, filesystem, etc.).
    #[error("backend error: {message}")]
    #[diagnostic(
        code(fabricore::checkpoint::backend),
        help("Check backend connectivity and permissions; backend message: {message}.")
    )]
    Backend { message: String },

    /// Other checkpoint store errors.
    #[error("checkpoint error: {message}")]
    #[diagnostic(code(fabricore::checkpoint::other))]
    Other { message: String },
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Trait for durable storage of job intent records.
///
/// Implementations must be `Send + Sync`; the store handle is shared by the
/// executor facade, every job, and the recovery path. `register` is the
/// durability point; constructing a [`Checkpoint`] writes nothing.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Whether an action FQN is registered as recoverable. Jobs of
    /// non-recoverable actions execute but cannot be replayed after a crash.
    fn is_recoverable(&self, action_fqn: &str) -> bool;

    /// Mark an action FQN as recoverable.
    fn register_recoverable(&self, action_fqn: &str);

    /// Durably record a batch of intent records. `recoverable` distinguishes
    /// top-level submissions (`false`) from children staged inside a running
    /// job (`true`).
    async fn register(&self, records: Vec<Checkpoint>, recoverable: bool) -> Result<()>;

    /// Mark a record as begun. Called just before the job opens its
    /// transactional context.
    async fn begin(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Mark a record as finished. Called after the action succeeded, before
    /// the transactional commit.
    async fn finish(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Remove every record belonging to the checkpoint's procedure. Called
    /// once, when the procedure completes.
    async fn remove(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Lifecycle phase of a single record, `None` when absent.
    async fn phase(&self, job_uuid: Uuid) -> Result<Option<CheckpointPhase>>;

    /// All unfinished records, in registration order. This is the input to
    /// crash recovery: finished records committed their work and must not be
    /// replayed.
    async fn pending(&self) -> Result<Vec<Checkpoint>>;
}

#[derive(Debug, Clone)]
struct StoredRecord {
    checkpoint: Checkpoint,
    phase: CheckpointPhase,
    #[allow(dead_code)]
    recoverable: bool,
    registered_at: DateTime<Utc>,
}

/// Volatile checkpoint store. Keeps every record in process memory; suitable
/// for tests and deployments that accept losing replay capability on crash.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    records: RwLock<FxHashMap<Uuid, StoredRecord>>,
    recoverable_actions: RwLock<FxHashSet<String>>,
}

impl InMemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    fn is_recoverable(&self, action_fqn: &str) -> bool {
        self.recoverable_actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(action_fqn)
    }

    fn register_recoverable(&self, action_fqn: &str) {
        self.recoverable_actions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(action_fqn.to_string());
    }

    async fn register(&self, records: Vec<Checkpoint>, recoverable: bool) -> Result<()> {
        let mut map = self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for checkpoint in records {
            tracing::debug!(
                job = %checkpoint.job_uuid,
                procedure = %checkpoint.proc_uuid,
                action = %checkpoint.action_fqn,
                recoverable,
                "registering checkpoint"
            );
            map.insert(
                checkpoint.job_uuid,
                StoredRecord {
                    checkpoint,
                    phase: CheckpointPhase::Registered,
                    recoverable,
                    registered_at: Utc::now(),
                },
            );
        }
        Ok(())
    }

    async fn begin(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.set_phase(checkpoint, CheckpointPhase::Begun)
    }

    async fn finish(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.set_phase(checkpoint, CheckpointPhase::Finished)
    }

    async fn remove(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut map = self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        map.retain(|_, record| record.checkpoint.proc_uuid != checkpoint.proc_uuid);
        tracing::debug!(procedure = %checkpoint.proc_uuid, "removed procedure checkpoints");
        Ok(())
    }

    async fn phase(&self, job_uuid: Uuid) -> Result<Option<CheckpointPhase>> {
        let map = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(&job_uuid).map(|record| record.phase))
    }

    async fn pending(&self) -> Result<Vec<Checkpoint>> {
        let map = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut unfinished: Vec<&StoredRecord> = map
            .values()
            .filter(|record| record.phase != CheckpointPhase::Finished)
            .collect();
        unfinished.sort_by_key(|record| record.registered_at);
        Ok(unfinished
            .into_iter()
            .map(|record| record.checkpoint.clone())
            .collect())
    }
}

impl InMemoryCheckpointStore {
    fn set_phase(&self, checkpoint: &Checkpoint, phase: CheckpointPhase) -> Result<()> {
        let mut map = self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let record = map
            .get_mut(&checkpoint.job_uuid)
            .ok_or(CheckpointError::NotFound {
                job_uuid: checkpoint.job_uuid,
            })?;
        record.phase = phase;
        Ok(())
    }
}
