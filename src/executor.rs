//! The executor facade: the single entry point for submitting, replaying and
//! waiting on procedures.
//!
//! The executor owns the worker pool and a weak, uuid-keyed index of live
//! procedures. The owning reference of a procedure is the `Arc` returned
//! from enqueue; once the caller drops it and the procedure is complete, the
//! index entry is reclaimed. Lifecycle is explicit ([`start`](Executor::start)
//! and [`shutdown`](Executor::shutdown)) and initialisation is ordered after
//! the scheduler and checkpoint store are built, so no global constructors
//! are involved.
//!
//! Submission is context-sensitive: called from outside any job it creates
//! fresh procedures and offers them to the scheduler immediately; called
//! from inside a job (detected through the worker's task-local scope) it
//! stages children on the current job, to be flushed only when that job's
//! transaction commits.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::action::{ActionArgs, ActionCall, ActionRegistry};
use crate::checkpoint::{Checkpoint, CheckpointStore, InMemoryCheckpointStore};
use crate::config::ExecutorConfig;
use crate::errors::ExecutorError;
use crate::job::Job;
use crate::persister::{NoopPersisterProvider, PersisterProvider};
use crate::procedure::Procedure;
use crate::scheduler::Scheduler;
use crate::worker::{ExecutorWorker, WorkerScope};

/// Builder for [`Executor`].
pub struct ExecutorBuilder {
    workers: usize,
    queue_capacity: Option<usize>,
    registry: Arc<ActionRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    persisters: Arc<dyn PersisterProvider>,
}

impl Default for ExecutorBuilder {
    fn default() -> Self {
        Self {
            workers: 1,
            queue_capacity: None,
            registry: Arc::new(ActionRegistry::new()),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            persisters: Arc::new(NoopPersisterProvider),
        }
    }
}

impl ExecutorBuilder {
    /// Number of concurrent workers to launch on `start`.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Bound each worker's job queue; unbounded by default.
    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Apply worker count and queue capacity from a resolved configuration.
    #[must_use]
    pub fn config(mut self, config: &ExecutorConfig) -> Self {
        self.workers = config.workers.max(1);
        self.queue_capacity = config.queue_capacity;
        self
    }

    #[must_use]
    pub fn registry(mut self, registry: Arc<ActionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn checkpoint_store(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    #[must_use]
    pub fn persister_provider(mut self, persisters: Arc<dyn PersisterProvider>) -> Self {
        self.persisters = persisters;
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<Executor> {
        Arc::new(Executor {
            scheduler: Arc::new(Scheduler::new()),
            registry: self.registry,
            checkpoints: self.checkpoints,
            persisters: self.persisters,
            queue_capacity: self.queue_capacity,
            procedures: Mutex::new(FxHashMap::default()),
            workers: Mutex::new(Vec::new()),
            number_executors: Mutex::new(self.workers),
        })
    }
}

/// Dispatches execution of procedures over a pool of workers.
pub struct Executor {
    scheduler: Arc<Scheduler>,
    registry: Arc<ActionRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    persisters: Arc<dyn PersisterProvider>,
    queue_capacity: Option<usize>,
    procedures: Mutex<FxHashMap<Uuid, Weak<Procedure>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    number_executors: Mutex<usize>,
}

impl Executor {
    #[must_use]
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::default()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn checkpoint_store(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// Set the number of concurrent workers. Fails once workers exist.
    pub fn set_number_executors(&self, number_executors: usize) -> Result<(), ExecutorError> {
        let workers = self.lock_workers();
        if !workers.is_empty() {
            return Err(ExecutorError::AlreadyRunning);
        }
        *self.lock_number() = number_executors.max(1);
        Ok(())
    }

    /// Whether any workers are running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.lock_workers().is_empty()
    }

    /// Construct and launch the configured number of workers.
    #[instrument(skip(self), err)]
    pub fn start(&self) -> Result<(), ExecutorError> {
        let mut workers = self.lock_workers();
        if !workers.is_empty() {
            return Err(ExecutorError::AlreadyRunning);
        }
        let number_executors = *self.lock_number();
        info!(workers = number_executors, "starting executor");
        for nw in 0..number_executors {
            let worker = ExecutorWorker::new(
                format!("executor-{nw}"),
                self.scheduler.clone(),
                self.persisters.clone(),
                self.queue_capacity,
            );
            workers.push(worker.spawn());
        }
        info!("executor started");
        Ok(())
    }

    /// Shut the pool down: one sentinel per worker, then join them all.
    ///
    /// Workers finish the job they are executing before observing the
    /// sentinel; procedures still queued behind held locks are left queued.
    #[instrument(skip(self), err)]
    pub async fn shutdown(&self) -> Result<(), ExecutorError> {
        info!("shutting down executor");
        let workers = {
            let mut workers = self.lock_workers();
            if workers.is_empty() {
                return Err(ExecutorError::NotRunning);
            }
            std::mem::take(&mut *workers)
        };

        for _ in 0..workers.len() {
            self.scheduler.enqueue_procedure(None);
        }
        for worker in workers {
            if let Err(error) = worker.await {
                warn!(%error, "worker task failed to join");
            }
        }
        info!("executor has stopped");
        Ok(())
    }

    /// Join all workers without initiating shutdown. Returns immediately if
    /// none are running.
    pub async fn wait(&self) {
        let workers = std::mem::take(&mut *self.lock_workers());
        for worker in workers {
            if let Err(error) = worker.await {
                warn!(%error, "worker task failed to join");
            }
        }
    }

    /// Schedule one procedure. See [`enqueue_procedures`](Self::enqueue_procedures).
    pub async fn enqueue_procedure(
        &self,
        within_procedure: bool,
        call: ActionCall,
        lockable_objects: Option<BTreeSet<String>>,
    ) -> Result<Arc<Procedure>, ExecutorError> {
        let mut procedures = self
            .enqueue_procedures(within_procedure, vec![call], lockable_objects)
            .await?;
        procedures
            .pop()
            .ok_or(ExecutorError::InvariantViolation("no procedure was created"))
    }

    /// Schedule a set of procedures, one per action call.
    ///
    /// Dispatch depends on the caller's context:
    /// - outside any job, `within_procedure` must be `false`; fresh
    ///   procedures are registered with the checkpoint store as top-level
    ///   and offered to the scheduler immediately;
    /// - inside a job with `within_procedure = true`, the calls become jobs
    ///   of the caller's own procedure, staged on the current job;
    /// - inside a job with `within_procedure = false`, fresh procedures are
    ///   staged on the current job and only become durable and runnable when
    ///   its transaction commits.
    #[instrument(skip_all, fields(count = calls.len(), within = within_procedure), err)]
    pub async fn enqueue_procedures(
        &self,
        within_procedure: bool,
        calls: Vec<ActionCall>,
        lockable_objects: Option<BTreeSet<String>>,
    ) -> Result<Vec<Arc<Procedure>>, ExecutorError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }
        // TODO: hold the worker lock through the enqueue so a racing
        // shutdown cannot observe half-submitted procedures.
        self.assert_running()?;

        match WorkerScope::current() {
            None => {
                if within_procedure {
                    return Err(ExecutorError::Programming(
                        "one can only create a new job from a job",
                    ));
                }
                let (procedures, jobs) = self.create_jobs(&calls, lockable_objects, None)?;
                debug_assert_eq!(procedures.len(), jobs.len());
                let records: Vec<Checkpoint> =
                    jobs.iter().map(|job| job.checkpoint().clone()).collect();
                self.checkpoints.register(records, false).await?;
                self.scheduler.enqueue_procedures(procedures.clone());
                Ok(procedures)
            }
            Some(scope) => {
                let current_job =
                    scope
                        .current_job()
                        .ok_or(ExecutorError::InvariantViolation(
                            "worker scope present without an executing job",
                        ))?;
                if within_procedure {
                    let current_procedure =
                        current_job
                            .procedure()
                            .ok_or(ExecutorError::InvariantViolation(
                                "executing job lost its procedure",
                            ))?;
                    let (procedures, jobs) =
                        self.create_jobs(&calls, lockable_objects, Some(current_procedure.uuid()))?;
                    debug_assert!(procedures.iter().all(|p| **p == *current_procedure));
                    current_job.append_jobs(jobs);
                    Ok(procedures)
                } else {
                    let (procedures, jobs) = self.create_jobs(&calls, lockable_objects, None)?;
                    debug_assert_eq!(procedures.len(), jobs.len());
                    current_job.append_procedures(procedures.clone());
                    Ok(procedures)
                }
            }
        }
    }

    /// Replay a procedure after crash recovery by rescheduling its jobs
    /// under the original procedure uuid. Must not be called from inside a
    /// job.
    #[instrument(skip_all, fields(procedure = %proc_uuid, count = calls.len()), err)]
    pub fn reschedule_procedure(
        &self,
        proc_uuid: Uuid,
        calls: Vec<ActionCall>,
        lockable_objects: Option<BTreeSet<String>>,
    ) -> Result<Vec<Arc<Procedure>>, ExecutorError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }
        self.assert_running()?;
        if WorkerScope::current().is_some() {
            return Err(ExecutorError::Programming(
                "one cannot reschedule a procedure from a job",
            ));
        }
        let (procedures, jobs) = self.create_jobs(&calls, lockable_objects, Some(proc_uuid))?;
        debug_assert!(
            jobs.iter()
                .all(|job| job.procedure().is_some_and(|p| procedures.contains(&p)))
        );
        self.scheduler.enqueue_procedures(procedures.clone());
        Ok(procedures)
    }

    /// Force eviction from the weak procedure index. Silent when absent.
    pub fn remove_procedure(&self, proc_uuid: Uuid) {
        let mut procedures = self.lock_procedures();
        if let Some(weak) = procedures.get(&proc_uuid) {
            if let Some(procedure) = weak.upgrade() {
                debug_assert!(procedure.is_complete());
            }
            procedures.remove(&proc_uuid);
        }
    }

    /// Retrieve a live procedure by uuid.
    #[must_use]
    pub fn get_procedure(&self, proc_uuid: Uuid) -> Option<Arc<Procedure>> {
        debug!(procedure = %proc_uuid, "checking procedure");
        self.lock_procedures()
            .get(&proc_uuid)
            .and_then(Weak::upgrade)
    }

    /// Wait until the procedure finishes all of its jobs.
    ///
    /// Forbidden from inside a job: the worker would deadlock against its
    /// own queue.
    pub async fn wait_for_procedure(&self, procedure: &Procedure) -> Result<(), ExecutorError> {
        if WorkerScope::current().is_some() {
            return Err(ExecutorError::Programming(
                "one cannot wait for the execution of a procedure from a job",
            ));
        }
        procedure.wait().await;
        Ok(())
    }

    fn assert_running(&self) -> Result<(), ExecutorError> {
        if self.lock_workers().is_empty() {
            return Err(ExecutorError::NotRunning);
        }
        Ok(())
    }

    /// Create one job per call. With `proc_uuid` supplied every job lands on
    /// that (existing or recreated) procedure; otherwise each call gets a
    /// fresh procedure.
    fn create_jobs(
        &self,
        calls: &[ActionCall],
        lockable_objects: Option<BTreeSet<String>>,
        proc_uuid: Option<Uuid>,
    ) -> Result<(Vec<Arc<Procedure>>, Vec<Arc<Job>>), ExecutorError> {
        let mut procedures: Vec<Arc<Procedure>> = Vec::new();
        let mut jobs = Vec::new();
        for call in calls {
            let action = self.registry.resolve(&call.fqn)?;
            let procedure = self.lookup_or_create(proc_uuid, lockable_objects.clone());
            let job = Job::new(
                &procedure,
                action,
                call.fqn.clone(),
                call.description.clone(),
                ActionArgs::new(call.args.clone(), call.kwargs.clone()),
                call.job_uuid,
                self.checkpoints.clone(),
            )?;
            jobs.push(job);
            if !procedures.iter().any(|known| known.uuid() == procedure.uuid()) {
                procedures.push(procedure);
            }
        }
        Ok((procedures, jobs))
    }

    /// Look a procedure up in the weak index, or create and install it.
    /// Dead entries are pruned on the way.
    fn lookup_or_create(
        &self,
        proc_uuid: Option<Uuid>,
        lockable_objects: Option<BTreeSet<String>>,
    ) -> Arc<Procedure> {
        let mut procedures = self.lock_procedures();
        procedures.retain(|_, weak| weak.strong_count() > 0);

        if let Some(uuid) = proc_uuid {
            if let Some(existing) = procedures.get(&uuid).and_then(Weak::upgrade) {
                return existing;
            }
        }
        let procedure = match proc_uuid {
            Some(uuid) => Procedure::with_uuid(uuid, lockable_objects),
            None => Procedure::new(lockable_objects),
        };
        procedures.insert(procedure.uuid(), Arc::downgrade(&procedure));
        procedure
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_procedures(&self) -> std::sync::MutexGuard<'_, FxHashMap<Uuid, Weak<Procedure>>> {
        self.procedures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_number(&self) -> std::sync::MutexGuard<'_, usize> {
        self.number_executors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Replay every unfinished checkpoint through
/// [`Executor::reschedule_procedure`], grouped by owning procedure.
///
/// Records whose action FQN is no longer registered are logged and skipped;
/// they cannot be replayed by this build of the fabric.
pub async fn recover_procedures(
    executor: &Executor,
) -> Result<Vec<Arc<Procedure>>, ExecutorError> {
    let pending = executor.checkpoints.pending().await?;

    let mut order: Vec<Uuid> = Vec::new();
    let mut groups: FxHashMap<Uuid, (BTreeSet<String>, Vec<ActionCall>)> = FxHashMap::default();
    for checkpoint in pending {
        if !executor.registry.contains(&checkpoint.action_fqn) {
            warn!(
                action = %checkpoint.action_fqn,
                job = %checkpoint.job_uuid,
                "skipping checkpoint of unregistered action"
            );
            continue;
        }
        let call = ActionCall::new(
            checkpoint.action_fqn.clone(),
            format!("Recovering action ({}).", checkpoint.action_fqn),
        )
        .with_args(checkpoint.args.clone())
        .with_kwargs(checkpoint.kwargs.clone())
        .with_job_uuid(checkpoint.job_uuid);

        let entry = groups.entry(checkpoint.proc_uuid).or_insert_with(|| {
            order.push(checkpoint.proc_uuid);
            (checkpoint.lockable_objects.clone(), Vec::new())
        });
        entry.1.push(call);
    }

    let mut recovered = Vec::new();
    for proc_uuid in order {
        let Some((lockable_objects, calls)) = groups.remove(&proc_uuid) else {
            continue;
        };
        info!(procedure = %proc_uuid, jobs = calls.len(), "rescheduling procedure");
        recovered.extend(executor.reschedule_procedure(
            proc_uuid,
            calls,
            Some(lockable_objects),
        )?);
    }
    Ok(recovered)
}
