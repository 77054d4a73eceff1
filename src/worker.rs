//! Executor workers.
//!
//! A worker is a long-lived task that pulls one procedure at a time from the
//! scheduler, drains *that procedure's* jobs from its own queue to
//! completion, then asks the scheduler for the next admitted procedure. A
//! procedure is pinned to the worker that admitted it for its whole
//! lifetime, so its jobs execute strictly sequentially and in insertion
//! order.
//!
//! While running, the worker publishes itself through a task-local
//! [`WorkerScope`]; that is how the executor facade distinguishes
//! inside-a-job submissions from outside ones without any plumbing through
//! action signatures.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use crate::job::Job;
use crate::persister::PersisterProvider;
use crate::procedure::Procedure;
use crate::queue::JobQueue;
use crate::scheduler::Scheduler;

tokio::task_local! {
    static WORKER_SCOPE: WorkerScope;
}

/// The slice of worker state visible to code running inside one of its jobs.
#[derive(Clone)]
pub struct WorkerScope {
    name: Arc<str>,
    queue: Arc<JobQueue>,
    current_job: Arc<Mutex<Option<Arc<Job>>>>,
}

impl WorkerScope {
    /// The scope of the worker executing the current task, if any. Returns
    /// `None` when called from outside any job.
    #[must_use]
    pub fn current() -> Option<WorkerScope> {
        WORKER_SCOPE.try_with(|scope| scope.clone()).ok()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The queue owned by this worker.
    #[must_use]
    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// The job this worker is currently executing.
    #[must_use]
    pub fn current_job(&self) -> Option<Arc<Job>> {
        self.current_job
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_current_job(&self, job: Option<Arc<Job>>) {
        *self
            .current_job
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = job;
    }
}

/// A long-lived task draining procedures handed out by the scheduler.
pub struct ExecutorWorker {
    name: String,
    scheduler: Arc<Scheduler>,
    persisters: Arc<dyn PersisterProvider>,
    queue: Arc<JobQueue>,
}

impl ExecutorWorker {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        scheduler: Arc<Scheduler>,
        persisters: Arc<dyn PersisterProvider>,
        queue_capacity: Option<usize>,
    ) -> Self {
        Self {
            name: name.into(),
            scheduler,
            persisters,
            queue: Arc::new(JobQueue::new(queue_capacity)),
        }
    }

    /// Launch the worker task.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Worker main loop. Exits when the scheduler hands out a shutdown
    /// sentinel; a job in flight always finishes before the sentinel is
    /// observed.
    #[instrument(skip(self), fields(worker = %self.name))]
    pub async fn run(self) {
        info!("worker started");

        // The worker owns exactly one database session for its lifetime.
        // Failing to open one is fatal to this worker only.
        let mut persister = match self.persisters.open().await {
            Ok(persister) => persister,
            Err(error) => {
                error!(%error, "failed to open database session, worker exiting");
                return;
            }
        };

        let scope = WorkerScope {
            name: Arc::from(self.name.as_str()),
            queue: self.queue.clone(),
            current_job: Arc::new(Mutex::new(None)),
        };
        let scheduler = self.scheduler;
        let queue = self.queue;

        WORKER_SCOPE
            .scope(scope.clone(), async move {
                let mut procedure: Option<Arc<Procedure>> = None;
                loop {
                    if procedure.as_ref().is_none_or(|p| p.is_complete()) {
                        let previous = procedure.take();
                        debug_assert!(previous.as_ref().is_none_or(|p| p.is_complete()));
                        scheduler.done(previous.as_deref());
                        // Release the handle before blocking on the scheduler
                        // so a completed, caller-dropped procedure is
                        // reclaimable from the weak index.
                        drop(previous);
                        procedure = match scheduler.next_procedure().await {
                            None => {
                                debug!("received shutdown sentinel");
                                break;
                            }
                            Some(next) => {
                                debug!(procedure = %next.uuid(), "picked up procedure");
                                debug_assert!(!next.is_complete());
                                debug_assert!(next.executed_jobs().is_empty());
                                queue.schedule(next.scheduled_jobs()).await;
                                Some(next)
                            }
                        };
                    }

                    let Some(job) = queue.get().await else {
                        debug!("job queue disconnected");
                        break;
                    };
                    debug!(job = %job.uuid(), "executing job");
                    scope.set_current_job(Some(job.clone()));
                    job.execute(persister.as_mut(), &scheduler, &queue).await;
                    scope.set_current_job(None);
                    queue.done();
                }
            })
            .await;

        info!("worker stopped");
    }
}
