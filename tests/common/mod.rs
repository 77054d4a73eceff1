//! Shared fixtures for the integration suites: canned actions, a recording
//! persister, and a harness that wires an executor with inspectable
//! collaborators.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use fabricore::action::{Action, ActionArgs, ActionCall, ActionError, ActionRegistry};
use fabricore::checkpoint::InMemoryCheckpointStore;
use fabricore::executor::Executor;
use fabricore::job::Job;
use fabricore::persister::{Persister, PersisterError, PersisterProvider};
use fabricore::procedure::Procedure;
use fabricore::worker::WorkerScope;

/// Append-only event log shared between fixtures and assertions.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Late-bound executor handle for actions that submit nested work; the
/// registry is built before the executor, so actions cannot capture the
/// `Arc<Executor>` directly.
#[derive(Clone, Default)]
pub struct ExecutorSlot(Arc<OnceLock<Arc<Executor>>>);

impl ExecutorSlot {
    pub fn set(&self, executor: Arc<Executor>) {
        let _ = self.0.set(executor);
    }

    pub fn get(&self) -> Arc<Executor> {
        self.0.get().expect("executor slot unset").clone()
    }
}

/// Persister that records its transaction boundaries into an [`EventLog`]
/// and can be told to fail commits.
pub struct TracePersister {
    log: EventLog,
    fail_commit: Arc<AtomicBool>,
}

#[async_trait]
impl Persister for TracePersister {
    async fn begin(&mut self) -> Result<(), PersisterError> {
        self.log.push("begin");
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), PersisterError> {
        if self.fail_commit.load(Ordering::SeqCst) {
            self.log.push("commit-failed");
            return Err(PersisterError::Database {
                message: "injected commit failure".to_string(),
            });
        }
        self.log.push("commit");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), PersisterError> {
        self.log.push("rollback");
        Ok(())
    }
}

pub struct TracePersisterProvider {
    pub log: EventLog,
    pub fail_commit: Arc<AtomicBool>,
    pub fail_open: bool,
}

#[async_trait]
impl PersisterProvider for TracePersisterProvider {
    async fn open(&self) -> Result<Box<dyn Persister>, PersisterError> {
        if self.fail_open {
            return Err(PersisterError::Connect {
                message: "injected open failure".to_string(),
            });
        }
        Ok(Box::new(TracePersister {
            log: self.log.clone(),
            fail_commit: self.fail_commit.clone(),
        }))
    }
}

/// Action returning a fixed value.
pub struct StaticResult(pub Value);

#[async_trait]
impl Action for StaticResult {
    async fn run(&self, _args: &ActionArgs) -> Result<Value, ActionError> {
        Ok(self.0.clone())
    }
}

/// Action that always fails.
pub struct Boom(pub &'static str);

#[async_trait]
impl Action for Boom {
    async fn run(&self, _args: &ActionArgs) -> Result<Value, ActionError> {
        Err(ActionError::msg(self.0))
    }
}

/// Action recording start/end markers around an optional sleep; the marker
/// tag comes from the first positional argument.
pub struct Record {
    pub log: EventLog,
    pub value: Value,
    pub delay_ms: u64,
}

#[async_trait]
impl Action for Record {
    async fn run(&self, args: &ActionArgs) -> Result<Value, ActionError> {
        let tag = args
            .arg(0)
            .and_then(Value::as_str)
            .unwrap_or("anonymous")
            .to_string();
        self.log.push(format!("start:{tag}"));
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        self.log.push(format!("end:{tag}"));
        Ok(self.value.clone())
    }
}

/// Action detecting concurrent executions of itself.
pub struct OverlapProbe {
    pub active: Arc<AtomicUsize>,
    pub overlaps: Arc<AtomicUsize>,
    pub delay_ms: u64,
}

#[async_trait]
impl Action for OverlapProbe {
    async fn run(&self, _args: &ActionArgs) -> Result<Value, ActionError> {
        if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(json!(true))
    }
}

/// Action staging child jobs on its own procedure (`within_procedure=true`).
pub struct SpawnJobs {
    pub slot: ExecutorSlot,
    pub calls: Vec<ActionCall>,
    pub result: Value,
}

#[async_trait]
impl Action for SpawnJobs {
    async fn run(&self, _args: &ActionArgs) -> Result<Value, ActionError> {
        self.slot
            .get()
            .enqueue_procedures(true, self.calls.clone(), None)
            .await
            .map_err(|e| ActionError::msg(e.to_string()))?;
        Ok(self.result.clone())
    }
}

/// Action staging child procedures (`within_procedure=false`). The uuids of
/// the staged procedures are pushed into the log as `child:<uuid>`.
pub struct SpawnProcedures {
    pub slot: ExecutorSlot,
    pub calls: Vec<ActionCall>,
    pub lockable_objects: Option<BTreeSet<String>>,
    pub log: EventLog,
    pub result: Value,
}

#[async_trait]
impl Action for SpawnProcedures {
    async fn run(&self, _args: &ActionArgs) -> Result<Value, ActionError> {
        let children = self
            .slot
            .get()
            .enqueue_procedures(false, self.calls.clone(), self.lockable_objects.clone())
            .await
            .map_err(|e| ActionError::msg(e.to_string()))?;
        for child in &children {
            self.log.push(format!("child:{}", child.uuid()));
        }
        Ok(self.result.clone())
    }
}

/// Action that tries to wait for its own procedure from inside the job and
/// returns the resulting error message.
pub struct WaitForSelf {
    pub slot: ExecutorSlot,
}

#[async_trait]
impl Action for WaitForSelf {
    async fn run(&self, _args: &ActionArgs) -> Result<Value, ActionError> {
        let scope = WorkerScope::current().expect("action must run on a worker");
        let job = scope.current_job().expect("a job must be executing");
        let procedure = job.procedure().expect("job must have a procedure");
        match self.slot.get().wait_for_procedure(&procedure).await {
            Ok(()) => Ok(json!("no error")),
            Err(error) => Ok(json!(error.to_string())),
        }
    }
}

/// Action that tries to reschedule a procedure from inside a job and returns
/// the resulting error message.
pub struct RescheduleFromJob {
    pub slot: ExecutorSlot,
}

#[async_trait]
impl Action for RescheduleFromJob {
    async fn run(&self, _args: &ActionArgs) -> Result<Value, ActionError> {
        let scope = WorkerScope::current().expect("action must run on a worker");
        let job = scope.current_job().expect("a job must be executing");
        let proc_uuid = job.procedure().expect("job must have a procedure").uuid();
        let call = ActionCall::new(job.action_fqn(), "Replay.");
        match self.slot.get().reschedule_procedure(proc_uuid, vec![call], None) {
            Ok(_) => Ok(json!("no error")),
            Err(error) => Ok(json!(error.to_string())),
        }
    }
}

/// An executor wired with inspectable collaborators.
pub struct Harness {
    pub executor: Arc<Executor>,
    pub registry: Arc<ActionRegistry>,
    pub checkpoints: Arc<InMemoryCheckpointStore>,
    pub log: EventLog,
    pub slot: ExecutorSlot,
    pub fail_commit: Arc<AtomicBool>,
}

pub fn harness(workers: usize) -> Harness {
    let registry = Arc::new(ActionRegistry::new());
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let log = EventLog::default();
    let fail_commit = Arc::new(AtomicBool::new(false));
    let provider = Arc::new(TracePersisterProvider {
        log: log.clone(),
        fail_commit: fail_commit.clone(),
        fail_open: false,
    });
    let executor = Executor::builder()
        .workers(workers)
        .registry(registry.clone())
        .checkpoint_store(checkpoints.clone())
        .persister_provider(provider)
        .build();
    let slot = ExecutorSlot::default();
    slot.set(executor.clone());
    Harness {
        executor,
        registry,
        checkpoints,
        log,
        slot,
        fail_commit,
    }
}

/// Shorthand for a plain action call.
pub fn call(fqn: &str, description: &str) -> ActionCall {
    ActionCall::new(fqn, description)
}

/// A job returning a fixed value, registered on `procedure`.
pub fn static_job(
    procedure: &Arc<Procedure>,
    checkpoints: &Arc<InMemoryCheckpointStore>,
    value: Value,
) -> Arc<Job> {
    Job::new(
        procedure,
        Arc::new(StaticResult(value)),
        "test.static",
        "Return a static value.",
        ActionArgs::default(),
        None,
        checkpoints.clone(),
    )
    .expect("job creation")
}

/// A job whose action fails with the given message.
pub fn boom_job(
    procedure: &Arc<Procedure>,
    checkpoints: &Arc<InMemoryCheckpointStore>,
    message: &'static str,
) -> Arc<Job> {
    Job::new(
        procedure,
        Arc::new(Boom(message)),
        "test.boom",
        "Fail loudly.",
        ActionArgs::default(),
        None,
        checkpoints.clone(),
    )
    .expect("job creation")
}
