//! End-to-end tests of the executor facade: submission dispatch rules,
//! lifecycle, nested submissions, lock serialisation across workers, weak
//! procedure indexing, and crash recovery.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use common::*;
use fabricore::checkpoint::{Checkpoint, CheckpointStore};
use fabricore::errors::ExecutorError;
use fabricore::executor::{Executor, recover_procedures};
use fabricore::job::{ExecutionOutcome, ExecutionState};

fn locked(objects: &[&str]) -> Option<BTreeSet<String>> {
    Some(objects.iter().map(|s| s.to_string()).collect())
}

#[tokio::test]
async fn single_action_procedure_completes_with_result() {
    let h = harness(1);
    h.registry
        .register("test.static", Arc::new(StaticResult(json!(42))));
    h.executor.start().expect("start");

    let procedure = h
        .executor
        .enqueue_procedure(false, call("test.static", "Return 42."), None)
        .await
        .expect("enqueue");
    h.executor
        .wait_for_procedure(&procedure)
        .await
        .expect("wait");

    assert_eq!(procedure.result(), json!(42));
    let status = procedure.status();
    assert_eq!(status.len(), 3);
    assert_eq!(status[2].state, ExecutionState::Complete);
    assert_eq!(status[2].outcome, ExecutionOutcome::Success);

    h.executor.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn failing_action_produces_error_status_and_false_result() {
    let h = harness(1);
    h.registry.register("test.boom", Arc::new(Boom("boom")));
    h.executor.start().expect("start");

    let procedure = h
        .executor
        .enqueue_procedure(false, call("test.boom", "Fail."), None)
        .await
        .expect("enqueue");
    h.executor
        .wait_for_procedure(&procedure)
        .await
        .expect("wait");

    assert_eq!(procedure.result(), json!(false));
    let status = procedure.status();
    let last = status.last().expect("status");
    assert_eq!(last.outcome, ExecutionOutcome::Error);
    assert!(last.diagnosis.as_deref().is_some_and(|d| d.contains("boom")));
    assert_eq!(h.log.snapshot(), vec!["begin", "rollback"]);

    h.executor.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn within_procedure_children_run_in_order_on_the_same_procedure() {
    let h = harness(1);
    h.registry
        .register("test.two", Arc::new(StaticResult(json!(2))));
    h.registry
        .register("test.three", Arc::new(StaticResult(json!(3))));
    h.registry.register(
        "test.outer",
        Arc::new(SpawnJobs {
            slot: h.slot.clone(),
            calls: vec![
                call("test.two", "Second job."),
                call("test.three", "Third job."),
            ],
            result: json!(1),
        }),
    );
    h.executor.start().expect("start");

    let procedure = h
        .executor
        .enqueue_procedure(false, call("test.outer", "Outer job."), None)
        .await
        .expect("enqueue");
    h.executor
        .wait_for_procedure(&procedure)
        .await
        .expect("wait");

    let executed = procedure.executed_jobs();
    assert_eq!(executed.len(), 3);
    assert_eq!(executed[0].action_fqn(), "test.outer");
    assert_eq!(executed[1].action_fqn(), "test.two");
    assert_eq!(executed[2].action_fqn(), "test.three");
    assert_eq!(procedure.result(), json!(3));

    h.executor.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn child_procedure_is_offered_only_after_the_outer_commit() {
    let h = harness(1);
    h.registry.register(
        "test.child",
        Arc::new(Record {
            log: h.log.clone(),
            value: json!("child-done"),
            delay_ms: 0,
        }),
    );
    h.registry.register(
        "test.outer",
        Arc::new(SpawnProcedures {
            slot: h.slot.clone(),
            calls: vec![call("test.child", "Child procedure.").with_args(vec![json!("child")])],
            lockable_objects: locked(&["child-lock"]),
            log: h.log.clone(),
            result: json!("outer-done"),
        }),
    );
    h.executor.start().expect("start");

    let outer = h
        .executor
        .enqueue_procedure(false, call("test.outer", "Outer."), None)
        .await
        .expect("enqueue");
    h.executor.wait_for_procedure(&outer).await.expect("wait");

    let log = h.log.snapshot();
    let child_uuid: Uuid = log
        .iter()
        .find_map(|entry| entry.strip_prefix("child:"))
        .expect("child uuid logged")
        .parse()
        .expect("uuid");
    let child = h.executor.get_procedure(child_uuid).expect("child handle");
    h.executor.wait_for_procedure(&child).await.expect("wait");

    assert!(outer.is_complete());
    assert!(child.is_complete());
    assert_ne!(outer.uuid(), child.uuid());
    assert_eq!(child.result(), json!("child-done"));

    // The child action started only after the outer transaction committed.
    let commit_at = log
        .iter()
        .position(|entry| entry == "commit")
        .expect("outer commit");
    let child_start = h
        .log
        .snapshot()
        .iter()
        .position(|entry| entry == "start:child")
        .expect("child start");
    assert!(commit_at < child_start);

    h.executor.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn child_procedure_is_not_offered_when_the_commit_fails() {
    let h = harness(1);
    h.registry.register(
        "test.child",
        Arc::new(Record {
            log: h.log.clone(),
            value: json!("child-done"),
            delay_ms: 0,
        }),
    );
    h.registry.register(
        "test.outer",
        Arc::new(SpawnProcedures {
            slot: h.slot.clone(),
            calls: vec![call("test.child", "Child procedure.").with_args(vec![json!("child")])],
            lockable_objects: locked(&["child-lock"]),
            log: h.log.clone(),
            result: json!("outer-done"),
        }),
    );
    h.executor.start().expect("start");
    h.fail_commit.store(true, Ordering::SeqCst);

    let outer = h
        .executor
        .enqueue_procedure(false, call("test.outer", "Outer."), None)
        .await
        .expect("enqueue");
    h.executor.wait_for_procedure(&outer).await.expect("wait");

    // Give a wrongly-offered child time to run before asserting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let log = h.log.snapshot();
    assert!(log.iter().any(|entry| entry == "commit-failed"));
    assert!(!log.iter().any(|entry| entry == "start:child"));

    let child_uuid: Uuid = log
        .iter()
        .find_map(|entry| entry.strip_prefix("child:"))
        .expect("child uuid logged")
        .parse()
        .expect("uuid");
    let child = h.executor.get_procedure(child_uuid).expect("child handle");
    assert!(!child.is_complete());

    h.executor.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn procedures_sharing_a_lockable_object_never_overlap() {
    let h = harness(2);
    let active = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));
    h.registry.register(
        "test.probe",
        Arc::new(OverlapProbe {
            active: active.clone(),
            overlaps: overlaps.clone(),
            delay_ms: 40,
        }),
    );
    h.executor.start().expect("start");

    let first = h
        .executor
        .enqueue_procedure(false, call("test.probe", "Probe."), locked(&["A"]))
        .await
        .expect("enqueue");
    let second = h
        .executor
        .enqueue_procedure(false, call("test.probe", "Probe."), locked(&["A"]))
        .await
        .expect("enqueue");

    h.executor.wait_for_procedure(&first).await.expect("wait");
    h.executor.wait_for_procedure(&second).await.expect("wait");

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);

    h.executor.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn shutdown_drains_all_workers_and_completes_queued_procedures() {
    let h = harness(2);
    h.registry
        .register("test.static", Arc::new(StaticResult(json!("ok"))));
    h.executor.start().expect("start");

    let mut procedures = Vec::new();
    for i in 0..5 {
        procedures.push(
            h.executor
                .enqueue_procedure(
                    false,
                    call("test.static", "One of many."),
                    locked(&[&format!("object-{i}")]),
                )
                .await
                .expect("enqueue"),
        );
    }

    h.executor.shutdown().await.expect("shutdown");
    assert!(!h.executor.is_running());
    for procedure in &procedures {
        assert!(procedure.is_complete());
        assert_eq!(procedure.result(), json!("ok"));
    }

    // A second shutdown finds no workers.
    assert!(matches!(
        h.executor.shutdown().await,
        Err(ExecutorError::NotRunning)
    ));
}

#[tokio::test]
async fn wait_for_procedure_from_inside_a_job_is_a_programming_error() {
    let h = harness(1);
    h.registry
        .register("test.wait_self", Arc::new(WaitForSelf { slot: h.slot.clone() }));
    h.executor.start().expect("start");

    let procedure = h
        .executor
        .enqueue_procedure(false, call("test.wait_self", "Wait on self."), None)
        .await
        .expect("enqueue");
    h.executor
        .wait_for_procedure(&procedure)
        .await
        .expect("wait");

    let message = procedure.result();
    assert!(
        message
            .as_str()
            .is_some_and(|m| m.contains("cannot wait for the execution of a procedure"))
    );

    h.executor.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn reschedule_from_inside_a_job_is_a_programming_error() {
    let h = harness(1);
    h.registry.register(
        "test.reschedule",
        Arc::new(RescheduleFromJob { slot: h.slot.clone() }),
    );
    h.executor.start().expect("start");

    let procedure = h
        .executor
        .enqueue_procedure(false, call("test.reschedule", "Replay self."), None)
        .await
        .expect("enqueue");
    h.executor
        .wait_for_procedure(&procedure)
        .await
        .expect("wait");

    let message = procedure.result();
    assert!(
        message
            .as_str()
            .is_some_and(|m| m.contains("cannot reschedule a procedure from a job"))
    );

    h.executor.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn within_procedure_from_outside_any_job_is_a_programming_error() {
    let h = harness(1);
    h.registry
        .register("test.static", Arc::new(StaticResult(json!(1))));
    h.executor.start().expect("start");

    let result = h
        .executor
        .enqueue_procedure(true, call("test.static", "Nested without a job."), None)
        .await;
    assert!(matches!(result, Err(ExecutorError::Programming(_))));

    h.executor.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn lifecycle_errors_are_reported() {
    let h = harness(1);
    h.registry
        .register("test.static", Arc::new(StaticResult(json!(1))));

    // Not running yet.
    assert!(matches!(
        h.executor
            .enqueue_procedure(false, call("test.static", "Too early."), None)
            .await,
        Err(ExecutorError::NotRunning)
    ));
    assert!(matches!(
        h.executor.shutdown().await,
        Err(ExecutorError::NotRunning)
    ));

    h.executor.set_number_executors(2).expect("reconfigure");
    h.executor.start().expect("start");

    assert!(matches!(
        h.executor.start(),
        Err(ExecutorError::AlreadyRunning)
    ));
    assert!(matches!(
        h.executor.set_number_executors(4),
        Err(ExecutorError::AlreadyRunning)
    ));

    h.executor.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn unknown_action_is_not_callable() {
    let h = harness(1);
    h.executor.start().expect("start");

    let result = h
        .executor
        .enqueue_procedure(false, call("test.missing", "Nobody home."), None)
        .await;
    assert!(matches!(result, Err(ExecutorError::NotCallable { .. })));

    h.executor.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn completed_unreferenced_procedures_are_collectible() {
    let h = harness(1);
    h.registry
        .register("test.static", Arc::new(StaticResult(json!(1))));
    h.executor.start().expect("start");

    let procedure = h
        .executor
        .enqueue_procedure(false, call("test.static", "Collectible."), None)
        .await
        .expect("enqueue");
    let uuid = procedure.uuid();
    h.executor
        .wait_for_procedure(&procedure)
        .await
        .expect("wait");

    // While the caller holds the handle, the index resolves it.
    assert!(h.executor.get_procedure(uuid).is_some());

    drop(procedure);
    // Give the worker a moment to drop its own handle after completion.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.executor.get_procedure(uuid).is_none());

    // Forced removal of an absent entry is silent.
    h.executor.remove_procedure(uuid);
    h.executor.remove_procedure(Uuid::new_v4());

    h.executor.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn worker_without_database_session_exits_without_poisoning_shutdown() {
    let h = {
        let mut h = harness(1);
        // Rebuild the executor with a provider that cannot open sessions.
        let provider = Arc::new(TracePersisterProvider {
            log: h.log.clone(),
            fail_commit: h.fail_commit.clone(),
            fail_open: true,
        });
        h.executor = Executor::builder()
            .workers(1)
            .registry(h.registry.clone())
            .checkpoint_store(h.checkpoints.clone())
            .persister_provider(provider)
            .build();
        h
    };
    h.executor.start().expect("start");

    // The worker task exits on its own; shutdown still joins cleanly.
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.executor.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn pending_checkpoints_replay_under_the_original_procedure_uuid() {
    let h = harness(1);
    h.registry.register(
        "test.record",
        Arc::new(Record {
            log: h.log.clone(),
            value: json!("replayed"),
            delay_ms: 0,
        }),
    );
    h.checkpoints.register_recoverable("test.record");

    // Simulate records left behind by a crashed process.
    let proc_uuid = Uuid::new_v4();
    let job_uuid = Uuid::new_v4();
    h.checkpoints
        .register(
            vec![Checkpoint::new(
                proc_uuid,
                BTreeSet::from(["shard-9".to_string()]),
                job_uuid,
                "test.record",
                vec![json!("replay")],
                Default::default(),
            )],
            false,
        )
        .await
        .expect("register");

    h.executor.start().expect("start");
    let recovered = recover_procedures(&h.executor).await.expect("recover");
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].uuid(), proc_uuid);

    h.executor
        .wait_for_procedure(&recovered[0])
        .await
        .expect("wait");
    assert_eq!(recovered[0].result(), json!("replayed"));
    assert_eq!(
        recovered[0].executed_jobs()[0].uuid(),
        job_uuid,
        "replayed job keeps its original identity"
    );

    // Completion removed the replayed records.
    assert!(h.checkpoints.pending().await.expect("pending").is_empty());

    h.executor.shutdown().await.expect("shutdown");
}
