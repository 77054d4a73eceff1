//! Property tests for the procedure/job state machine.

mod common;

use std::sync::Arc;

use proptest::prelude::*;
use serde_json::{Value, json};

use common::*;
use fabricore::checkpoint::InMemoryCheckpointStore;
use fabricore::job::{ExecutionOutcome, ExecutionState};
use fabricore::persister::NoopPersister;
use fabricore::procedure::Procedure;
use fabricore::queue::JobQueue;
use fabricore::scheduler::Scheduler;
use uuid::Uuid;

fn block_on<F: std::future::Future<Output = ()>>(fut: F) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(fut);
}

/// One planned job: `Ok(Some(v))` returns `v`, `Ok(None)` returns JSON null,
/// `Err` fails the action.
fn job_plan_strategy() -> impl Strategy<Value = Result<Option<i64>, ()>> {
    prop_oneof![
        3 => any::<i64>().prop_map(|v| Ok(Some(v))),
        1 => Just(Ok(None)),
        1 => Just(Err(())),
    ]
}

proptest! {
    /// Every job's status trail is exactly Created → Processing → Complete,
    /// whatever the action does.
    #[test]
    fn status_sequence_is_created_processing_complete(plan in job_plan_strategy()) {
        block_on(async move {
            let checkpoints = Arc::new(InMemoryCheckpointStore::new());
            let procedure = Procedure::new(None);
            let job = match plan {
                Ok(Some(v)) => static_job(&procedure, &checkpoints, json!(v)),
                Ok(None) => static_job(&procedure, &checkpoints, Value::Null),
                Err(()) => boom_job(&procedure, &checkpoints, "planned failure"),
            };

            let mut persister = NoopPersister::default();
            job.execute(&mut persister, &Scheduler::new(), &JobQueue::new(None))
                .await;

            let states: Vec<ExecutionState> =
                job.status().iter().map(|entry| entry.state).collect();
            assert_eq!(
                states,
                vec![
                    ExecutionState::Created,
                    ExecutionState::Processing,
                    ExecutionState::Complete
                ]
            );
            let last_outcome = job.status().last().unwrap().outcome;
            match plan {
                Ok(_) => assert_eq!(last_outcome, ExecutionOutcome::Success),
                Err(()) => assert_eq!(last_outcome, ExecutionOutcome::Error),
            }
        });
    }

    /// The procedure completes after its last job, and its result is the
    /// last non-null job result in executed order (`false` for failed jobs,
    /// `true` when no job produced one).
    #[test]
    fn aggregate_result_is_last_non_null_in_executed_order(
        plans in prop::collection::vec(job_plan_strategy(), 1..6)
    ) {
        block_on(async move {
            let checkpoints = Arc::new(InMemoryCheckpointStore::new());
            let procedure = Procedure::new(None);
            let jobs: Vec<_> = plans
                .iter()
                .map(|plan| match plan {
                    Ok(Some(v)) => static_job(&procedure, &checkpoints, json!(v)),
                    Ok(None) => static_job(&procedure, &checkpoints, Value::Null),
                    Err(()) => boom_job(&procedure, &checkpoints, "planned failure"),
                })
                .collect();

            let mut persister = NoopPersister::default();
            let scheduler = Scheduler::new();
            let queue = JobQueue::new(None);
            for (index, job) in jobs.iter().enumerate() {
                assert!(!procedure.is_complete());
                job.execute(&mut persister, &scheduler, &queue).await;
                let expect_complete = index + 1 == jobs.len();
                assert_eq!(procedure.is_complete(), expect_complete);
            }

            let expected = plans
                .iter()
                .filter_map(|plan| match plan {
                    Ok(Some(v)) => Some(json!(v)),
                    Ok(None) => None,
                    Err(()) => Some(json!(false)),
                })
                .next_back()
                .unwrap_or(json!(true));
            assert_eq!(procedure.result(), expected);

            // Executed order equals insertion order on a single worker.
            let executed: Vec<Uuid> =
                procedure.executed_jobs().iter().map(|job| job.uuid()).collect();
            let inserted: Vec<Uuid> = jobs.iter().map(|job| job.uuid()).collect();
            assert_eq!(executed, inserted);
        });
    }

    /// Identity is uuid identity, for procedures and jobs alike.
    #[test]
    fn identity_follows_uuid(seed in any::<u128>()) {
        let uuid = Uuid::from_u128(seed);
        let a = Procedure::with_uuid(uuid, None);
        let b = Procedure::with_uuid(uuid, None);
        prop_assert_eq!(&*a, &*b);
        prop_assert_ne!(&*a, &*Procedure::new(None));

        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let job_a = fabricore::job::Job::new(
            &a,
            Arc::new(StaticResult(json!(1))),
            "test.static",
            "Identity.",
            fabricore::action::ActionArgs::default(),
            None,
            checkpoints.clone(),
        )
        .unwrap();
        let job_b = fabricore::job::Job::new(
            &b,
            Arc::new(StaticResult(json!(2))),
            "test.static",
            "Identity.",
            fabricore::action::ActionArgs::default(),
            Some(job_a.uuid()),
            checkpoints,
        )
        .unwrap();
        prop_assert_eq!(&*job_a, &*job_b);
    }
}
