//! End-to-end coverage of the run execution core against the scripted scheduler: dependency
//! gating, predicate skips, failure propagation, the parallelism guard, and cancellation.

use crate::api::test_utils::{Behavior, TestHarness};
use crate::api::{
    event_utils, namespaces::DEFAULT_NAMESPACE_ID, runs, task_executions, ApiError,
};
use gofer_sdk::config::{Pipeline, RequiredParentStatus, Task, TaskConfig};
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(15);

fn start_initiator() -> runs::Initiator {
    runs::Initiator::Human {
        user: "tester".into(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_dag_runs_in_dependency_order_and_emits_ordered_events() {
    let harness = TestHarness::new().await;

    harness
        .register_and_deploy(Pipeline::new("dag_pipeline", "DAG Pipeline").tasks(vec![
            Task::Custom(TaskConfig::new("task_a", "ubuntu:latest")),
            Task::Custom(
                TaskConfig::new("task_b", "ubuntu:latest")
                    .depends_on("task_a", RequiredParentStatus::Success),
            ),
            Task::Custom(
                TaskConfig::new("task_c", "ubuntu:latest")
                    .depends_on("task_a", RequiredParentStatus::Success),
            ),
        ]))
        .await;

    // Collect the run's event feed on a separate thread so that the bus's synchronous delivery
    // never has to wait on this test body.
    let subscription = harness
        .api
        .event_bus
        .subscribe(event_utils::KindDiscriminant::Any);
    let receiver = subscription.receiver.clone();

    let collector = std::thread::spawn(move || {
        let mut events = vec![];

        loop {
            match receiver.recv_timeout(std::time::Duration::from_secs(15)) {
                Ok(event) => {
                    let done = matches!(event.kind, event_utils::Kind::RunCompleted { .. });
                    events.push(event);

                    if done {
                        return events;
                    }
                }
                Err(_) => return events,
            }
        }
    });

    let run = harness
        .api
        .start_run(
            DEFAULT_NAMESPACE_ID,
            "dag_pipeline",
            start_initiator(),
            HashMap::new(),
        )
        .await
        .unwrap();

    let run = harness
        .wait_run_complete("dag_pipeline", run.run_id, WAIT)
        .await;

    assert_eq!(run.status, runs::Status::Successful);

    for task_id in ["task_a", "task_b", "task_c"] {
        let execution = harness
            .api
            .get_task_execution(DEFAULT_NAMESPACE_ID, "dag_pipeline", run.run_id, task_id)
            .await
            .unwrap();

        assert_eq!(execution.state, task_executions::State::Complete);
        assert_eq!(execution.status, task_executions::Status::Successful);
        assert_eq!(execution.exit_code, Some(0));
        assert!(execution.ended >= execution.started);
        assert!(execution.started >= execution.created);
    }

    let events = collector.join().unwrap();

    // Subscriber-observed ids are strictly increasing.
    let mut last_id = 0;
    for event in &events {
        assert!(event.id > last_id, "event ids regressed: {events:#?}");
        last_id = event.id;
    }

    let position = |predicate: &dyn Fn(&event_utils::Kind) -> bool| -> usize {
        events
            .iter()
            .position(|event| predicate(&event.kind))
            .unwrap_or_else(|| panic!("expected event missing: {events:#?}"))
    };

    let run_started = position(&|kind| matches!(kind, event_utils::Kind::RunStarted { .. }));
    let run_completed = position(&|kind| matches!(kind, event_utils::Kind::RunCompleted { .. }));

    let created_count = events
        .iter()
        .filter(|event| matches!(event.kind, event_utils::Kind::TaskRunCreated { .. }))
        .count();
    assert_eq!(created_count, 3);

    let a_started = position(&|kind| {
        matches!(kind, event_utils::Kind::TaskRunStarted { task_id, .. } if task_id == "task_a")
    });
    let a_completed = position(&|kind| {
        matches!(kind, event_utils::Kind::TaskRunCompleted { task_id, .. } if task_id == "task_a")
    });
    let b_started = position(&|kind| {
        matches!(kind, event_utils::Kind::TaskRunStarted { task_id, .. } if task_id == "task_b")
    });
    let c_started = position(&|kind| {
        matches!(kind, event_utils::Kind::TaskRunStarted { task_id, .. } if task_id == "task_c")
    });

    // The run brackets every task event; children only start after their parent completed.
    assert!(run_started < a_started);
    assert!(a_started < a_completed);
    assert!(a_completed < b_started);
    assert!(a_completed < c_started);
    assert!(run_completed == events.len() - 1);

    match &events[run_completed].kind {
        event_utils::Kind::RunCompleted { status, .. } => {
            assert_eq!(*status, runs::Status::Successful)
        }
        _ => unreachable!(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_predicate_skips_child_when_parent_succeeds() {
    let harness = TestHarness::new().await;

    harness
        .register_and_deploy(Pipeline::new("failure_handler", "Failure Handler").tasks(vec![
            Task::Custom(TaskConfig::new("task_a", "ubuntu:latest")),
            Task::Custom(
                TaskConfig::new("task_cleanup", "ubuntu:latest")
                    .depends_on("task_a", RequiredParentStatus::Failure),
            ),
        ]))
        .await;

    let run = harness
        .api
        .start_run(
            DEFAULT_NAMESPACE_ID,
            "failure_handler",
            start_initiator(),
            HashMap::new(),
        )
        .await
        .unwrap();

    let run = harness
        .wait_run_complete("failure_handler", run.run_id, WAIT)
        .await;

    // The skipped cleanup task doesn't taint the run.
    assert_eq!(run.status, runs::Status::Successful);

    let cleanup = harness
        .api
        .get_task_execution(
            DEFAULT_NAMESPACE_ID,
            "failure_handler",
            run.run_id,
            "task_cleanup",
        )
        .await
        .unwrap();

    assert_eq!(cleanup.state, task_executions::State::Complete);
    assert_eq!(cleanup.status, task_executions::Status::Skipped);
    assert_eq!(
        cleanup.status_reason.unwrap().reason,
        task_executions::StatusReasonType::FailedPrecondition
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn parent_failure_skips_success_dependent_and_fails_run() {
    let harness = TestHarness::new().await;

    harness.scheduler.set_behavior("task_a", Behavior::ExitWith(2));

    harness
        .register_and_deploy(Pipeline::new("failing_pipeline", "Failing Pipeline").tasks(vec![
            Task::Custom(TaskConfig::new("task_a", "ubuntu:latest")),
            Task::Custom(
                TaskConfig::new("task_b", "ubuntu:latest")
                    .depends_on("task_a", RequiredParentStatus::Success),
            ),
        ]))
        .await;

    let run = harness
        .api
        .start_run(
            DEFAULT_NAMESPACE_ID,
            "failing_pipeline",
            start_initiator(),
            HashMap::new(),
        )
        .await
        .unwrap();

    let run = harness
        .wait_run_complete("failing_pipeline", run.run_id, WAIT)
        .await;

    assert_eq!(run.status, runs::Status::Failed);

    let task_a = harness
        .api
        .get_task_execution(DEFAULT_NAMESPACE_ID, "failing_pipeline", run.run_id, "task_a")
        .await
        .unwrap();

    assert_eq!(task_a.status, task_executions::Status::Failed);
    assert_eq!(task_a.exit_code, Some(2));
    assert_eq!(
        task_a.status_reason.unwrap().reason,
        task_executions::StatusReasonType::AbnormalExit
    );

    let task_b = harness
        .api
        .get_task_execution(DEFAULT_NAMESPACE_ID, "failing_pipeline", run.run_id, "task_b")
        .await
        .unwrap();

    assert_eq!(task_b.status, task_executions::Status::Skipped);
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduler_refusal_fails_task_with_scheduler_error() {
    let harness = TestHarness::new().await;

    harness
        .scheduler
        .set_behavior("task_a", Behavior::FailToStart);

    harness
        .register_and_deploy(
            Pipeline::new("unschedulable", "Unschedulable").tasks(vec![Task::Custom(
                TaskConfig::new("task_a", "ubuntu:latest"),
            )]),
        )
        .await;

    let run = harness
        .api
        .start_run(
            DEFAULT_NAMESPACE_ID,
            "unschedulable",
            start_initiator(),
            HashMap::new(),
        )
        .await
        .unwrap();

    let run = harness
        .wait_run_complete("unschedulable", run.run_id, WAIT)
        .await;

    assert_eq!(run.status, runs::Status::Failed);

    let task_a = harness
        .api
        .get_task_execution(DEFAULT_NAMESPACE_ID, "unschedulable", run.run_id, "task_a")
        .await
        .unwrap();

    assert_eq!(task_a.status, task_executions::Status::Failed);
    assert_eq!(
        task_a.status_reason.unwrap().reason,
        task_executions::StatusReasonType::SchedulerError
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn parallelism_guard_rejects_and_recovers_after_cancel() {
    let harness = TestHarness::new().await;

    harness
        .scheduler
        .set_behavior("task_a", Behavior::RunUntilStopped);

    harness
        .register_and_deploy(
            Pipeline::new("limited", "Limited")
                .parallelism(1)
                .tasks(vec![Task::Custom(TaskConfig::new("task_a", "ubuntu:latest"))]),
        )
        .await;

    let first_run = harness
        .api
        .start_run(
            DEFAULT_NAMESPACE_ID,
            "limited",
            start_initiator(),
            HashMap::new(),
        )
        .await
        .unwrap();

    harness
        .wait_task_state(
            "limited",
            first_run.run_id,
            "task_a",
            task_executions::State::Running,
            WAIT,
        )
        .await;

    // The pipeline is at its limit; a second start is refused outright rather than queued.
    let result = harness
        .api
        .start_run(
            DEFAULT_NAMESPACE_ID,
            "limited",
            start_initiator(),
            HashMap::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(result, ApiError::FailedPrecondition(_)));

    harness
        .api
        .cancel_run(DEFAULT_NAMESPACE_ID, "limited", first_run.run_id, false)
        .await
        .unwrap();

    let first_run = harness
        .wait_run_complete("limited", first_run.run_id, WAIT)
        .await;
    assert_eq!(first_run.status, runs::Status::Cancelled);

    // With the slot free again the retry goes through.
    harness.scheduler.set_behavior("task_a", Behavior::ExitWith(0));

    let second_run = harness
        .api
        .start_run(
            DEFAULT_NAMESPACE_ID,
            "limited",
            start_initiator(),
            HashMap::new(),
        )
        .await
        .unwrap();

    assert_eq!(second_run.run_id, first_run.run_id + 1);

    let second_run = harness
        .wait_run_complete("limited", second_run.run_id, WAIT)
        .await;
    assert_eq!(second_run.status, runs::Status::Successful);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_stops_parallel_tasks_and_cancels_run() {
    let harness = TestHarness::new().await;

    harness
        .scheduler
        .set_behavior("task_a", Behavior::RunUntilStopped);
    harness
        .scheduler
        .set_behavior("task_b", Behavior::RunUntilStopped);

    harness
        .register_and_deploy(Pipeline::new("long_running", "Long Running").tasks(vec![
            Task::Custom(TaskConfig::new("task_a", "ubuntu:latest")),
            Task::Custom(TaskConfig::new("task_b", "ubuntu:latest")),
        ]))
        .await;

    let run = harness
        .api
        .start_run(
            DEFAULT_NAMESPACE_ID,
            "long_running",
            start_initiator(),
            HashMap::new(),
        )
        .await
        .unwrap();

    for task_id in ["task_a", "task_b"] {
        harness
            .wait_task_state(
                "long_running",
                run.run_id,
                task_id,
                task_executions::State::Running,
                WAIT,
            )
            .await;
    }

    harness
        .api
        .cancel_run(DEFAULT_NAMESPACE_ID, "long_running", run.run_id, false)
        .await
        .unwrap();

    let run = harness
        .wait_run_complete("long_running", run.run_id, WAIT)
        .await;

    assert_eq!(run.status, runs::Status::Cancelled);

    for task_id in ["task_a", "task_b"] {
        let execution = harness
            .api
            .get_task_execution(DEFAULT_NAMESPACE_ID, "long_running", run.run_id, task_id)
            .await
            .unwrap();

        assert_eq!(execution.status, task_executions::Status::Cancelled);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_skips_tasks_that_never_started() {
    let harness = TestHarness::new().await;

    harness
        .scheduler
        .set_behavior("task_a", Behavior::RunUntilStopped);

    harness
        .register_and_deploy(Pipeline::new("cancel_waiting", "Cancel Waiting").tasks(vec![
            Task::Custom(TaskConfig::new("task_a", "ubuntu:latest")),
            Task::Custom(
                TaskConfig::new("task_b", "ubuntu:latest")
                    .depends_on("task_a", RequiredParentStatus::Success),
            ),
        ]))
        .await;

    let run = harness
        .api
        .start_run(
            DEFAULT_NAMESPACE_ID,
            "cancel_waiting",
            start_initiator(),
            HashMap::new(),
        )
        .await
        .unwrap();

    harness
        .wait_task_state(
            "cancel_waiting",
            run.run_id,
            "task_a",
            task_executions::State::Running,
            WAIT,
        )
        .await;

    harness
        .api
        .cancel_run(DEFAULT_NAMESPACE_ID, "cancel_waiting", run.run_id, false)
        .await
        .unwrap();

    let run = harness
        .wait_run_complete("cancel_waiting", run.run_id, WAIT)
        .await;

    assert_eq!(run.status, runs::Status::Cancelled);

    // The waiting child was cancelled without ever hitting the scheduler.
    let task_b = harness
        .api
        .get_task_execution(DEFAULT_NAMESPACE_ID, "cancel_waiting", run.run_id, "task_b")
        .await
        .unwrap();

    assert_eq!(task_b.status, task_executions::Status::Cancelled);
    assert_eq!(task_b.started, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn run_ids_allocate_monotonically_per_pipeline() {
    let harness = TestHarness::new().await;

    harness
        .register_and_deploy(
            Pipeline::new("sequential", "Sequential").tasks(vec![Task::Custom(
                TaskConfig::new("task_a", "ubuntu:latest"),
            )]),
        )
        .await;

    for expected_id in 1..=3 {
        let run = harness
            .api
            .start_run(
                DEFAULT_NAMESPACE_ID,
                "sequential",
                start_initiator(),
                HashMap::new(),
            )
            .await
            .unwrap();

        assert_eq!(run.run_id, expected_id);

        harness
            .wait_run_complete("sequential", run.run_id, WAIT)
            .await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn disabled_pipeline_rejects_new_runs() {
    let harness = TestHarness::new().await;

    harness
        .register_and_deploy(
            Pipeline::new("toggled", "Toggled").tasks(vec![Task::Custom(TaskConfig::new(
                "task_a",
                "ubuntu:latest",
            ))]),
        )
        .await;

    harness
        .api
        .disable_pipeline(DEFAULT_NAMESPACE_ID, "toggled")
        .await
        .unwrap();

    let result = harness
        .api
        .start_run(
            DEFAULT_NAMESPACE_ID,
            "toggled",
            start_initiator(),
            HashMap::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(result, ApiError::FailedPrecondition(_)));

    harness
        .api
        .enable_pipeline(DEFAULT_NAMESPACE_ID, "toggled")
        .await
        .unwrap();

    harness
        .api
        .start_run(
            DEFAULT_NAMESPACE_ID,
            "toggled",
            start_initiator(),
            HashMap::new(),
        )
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn run_variables_reach_the_task_execution_record() {
    let harness = TestHarness::new().await;

    harness
        .register_and_deploy(
            Pipeline::new("varred", "Varred").tasks(vec![Task::Custom(
                TaskConfig::new("task_a", "ubuntu:latest").variable("FROM_CONFIG", "config_value"),
            )]),
        )
        .await;

    let run = harness
        .api
        .start_run(
            DEFAULT_NAMESPACE_ID,
            "varred",
            start_initiator(),
            HashMap::from([("FROM_RUN".to_string(), "run_value".to_string())]),
        )
        .await
        .unwrap();

    harness.wait_run_complete("varred", run.run_id, WAIT).await;

    let execution = harness
        .api
        .get_task_execution(DEFAULT_NAMESPACE_ID, "varred", run.run_id, "task_a")
        .await
        .unwrap();

    let keys: Vec<&str> = execution
        .variables
        .iter()
        .map(|variable| variable.key.as_str())
        .collect();

    assert!(keys.contains(&"FROM_CONFIG"));
    assert!(keys.contains(&"FROM_RUN"));
    assert!(keys.contains(&"GOFER_PIPELINE_ID"));
    assert!(keys.contains(&"GOFER_TASK_ID"));
}
