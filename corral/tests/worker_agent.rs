//! Worker agent behaviour against a hand-held coordinator endpoint.

use std::time::{Duration, Instant};

use corral::ipc::{CoordinatorMessage, WorkerMessage};
use corral::{CoordinatorEndpoint, JobId, WorkerConfig, WorkerEndpoint, WorkerExit, WorkerId};
use corral_testkit::{eventually, TestAgent, TestExecutorFactory, TestJob};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn start(harness: &TestAgent) -> (JoinHandle<anyhow::Result<WorkerExit>>, CoordinatorEndpoint<TestJob>) {
    let (endpoint, coordinator) = WorkerEndpoint::pair(WorkerId(7));
    let run = tokio::spawn(harness.agent.clone().run(endpoint));
    (run, coordinator)
}

async fn recv(end: &mut CoordinatorEndpoint<TestJob>) -> Option<WorkerMessage<String>> {
    timeout(WAIT, end.from_worker.recv())
        .await
        .expect("timed out waiting for the worker")
}

async fn expect_ready(end: &mut CoordinatorEndpoint<TestJob>) {
    assert_eq!(
        recv(end).await,
        Some(WorkerMessage::Ready {
            worker_id: WorkerId(7)
        })
    );
}

fn assign(end: &CoordinatorEndpoint<TestJob>, job: u64, payload: TestJob) {
    end.to_worker
        .send(CoordinatorMessage::Assign {
            job_id: JobId(job),
            payload,
        })
        .unwrap();
}

async fn expect_complete(
    end: &mut CoordinatorEndpoint<TestJob>,
) -> (JobId, Option<String>, Option<String>, bool) {
    match recv(end).await {
        Some(WorkerMessage::Complete {
            job_id,
            error,
            result,
            is_final,
            ..
        }) => (job_id, error, result, is_final),
        other => panic!("expected a completion, got {other:?}"),
    }
}

#[tokio::test]
async fn test_recycles_after_job_threshold_with_final_flag() {
    let harness = TestAgent::new(WorkerConfig::default().with_recycle_after_jobs(1));
    let (run, mut end) = start(&harness);
    expect_ready(&mut end).await;

    assign(&end, 1, TestJob::echo("x"));
    let (job_id, error, result, is_final) = expect_complete(&mut end).await;
    assert_eq!(job_id, JobId(1));
    assert_eq!(error, None);
    assert_eq!(result.as_deref(), Some("x"));
    assert!(is_final);

    end.to_worker.send(CoordinatorMessage::Ack).unwrap();
    let exit = timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(exit, WorkerExit::Recycled);

    // no further ready after the final job
    assert_eq!(recv(&mut end).await, None);
    let counts = harness.counts();
    assert_eq!(counts.units_created, 1);
    assert_eq!(counts.units_released, 1);
    assert_eq!(counts.exits, 1);
}

#[tokio::test]
async fn test_missing_final_ack_still_recycles() {
    let harness = TestAgent::new(
        WorkerConfig::default()
            .with_recycle_after_jobs(1)
            .with_ack_timeout(30),
    );
    let (run, mut end) = start(&harness);
    expect_ready(&mut end).await;

    assign(&end, 1, TestJob::echo("x"));
    let (_, _, _, is_final) = expect_complete(&mut end).await;
    assert!(is_final);

    let exit = timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(exit, WorkerExit::Recycled);
}

#[tokio::test]
async fn test_jobs_before_threshold_are_not_final() {
    let harness = TestAgent::new(WorkerConfig::default().with_recycle_after_jobs(3));
    let (run, mut end) = start(&harness);
    expect_ready(&mut end).await;

    for job in 1..=3u64 {
        assign(&end, job, TestJob::echo(format!("v{job}")));
        let (job_id, _, result, is_final) = expect_complete(&mut end).await;
        assert_eq!(job_id, JobId(job));
        assert_eq!(result, Some(format!("v{job}")));
        assert_eq!(is_final, job == 3);
        end.to_worker.send(CoordinatorMessage::Ack).unwrap();
    }

    assert_eq!(
        timeout(WAIT, run).await.unwrap().unwrap().unwrap(),
        WorkerExit::Recycled
    );
}

#[tokio::test]
async fn test_handler_error_is_reported_not_raised() {
    let harness = TestAgent::new(WorkerConfig::default());
    let (run, mut end) = start(&harness);
    expect_ready(&mut end).await;

    assign(&end, 4, TestJob::fail("disk full"));
    let (job_id, error, result, is_final) = expect_complete(&mut end).await;
    assert_eq!(job_id, JobId(4));
    assert_eq!(error.as_deref(), Some("disk full"));
    assert_eq!(result, None);
    assert!(!is_final);

    drop(end);
    assert_eq!(
        timeout(WAIT, run).await.unwrap().unwrap().unwrap(),
        WorkerExit::Disconnected
    );
}

#[tokio::test]
async fn test_unknown_executor_fails_the_job() {
    let harness = TestAgent::new(WorkerConfig::default());
    let (_run, mut end) = start(&harness);
    expect_ready(&mut end).await;

    assign(&end, 1, TestJob::route("gpu", "x"));
    let (_, error, result, _) = expect_complete(&mut end).await;
    assert!(error.unwrap().contains("unknown executor `gpu`"));
    assert_eq!(result, None);
    assert!(harness.handler.handled().is_empty());
}

#[tokio::test]
async fn test_unit_creation_failure_fails_the_job() {
    let harness = TestAgent::with_factories(
        WorkerConfig::default(),
        vec![TestExecutorFactory::default().failing_units()],
    );
    let (_run, mut end) = start(&harness);
    expect_ready(&mut end).await;

    assign(&end, 1, TestJob::echo("x"));
    let (_, error, _, _) = expect_complete(&mut end).await;
    assert!(error.unwrap().contains("could not create a work unit"));
    assert!(harness.handler.handled().is_empty());
}

#[tokio::test]
async fn test_jobs_route_to_named_executors() {
    let harness = TestAgent::with_factories(
        WorkerConfig::default(),
        vec![
            TestExecutorFactory::new("alpha"),
            TestExecutorFactory::new("beta"),
        ],
    );
    let (_run, mut end) = start(&harness);
    expect_ready(&mut end).await;

    assign(&end, 1, TestJob::route("beta", "a"));
    let (_, _, result, _) = expect_complete(&mut end).await;
    assert_eq!(result.as_deref(), Some("beta:a"));

    assign(&end, 2, TestJob::route("alpha", "b"));
    let (_, _, result, _) = expect_complete(&mut end).await;
    assert_eq!(result.as_deref(), Some("alpha:b"));

    assert_eq!(harness.factories[0].counts().units_created, 1);
    assert_eq!(harness.factories[1].counts().units_created, 1);
}

#[tokio::test]
async fn test_announces_one_ready_per_slot_and_runs_jobs_concurrently() {
    let harness = TestAgent::new(WorkerConfig::default().with_concurrency(2));
    let (_run, mut end) = start(&harness);
    expect_ready(&mut end).await;
    expect_ready(&mut end).await;

    assign(&end, 1, TestJob::sleep(40, "a"));
    assign(&end, 2, TestJob::sleep(40, "b"));
    let mut finished = vec![
        expect_complete(&mut end).await.0,
        expect_complete(&mut end).await.0,
    ];
    finished.sort();
    assert_eq!(finished, vec![JobId(1), JobId(2)]);
    assert_eq!(harness.handler.peak(), 2);
}

#[tokio::test]
async fn test_force_exit_abandons_running_jobs() {
    let harness = TestAgent::new(WorkerConfig::default());
    let (run, mut end) = start(&harness);
    expect_ready(&mut end).await;

    assign(&end, 1, TestJob::Hang);
    let handler = harness.handler.clone();
    assert!(eventually(WAIT, || handler.running() == 1).await);

    end.to_worker.send(CoordinatorMessage::ForceExit).unwrap();
    assert_eq!(
        timeout(WAIT, run).await.unwrap().unwrap().unwrap(),
        WorkerExit::ForcedExit
    );
    assert!(eventually(WAIT, || handler.running() == 0).await);
    assert_eq!(harness.counts().exits, 1);
}

#[tokio::test]
async fn test_lifetime_threshold_recycles_idle_worker() {
    let harness = TestAgent::new(WorkerConfig::default().with_recycle_after(Some(30)));
    let (run, mut end) = start(&harness);
    expect_ready(&mut end).await;

    assert_eq!(
        timeout(WAIT, run).await.unwrap().unwrap().unwrap(),
        WorkerExit::LifetimeElapsed
    );
    assert_eq!(harness.counts().exits, 1);
}

#[tokio::test]
async fn test_slow_executor_teardown_is_bounded() {
    let harness = TestAgent::with_factories(
        WorkerConfig::default()
            .with_recycle_after(Some(10))
            .with_teardown_timeout(50),
        vec![TestExecutorFactory::default().with_exit_delay(Duration::from_secs(30))],
    );
    let (run, _end) = start(&harness);

    let started = Instant::now();
    assert_eq!(
        timeout(WAIT, run).await.unwrap().unwrap().unwrap(),
        WorkerExit::LifetimeElapsed
    );
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(harness.counts().exits, 0);
}

#[tokio::test]
async fn test_startup_failure_sends_no_ready() {
    let factory = TestExecutorFactory::new("alpha");
    let harness = TestAgent::with_factories(
        WorkerConfig::default(),
        vec![factory.clone(), TestExecutorFactory::new("broken").failing_create()],
    );
    let (run, mut end) = start(&harness);

    let err = timeout(WAIT, run).await.unwrap().unwrap().unwrap_err();
    assert!(format!("{err:#}").contains("refused to start"));
    assert_eq!(recv(&mut end).await, None);
    // resources created before the failure are torn down
    assert_eq!(factory.counts().resources_created, factory.counts().exits);
}
