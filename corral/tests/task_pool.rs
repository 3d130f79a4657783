//! End-to-end runs with workers as in-process tokio tasks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use corral::{
    Coordinator, CoordinatorBuilder, CoordinatorConfig, CorralConfig, JobError, JobEventPayload,
    JobResult, RetryLimit, TaskSpawner, WorkerConfig,
};
use corral_testkit::{eventually, wait_for_snapshot, TestAgent, TestHandler, TestJob};
use parking_lot::Mutex;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn pool(config: CoordinatorConfig, worker: WorkerConfig) -> (Coordinator<TestJob>, TestHandler) {
    let harness = TestAgent::new(worker);
    let handler = harness.handler.clone();
    let coordinator = Coordinator::launch(config, TaskSpawner::new(harness.agent))
        .await
        .expect("coordinator launches");
    (coordinator, handler)
}

#[tokio::test]
async fn test_three_jobs_on_two_workers() {
    let (coordinator, handler) = pool(
        CoordinatorConfig::default()
            .with_worker_count(2)
            .with_job_timeout(1_000),
        WorkerConfig::default(),
    )
    .await;

    let started = Instant::now();
    let tickets: Vec<_> = ["A", "B", "C"]
        .into_iter()
        .map(|value| coordinator.submit(TestJob::sleep(10, value), false))
        .collect();

    let mut results = Vec::new();
    for ticket in tickets {
        results.push(timeout(WAIT, ticket).await.unwrap());
    }
    assert_eq!(
        results,
        vec![Ok("A".to_string()), Ok("B".to_string()), Ok("C".to_string())]
    );
    assert!(handler.peak() <= 2);
    assert!(started.elapsed() < Duration::from_millis(500));

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_hanging_job_exhausts_after_one_retry() {
    let (coordinator, _handler) = pool(
        CoordinatorConfig::default()
            .with_worker_count(2)
            .with_job_timeout(50)
            .with_max_retries(RetryLimit::Limited(1)),
        WorkerConfig::default(),
    )
    .await;

    let outcomes: Arc<Mutex<Vec<JobResult<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&outcomes);
    let started = Instant::now();
    coordinator.submit_with(TestJob::Hang, false, move |result| sink.lock().push(result));

    assert!(eventually(WAIT, || !outcomes.lock().is_empty()).await);
    assert!(started.elapsed() >= Duration::from_millis(100));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        *outcomes.lock(),
        vec![Err(JobError::RetriesExhausted { retries: 1 })]
    );

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_forced_worker_is_replaced() {
    let (coordinator, _handler) = pool(
        CoordinatorConfig::default()
            .with_worker_count(1)
            .with_job_timeout(40)
            .with_max_retries(RetryLimit::Limited(0)),
        WorkerConfig::default(),
    )
    .await;
    let mut events = coordinator.subscribe();

    let hung = coordinator.submit(TestJob::Hang, false);
    assert_eq!(
        timeout(WAIT, hung).await.unwrap(),
        Err(JobError::RetriesExhausted { retries: 0 })
    );

    let exited = timeout(WAIT, async {
        loop {
            if let JobEventPayload::WorkerExited {
                detail, respawned, ..
            } = events.recv().await.unwrap().payload
            {
                return (detail, respawned);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(exited, ("forced_exit".to_string(), true));

    let after = coordinator.submit(TestJob::echo("fresh"), false);
    assert_eq!(timeout(WAIT, after).await.unwrap(), Ok("fresh".to_string()));

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_executor_errors_are_terminal() {
    let (coordinator, handler) = pool(
        CoordinatorConfig::default().with_worker_count(1),
        WorkerConfig::default(),
    )
    .await;

    let failed = coordinator.submit(TestJob::fail("boom"), false);
    assert_eq!(
        timeout(WAIT, failed).await.unwrap(),
        Err(JobError::Executor("boom".into()))
    );
    let unknown = coordinator.submit(TestJob::route("missing", "x"), false);
    match timeout(WAIT, unknown).await.unwrap() {
        Err(JobError::Executor(message)) => assert!(message.contains("missing")),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(handler.handled(), vec![TestJob::fail("boom")]);

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_recycling_workers_keep_serving() {
    let (coordinator, _handler) = pool(
        CoordinatorConfig::default().with_worker_count(1),
        WorkerConfig::default().with_recycle_after_jobs(1),
    )
    .await;
    let mut events = coordinator.subscribe();

    for round in 0..4 {
        let value = format!("round-{round}");
        let ticket = coordinator.submit(TestJob::echo(value.clone()), false);
        assert_eq!(timeout(WAIT, ticket).await.unwrap(), Ok(value));
    }

    let mut recycled = 0;
    while let Ok(event) = events.try_recv() {
        if let JobEventPayload::WorkerExited {
            detail, respawned, ..
        } = event.payload
        {
            assert_eq!(detail, "recycled");
            assert!(respawned);
            recycled += 1;
        }
    }
    assert!(recycled >= 3, "saw {recycled} recycles");

    let snapshot = wait_for_snapshot(&coordinator, WAIT, |s| s.idle_count() == 1)
        .await
        .expect("replacement ready");
    assert_eq!(snapshot.live_workers(), 1);

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_multi_slot_workers_share_the_load() {
    let (coordinator, handler) = pool(
        CoordinatorConfig::default().with_worker_count(1),
        WorkerConfig::default().with_concurrency(3),
    )
    .await;

    let tickets: Vec<_> = (0..3)
        .map(|i| coordinator.submit(TestJob::sleep(50, format!("s{i}")), false))
        .collect();
    for ticket in tickets {
        timeout(WAIT, ticket).await.unwrap().unwrap();
    }
    assert_eq!(handler.peak(), 3);

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stop_then_start_serves_queued_jobs() {
    let (coordinator, _handler) = pool(
        CoordinatorConfig::default().with_worker_count(2),
        WorkerConfig::default(),
    )
    .await;

    coordinator.stop().await.unwrap();
    wait_for_snapshot(&coordinator, WAIT, |s| s.workers.is_empty())
        .await
        .expect("workers gone");

    let mut ticket = coordinator.submit(TestJob::echo("later"), false);
    assert!(timeout(Duration::from_millis(100), &mut ticket).await.is_err());

    assert!(coordinator.start(2).await.unwrap());
    assert!(!coordinator.start(2).await.unwrap());
    assert_eq!(timeout(WAIT, ticket).await.unwrap(), Ok("later".to_string()));

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_killed_worker_requeues_its_job() {
    let (coordinator, _handler) = pool(
        CoordinatorConfig::default().with_worker_count(1),
        WorkerConfig::default(),
    )
    .await;
    let mut events = coordinator.subscribe();

    let mut ticket = coordinator.submit(TestJob::sleep(60_000, "slow"), false);
    wait_for_snapshot(&coordinator, WAIT, |s| s.in_flight_count() == 1)
        .await
        .expect("assigned");

    coordinator.stop().await.unwrap();
    let requeued = timeout(WAIT, async {
        loop {
            if let JobEventPayload::Requeued { retries, .. } = events.recv().await.unwrap().payload {
                return retries;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(requeued, 0);
    assert!(timeout(Duration::from_millis(50), &mut ticket).await.is_err());

    let snapshot = coordinator.snapshot().await.unwrap();
    assert_eq!(snapshot.pending_count(), 1);
    assert!(!snapshot.running);

    coordinator.shutdown().await.unwrap();
    assert_eq!(ticket.await, Err(JobError::Abandoned));
}

#[tokio::test]
async fn test_builder_from_loaded_config() {
    let config = CorralConfig::from_json_str(
        r#"{ "workerCount": 2, "jobTimeoutMs": 2000, "maxRetries": 3 }"#,
    )
    .unwrap();
    let harness = TestAgent::new(config.worker());
    let coordinator = CoordinatorBuilder::from_config(&config)
        .with_spawner(TaskSpawner::new(harness.agent))
        .build()
        .unwrap();

    assert_eq!(coordinator.config().worker_count, 2);
    assert!(coordinator.start(2).await.unwrap());
    let ticket = coordinator.submit(TestJob::echo("configured"), false);
    assert_eq!(
        timeout(WAIT, ticket).await.unwrap(),
        Ok("configured".to_string())
    );

    coordinator.shutdown().await.unwrap();
}
