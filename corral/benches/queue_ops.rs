//! Benchmarks for the coordinator's bookkeeping structures.
//!
//! These measure the pieces every dispatch touches:
//! - Pending queue tail and head insertion
//! - In-flight table insert/remove with a live deadline timer
//! - Bulk removal of a crashed worker's leases

#![allow(missing_docs)]

use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use corral::{Completion, DeadlineTimer, InFlightTable, Job, JobId, JobQueue, WorkerId};
use corral_testkit::TestJob;
use tokio::runtime::Runtime;

fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn job(id: u64) -> Job<TestJob> {
    Job::new(
        JobId(id),
        TestJob::echo("bench"),
        0,
        Completion::Callback(Box::new(|_| {})),
    )
}

/// Benchmark: FIFO enqueue followed by draining the queue.
fn bench_queue_fifo(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_fifo");

    for size in [10u64, 100, 1_000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::new("enqueue_dequeue", size), &size, |b, &size| {
            b.iter(|| {
                let mut queue = JobQueue::new();
                for id in 0..size {
                    queue.enqueue(job(id), false);
                }
                while let Some(job) = queue.dequeue() {
                    criterion::black_box(job.id);
                }
            });
        });
    }

    group.finish();
}

/// Benchmark: head insertion into an already deep queue, as retries do.
fn bench_queue_head_insertion(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_head_insertion");
    group.throughput(Throughput::Elements(1));

    group.bench_function("deep_queue", |b| {
        let mut queue = JobQueue::new();
        for id in 0..10_000 {
            queue.enqueue(job(id), false);
        }
        let mut next = 10_000;
        b.iter(|| {
            queue.enqueue(job(next), true);
            next += 1;
            criterion::black_box(queue.dequeue());
        });
    });

    group.finish();
}

/// Benchmark: leasing a job with an armed deadline, then completing it.
fn bench_in_flight_lease(c: &mut Criterion) {
    let rt = create_runtime();
    let _guard = rt.enter();

    let mut group = c.benchmark_group("in_flight_lease");
    group.throughput(Throughput::Elements(1));

    group.bench_function("insert_remove", |b| {
        let mut table = InFlightTable::new();
        let mut next = 0;
        b.iter(|| {
            let id = JobId(next);
            next += 1;
            let timer = DeadlineTimer::arm(Duration::from_secs(60), || {});
            table.insert(job(id.0), WorkerId(0), timer);
            let lease = table.remove(id).expect("lease present");
            criterion::black_box(lease.release());
        });
    });

    group.finish();
}

/// Benchmark: pulling every lease held by one worker out of a busy table.
fn bench_take_assigned(c: &mut Criterion) {
    let rt = create_runtime();
    let _guard = rt.enter();

    let mut group = c.benchmark_group("take_assigned_to");

    for workers in [4u64, 16, 64] {
        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, &workers| {
            b.iter_batched(
                || {
                    let mut table = InFlightTable::new();
                    for id in 0..workers * 4 {
                        let timer = DeadlineTimer::arm(Duration::from_secs(60), || {});
                        table.insert(job(id), WorkerId(id % workers), timer);
                    }
                    table
                },
                |mut table| criterion::black_box(table.take_assigned_to(WorkerId(0))),
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_queue_fifo,
    bench_queue_head_insertion,
    bench_in_flight_lease,
    bench_take_assigned
);
criterion_main!(benches);
