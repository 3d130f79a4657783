//! Prometheus series for the coordinator, behind the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `corral_jobs_submitted_total{kind}` - submissions, `kind` is `new` or `retry`
//! - `corral_jobs_finished_total{status}` - terminal outcomes
//! - `corral_jobs_expired_total` - deadline expiries, retried or not
//! - `corral_worker_exits_total{reason}` - worker exits, `idle` or `with_jobs`
//!
//! ## Gauges
//! - `corral_queue_depth` - pending jobs
//! - `corral_jobs_in_flight` - assigned jobs
//!
//! ## Histograms
//! - `corral_job_duration_seconds{status}` - assignment to terminal outcome
#![cfg(feature = "metrics")]

use prometheus::{
    exponential_buckets, Counter, CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry,
};
use std::sync::LazyLock;

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static JOBS_SUBMITTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("corral_jobs_submitted_total", "Total number of jobs submitted");
    CounterVec::new(opts, &["kind"]).expect("corral_jobs_submitted_total metric creation failed")
});

pub static JOBS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "corral_jobs_finished_total",
        "Total number of jobs that reached a terminal outcome",
    );
    CounterVec::new(opts, &["status"]).expect("corral_jobs_finished_total metric creation failed")
});

pub static JOBS_EXPIRED_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new("corral_jobs_expired_total", "Total number of job deadline expiries")
        .expect("corral_jobs_expired_total metric creation failed")
});

pub static WORKER_EXITS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("corral_worker_exits_total", "Total number of worker exits");
    CounterVec::new(opts, &["reason"]).expect("corral_worker_exits_total metric creation failed")
});

pub static QUEUE_DEPTH: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new("corral_queue_depth", "Current number of pending jobs")
        .expect("corral_queue_depth metric creation failed")
});

pub static JOBS_IN_FLIGHT: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new("corral_jobs_in_flight", "Current number of assigned jobs")
        .expect("corral_jobs_in_flight metric creation failed")
});

pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = HistogramOpts::new(
        "corral_job_duration_seconds",
        "Time from assignment to terminal outcome in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["status"]).expect("corral_job_duration_seconds metric creation failed")
});

/// Register every series with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_SUBMITTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_FINISHED_TOTAL.clone()),
        Box::new(JOBS_EXPIRED_TOTAL.clone()),
        Box::new(WORKER_EXITS_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(JOBS_IN_FLIGHT.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_submitted(is_retry: bool) {
    let kind = if is_retry { "retry" } else { "new" };
    JOBS_SUBMITTED_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_job_finished(status: &str, duration_secs: f64) {
    JOBS_FINISHED_TOTAL.with_label_values(&[status]).inc();
    JOB_DURATION_SECONDS
        .with_label_values(&[status])
        .observe(duration_secs);
}

pub fn record_job_expired() {
    JOBS_EXPIRED_TOTAL.inc();
}

pub fn record_worker_exit(reason: &str) {
    WORKER_EXITS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn set_queue_depth(pending: usize, in_flight: usize) {
    QUEUE_DEPTH.set(pending as f64);
    JOBS_IN_FLIGHT.set(in_flight as f64);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
