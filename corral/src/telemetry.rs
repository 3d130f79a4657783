//! Tracing spans and record helpers for the job lifecycle.
//!
//! Every `record_*` helper logs through `tracing` and, when the `metrics`
//! feature is enabled, updates the matching Prometheus series.

use tracing::{info_span, Span};

use crate::job::{JobId, WorkerId};

/// Span around a job submission.
#[must_use]
pub fn job_submit_span(job_id: JobId, retries: u32) -> Span {
    info_span!("corral.submit", job_id = %job_id, retries)
}

/// Span around pairing a job with a worker.
#[must_use]
pub fn job_dispatch_span(job_id: JobId, worker_id: WorkerId) -> Span {
    info_span!("corral.dispatch", job_id = %job_id, worker_id = %worker_id)
}

/// Span around handling a worker's completion report.
#[must_use]
pub fn job_complete_span(job_id: JobId, worker_id: WorkerId) -> Span {
    info_span!("corral.complete", job_id = %job_id, worker_id = %worker_id)
}

/// Span around a deadline expiry.
#[must_use]
pub fn job_expire_span(job_id: JobId, retries: u32) -> Span {
    info_span!("corral.expire", job_id = %job_id, retries)
}

/// Span covering a worker agent's whole life.
#[must_use]
pub fn worker_span(worker_id: WorkerId) -> Span {
    info_span!("corral.worker", worker_id = %worker_id)
}

pub fn record_job_submitted(job_id: JobId, retries: u32, to_front: bool) {
    tracing::debug!(job_id = %job_id, retries, to_front, "job enqueued");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_submitted(retries > 0);
}

/// Record a terminal job outcome: `success`, `executor_error` or
/// `retries_exhausted`.
pub fn record_job_finished(job_id: JobId, status: &str, duration: std::time::Duration) {
    tracing::info!(
        job_id = %job_id,
        status,
        duration_ms = duration.as_millis() as u64,
        "job finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_finished(status, duration.as_secs_f64());
}

pub fn record_job_expired(job_id: JobId, worker_id: WorkerId, retries: u32) {
    tracing::warn!(job_id = %job_id, worker_id = %worker_id, retries, "job deadline expired");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_expired();
}

pub fn record_worker_exit(worker_id: WorkerId, detail: &str, requeued: usize) {
    tracing::info!(worker_id = %worker_id, detail, requeued, "worker exited");

    #[cfg(feature = "metrics")]
    crate::metrics::record_worker_exit(if requeued > 0 { "with_jobs" } else { "idle" });
}

pub fn set_queue_depth(pending: usize, in_flight: usize) {
    tracing::trace!(pending, in_flight, "queue depth");

    #[cfg(feature = "metrics")]
    crate::metrics::set_queue_depth(pending, in_flight);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span_name(make: impl FnOnce() -> Span) -> &'static str {
        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            make().metadata().expect("span enabled").name()
        })
    }

    #[test]
    fn test_job_submit_span() {
        assert_eq!(span_name(|| job_submit_span(JobId(1), 0)), "corral.submit");
    }

    #[test]
    fn test_job_dispatch_span() {
        assert_eq!(
            span_name(|| job_dispatch_span(JobId(1), WorkerId(2))),
            "corral.dispatch"
        );
    }

    #[test]
    fn test_job_complete_span() {
        assert_eq!(
            span_name(|| job_complete_span(JobId(1), WorkerId(2))),
            "corral.complete"
        );
    }

    #[test]
    fn test_job_expire_span() {
        assert_eq!(span_name(|| job_expire_span(JobId(1), 3)), "corral.expire");
    }

    #[test]
    fn test_worker_span() {
        assert_eq!(span_name(|| worker_span(WorkerId(7))), "corral.worker");
    }

    #[test]
    fn record_helpers_run_without_subscriber() {
        record_job_submitted(JobId(1), 0, false);
        record_job_finished(JobId(1), "success", std::time::Duration::from_millis(5));
        record_job_expired(JobId(1), WorkerId(2), 1);
        record_worker_exit(WorkerId(2), "exit status: 0", 0);
        set_queue_depth(0, 0);
    }
}
