//! Observation sink for job lifecycle events.
//!
//! The engine calls into this fire-and-forget: implementations must not
//! block and cannot fail the caller.

use std::sync::Arc;
use std::time::Duration;

/// Receives lifecycle observations (metrics, audit, ...).
///
/// Every method defaults to a no-op so sinks only implement what they use.
pub trait JobObserver: Send + Sync {
    fn job_created(&self, _job_type: &str) {}

    /// A job was claimed after waiting `queue_wait` since submission.
    fn job_claimed(&self, _job_type: &str, _queue_wait: Duration) {}

    fn job_completed(&self, _job_type: &str, _duration: Duration) {}

    fn job_retried(&self, _job_type: &str) {}

    /// Terminal failure.
    fn job_failed(&self, _job_type: &str, _duration: Duration) {}

    fn queue_depth(&self, _pending: u64, _processing: u64) {}

    fn worker_up(&self, _up: bool) {}

    /// An infrastructure fault aborted one worker iteration.
    fn loop_fault(&self) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl JobObserver for NoopObserver {}

impl<T: JobObserver + ?Sized> JobObserver for Arc<T> {
    fn job_created(&self, job_type: &str) {
        (**self).job_created(job_type)
    }

    fn job_claimed(&self, job_type: &str, queue_wait: Duration) {
        (**self).job_claimed(job_type, queue_wait)
    }

    fn job_completed(&self, job_type: &str, duration: Duration) {
        (**self).job_completed(job_type, duration)
    }

    fn job_retried(&self, job_type: &str) {
        (**self).job_retried(job_type)
    }

    fn job_failed(&self, job_type: &str, duration: Duration) {
        (**self).job_failed(job_type, duration)
    }

    fn queue_depth(&self, pending: u64, processing: u64) {
        (**self).queue_depth(pending, processing)
    }

    fn worker_up(&self, up: bool) {
        (**self).worker_up(up)
    }

    fn loop_fault(&self) {
        (**self).loop_fault()
    }
}
