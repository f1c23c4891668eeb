//! Prometheus metrics for the job queue.
//!
//! Each [`JobMetrics`] owns its own `Registry`, so tests and embedded
//! workers never collide on the process-global default registry.

use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use jobforge_core::JobObserver;

const JOB_TYPE: &[&str] = &["job_type"];

const DURATION_BUCKETS: &[f64] = &[0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("metrics registry error: {0}")]
    Registry(#[from] prometheus::Error),
    #[error("metrics output is not UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Job lifecycle counters, histograms and gauges.
#[derive(Clone)]
pub struct JobMetrics {
    registry: Registry,
    created: IntCounterVec,
    completed: IntCounterVec,
    failed: IntCounterVec,
    retried: IntCounterVec,
    duration: HistogramVec,
    queue_wait: HistogramVec,
    pending: IntGauge,
    processing: IntGauge,
    worker_up: IntGauge,
    loop_faults: IntCounter,
}

impl JobMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let created = counter_vec("jobs_created_total", "Total number of jobs created")?;
        let completed = counter_vec("jobs_completed_total", "Total number of jobs completed successfully")?;
        let failed = counter_vec("jobs_failed_total", "Total number of jobs failed permanently")?;
        let retried = counter_vec("jobs_retried_total", "Total number of job retry attempts")?;
        let duration = HistogramVec::new(
            HistogramOpts::new("job_duration_seconds", "Time spent processing jobs")
                .buckets(DURATION_BUCKETS.to_vec()),
            JOB_TYPE,
        )?;
        let queue_wait = HistogramVec::new(
            HistogramOpts::new("job_queue_wait_seconds", "Time jobs spend waiting in queue"),
            JOB_TYPE,
        )?;
        let pending = IntGauge::new("jobs_pending_count", "Current number of pending jobs")?;
        let processing = IntGauge::new("jobs_processing_count", "Current number of jobs being processed")?;
        let worker_up = IntGauge::new("worker_up", "Worker health status (1 = up, 0 = down)")?;
        let loop_faults = IntCounter::new(
            "worker_loop_errors_total",
            "Worker iterations aborted by an infrastructure error",
        )?;

        registry.register(Box::new(created.clone()))?;
        registry.register(Box::new(completed.clone()))?;
        registry.register(Box::new(failed.clone()))?;
        registry.register(Box::new(retried.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(queue_wait.clone()))?;
        registry.register(Box::new(pending.clone()))?;
        registry.register(Box::new(processing.clone()))?;
        registry.register(Box::new(worker_up.clone()))?;
        registry.register(Box::new(loop_faults.clone()))?;

        Ok(Self {
            registry,
            created,
            completed,
            failed,
            retried,
            duration,
            queue_wait,
            pending,
            processing,
            worker_up,
            loop_faults,
        })
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }

    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }
}

fn counter_vec(name: &str, help: &str) -> Result<IntCounterVec, prometheus::Error> {
    IntCounterVec::new(Opts::new(name, help), JOB_TYPE)
}

fn saturating_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

impl JobObserver for JobMetrics {
    fn job_created(&self, job_type: &str) {
        self.created.with_label_values(&[job_type]).inc();
    }

    fn job_claimed(&self, job_type: &str, queue_wait: Duration) {
        self.queue_wait
            .with_label_values(&[job_type])
            .observe(queue_wait.as_secs_f64());
    }

    fn job_completed(&self, job_type: &str, duration: Duration) {
        self.completed.with_label_values(&[job_type]).inc();
        self.duration
            .with_label_values(&[job_type])
            .observe(duration.as_secs_f64());
    }

    fn job_retried(&self, job_type: &str) {
        self.retried.with_label_values(&[job_type]).inc();
    }

    fn job_failed(&self, job_type: &str, duration: Duration) {
        self.failed.with_label_values(&[job_type]).inc();
        self.duration
            .with_label_values(&[job_type])
            .observe(duration.as_secs_f64());
    }

    fn queue_depth(&self, pending: u64, processing: u64) {
        self.pending.set(saturating_i64(pending));
        self.processing.set(saturating_i64(processing));
    }

    fn worker_up(&self, up: bool) {
        self.worker_up.set(i64::from(up));
    }

    fn loop_fault(&self) {
        self.loop_faults.inc();
    }
}
