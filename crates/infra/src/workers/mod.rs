//! Background workers.

pub mod job_worker;

pub use job_worker::{JobWorker, JobWorkerConfig, JobWorkerHandle, WorkerError};
