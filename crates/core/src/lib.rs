//! `jobforge-core`: job lifecycle building blocks.
//!
//! This crate contains the **pure domain** of the job queue (no I/O):
//! the job record and its state machine, the retry ladder, the closed set
//! of job kinds, and the observation sink the engine reports into.

pub mod error;
pub mod id;
pub mod job;
pub mod kind;
pub mod observe;
pub mod retry;
pub mod time;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{
    FailureOutcome, Job, JobStatus, NewJob, DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY,
    MAX_ATTEMPTS_CEILING,
};
pub use kind::JobKind;
pub use observe::{JobObserver, NoopObserver};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use time::parse_timestamp;
