//! Persistent job queue: storage, intake, selection, execution, recovery.
//!
//! ## Design
//!
//! - The store row is the only source of truth; every state change is a
//!   conditional write (`update(job, expected_status)`)
//! - Selection claims a job with PENDING → PROCESSING, so two workers can
//!   never run the same attempt
//! - Failed attempts walk the retry ladder until `max_attempts`
//! - Recovery requeues jobs a dead worker left in PROCESSING
//!
//! ## Components
//!
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `JobIntake`: idempotent submission and queries
//! - `Scheduler`: picks and claims the next eligible job
//! - `JobExecutor`: runs a claimed job and applies the retry policy
//! - `Recovery`: startup reconciliation of interrupted jobs

pub mod executor;
pub mod handlers;
pub mod intake;
pub mod postgres;
pub mod recovery;
pub mod scheduler;
pub mod store;

pub use executor::{ExecutorError, JobExecutor, RunOutcome};
pub use handlers::{BuiltinHandlers, HandlerError, HandlerSettings, JobHandler};
pub use intake::{CreateJob, IntakeError, JobIntake, RECENT_FAILURES_LIMIT};
pub use postgres::PostgresJobStore;
pub use recovery::Recovery;
pub use scheduler::Scheduler;
pub use store::{InMemoryJobStore, JobFilter, JobOrder, JobStats, JobStore, JobStoreError};
