//! The closed set of job types the worker knows how to run.

use serde::{Deserialize, Serialize};

/// Job kind for routing to a handler.
///
/// The `type` string on a job is opaque at intake; it is resolved to a kind
/// only when the engine dispatches it. Strings with no matching kind fail
/// the attempt like any handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Simulated email delivery
    SendEmail,
    /// Simulated data processing
    ProcessData,
    /// Always fails; exercises the retry ladder
    TestFailure,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::SendEmail, JobKind::ProcessData, JobKind::TestFailure];

    pub const fn as_str(self) -> &'static str {
        match self {
            JobKind::SendEmail => "send_email",
            JobKind::ProcessData => "process_data",
            JobKind::TestFailure => "test_failure",
        }
    }

    pub fn parse(job_type: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == job_type)
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
