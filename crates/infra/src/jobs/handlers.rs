//! Built-in job handlers.
//!
//! Handlers simulate external work: they sleep for a configured latency and
//! then succeed or fail. Dispatch is by the job's `type` string.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{Value as JsonValue, json};

use jobforge_core::JobKind;

/// Why a handler invocation did not produce a result.
///
/// All variants fail the attempt the same way; the distinction is for logs.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error("Unknown job type: {0}")]
    UnknownType(String),
    #[error("{0}")]
    Failed(String),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Executes the body of a job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job_type: &str, payload: &JsonValue) -> Result<JsonValue, HandlerError>;
}

/// Simulation knobs for the built-in handlers.
#[derive(Debug, Clone, Copy)]
pub struct HandlerSettings {
    /// Simulated work time per invocation.
    pub latency: Duration,
    /// Probability (0.0..=1.0) that a flaky handler fails.
    pub failure_rate: f64,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            latency: Duration::from_secs(2),
            failure_rate: 0.2,
        }
    }
}

impl HandlerSettings {
    /// No latency and no random failures. `test_failure` still always fails.
    pub fn instant() -> Self {
        Self {
            latency: Duration::ZERO,
            failure_rate: 0.0,
        }
    }
}

/// The `send_email` / `process_data` / `test_failure` handler set.
#[derive(Debug, Clone, Default)]
pub struct BuiltinHandlers {
    settings: HandlerSettings,
}

impl BuiltinHandlers {
    pub fn new(settings: HandlerSettings) -> Self {
        Self { settings }
    }

    async fn simulate(&self, latency: Duration) {
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn flaky(&self) -> bool {
        let p = self.settings.failure_rate.clamp(0.0, 1.0);
        p > 0.0 && rand::rng().random_bool(p)
    }
}

#[async_trait]
impl JobHandler for BuiltinHandlers {
    async fn handle(&self, job_type: &str, payload: &JsonValue) -> Result<JsonValue, HandlerError> {
        let kind =
            JobKind::parse(job_type).ok_or_else(|| HandlerError::UnknownType(job_type.to_string()))?;

        match kind {
            JobKind::SendEmail => {
                self.simulate(self.settings.latency).await;
                if self.flaky() {
                    return Err(HandlerError::failed("Email service temporarily unavailable"));
                }
                Ok(json!({
                    "sent_to": payload.get("to").cloned().unwrap_or(JsonValue::Null),
                    "status": "sent",
                }))
            }
            JobKind::ProcessData => {
                self.simulate(self.settings.latency).await;
                if self.flaky() {
                    return Err(HandlerError::failed(
                        "Process data service temporarily unavailable",
                    ));
                }
                Ok(json!({
                    "data": payload.get("data").cloned().unwrap_or(JsonValue::Null),
                    "status": "processed",
                }))
            }
            JobKind::TestFailure => {
                self.simulate(self.settings.latency / 2).await;
                Err(HandlerError::failed("This job is designed to fail"))
            }
        }
    }
}
