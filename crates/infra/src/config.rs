use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use jobforge_core::{BackoffStrategy, RetryPolicy};

use crate::jobs::{HandlerSettings, PostgresJobStore};
use crate::workers::JobWorkerConfig;

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres URL. `None` means in-memory (API dev mode only).
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub api_bind_addr: SocketAddr,
    pub worker_metrics_addr: SocketAddr,
    pub poll_interval: Duration,
    pub startup_max_retries: u32,
    pub startup_retry_delay: Duration,
    pub retry_backoff: BackoffStrategy,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub handler_latency: Duration,
    pub handler_failure_rate: f64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let handler_failure_rate: f64 = parse(&get("HANDLER_FAILURE_RATE", "0.2"), "HANDLER_FAILURE_RATE")?;
        if !(0.0..=1.0).contains(&handler_failure_rate) {
            anyhow::bail!("HANDLER_FAILURE_RATE must be between 0 and 1 (got {handler_failure_rate})");
        }

        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            database_max_connections: parse(
                &get("DATABASE_MAX_CONNECTIONS", "5"),
                "DATABASE_MAX_CONNECTIONS",
            )?,
            api_bind_addr: parse(&get("API_BIND_ADDR", "0.0.0.0:8000"), "API_BIND_ADDR")?,
            worker_metrics_addr: parse(
                &get("WORKER_METRICS_ADDR", "0.0.0.0:8001"),
                "WORKER_METRICS_ADDR",
            )?,
            poll_interval: millis(&get("WORKER_POLL_INTERVAL_MS", "1000"), "WORKER_POLL_INTERVAL_MS")?,
            startup_max_retries: parse(
                &get("WORKER_STARTUP_MAX_RETRIES", "10"),
                "WORKER_STARTUP_MAX_RETRIES",
            )?,
            startup_retry_delay: millis(
                &get("WORKER_STARTUP_RETRY_DELAY_MS", "2000"),
                "WORKER_STARTUP_RETRY_DELAY_MS",
            )?,
            retry_backoff: parse(&get("JOB_RETRY_BACKOFF", "immediate"), "JOB_RETRY_BACKOFF")?,
            retry_base_delay: millis(&get("JOB_RETRY_BASE_DELAY_MS", "1000"), "JOB_RETRY_BASE_DELAY_MS")?,
            retry_max_delay: millis(&get("JOB_RETRY_MAX_DELAY_MS", "60000"), "JOB_RETRY_MAX_DELAY_MS")?,
            handler_latency: millis(&get("HANDLER_LATENCY_MS", "2000"), "HANDLER_LATENCY_MS")?,
            handler_failure_rate,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
            strategy: self.retry_backoff,
        }
    }

    pub fn handler_settings(&self) -> HandlerSettings {
        HandlerSettings {
            latency: self.handler_latency,
            failure_rate: self.handler_failure_rate,
        }
    }

    pub fn worker_config(&self, name: &str) -> JobWorkerConfig {
        JobWorkerConfig::default()
            .with_name(name)
            .with_poll_interval(self.poll_interval)
            .with_startup_retries(self.startup_max_retries, self.startup_retry_delay)
            .with_retry_policy(self.retry_policy())
    }

    /// Postgres store for `DATABASE_URL`, connecting lazily.
    pub fn postgres_store(&self) -> Result<Option<PostgresJobStore>> {
        self.database_url
            .as_deref()
            .map(|url| {
                PostgresJobStore::connect_lazy(url, self.database_max_connections)
                    .context("invalid DATABASE_URL")
            })
            .transpose()
    }
}

fn parse<T>(raw: &str, key: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("{key} has an invalid value: {raw:?}"))
}

fn millis(raw: &str, key: &str) -> Result<Duration> {
    parse::<u64>(raw, key).map(Duration::from_millis)
}
