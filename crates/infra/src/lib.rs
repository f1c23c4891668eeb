//! Infrastructure layer: job storage, the worker engine, configuration.

pub mod config;
pub mod jobs;
pub mod workers;
