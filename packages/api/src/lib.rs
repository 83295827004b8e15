//! Caller-facing side of the job system.
//!
//! This crate contains:
//! - Deployment configuration loading
//! - The per-identity rate limiter
//! - The submission gateway (submit, status, result, cancel)
//! - Administrative reset of an instance
//! - Startup of the whole system

mod admin;
mod config;
mod error;
mod gateway;
mod init;
mod rate_limit;

pub use admin::{Admin, ResetReport};
pub use config::{AppConfig, CONFIG_ENV, ConfigError, WorkerConfig};
pub use error::GatewayError;
pub use gateway::{JobStatusDocument, Submission, SubmissionGateway};
pub use init::{InitError, JobSystem};
pub use rate_limit::{
    CounterFuture, CounterStore, RateLimitConfig, RateLimiter, WindowLimiter, WindowStrategy,
};

// Re-export core types for convenience
pub use jobs_core::{Job, JobError, JobEvent, JobId, JobKind, JobStatus, QueueStats, ResultRef};
