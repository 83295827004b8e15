//! Errors returned to callers of the gateway.

use actors::QueueError;
use db::DbError;
use jobs_core::{JobError, JobId, JobStatus, ValidationError};
use storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Unknown kind or parameters that fail the kind's schema.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("rate limit exceeded for {identity}")]
    RateLimitExceeded { identity: String },

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {job_id} has no result yet (status {status})")]
    NotReady { job_id: JobId, status: JobStatus },

    #[error("job {job_id} failed: {error}")]
    Failed { job_id: JobId, error: JobError },

    /// Store, queue or object storage failure. Callers may retry.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl GatewayError {
    /// Whether the same request can succeed later without changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimitExceeded { .. }
                | GatewayError::NotReady { .. }
                | GatewayError::Infrastructure(_)
        )
    }
}

impl From<DbError> for GatewayError {
    fn from(err: DbError) -> Self {
        GatewayError::Infrastructure(err.to_string())
    }
}

impl From<StorageError> for GatewayError {
    fn from(err: StorageError) -> Self {
        GatewayError::Infrastructure(err.to_string())
    }
}

impl From<QueueError> for GatewayError {
    fn from(err: QueueError) -> Self {
        GatewayError::Infrastructure(err.to_string())
    }
}
