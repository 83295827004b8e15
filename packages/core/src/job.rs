//! Job domain types for analysis runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::{Fingerprint, QueueName};

/// Default per-job execution timeout: 24 hours.
pub const DEFAULT_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a registered analysis, e.g. `diamond` or `must`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKind(String);

impl JobKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobKind {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Current status of a job in its lifecycle.
///
/// Transitions only move forward: `queued -> running -> completed | failed`.
/// A queued job may also fail directly when it is cancelled, expired, or
/// could not be enqueued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting to be claimed by a worker.
    #[default]
    Queued,
    /// Job is currently being executed by a worker.
    Running,
    /// Job finished and its output is stored.
    Completed,
    /// Job failed with a structured error.
    Failed,
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Check if the job still occupies its fingerprint.
    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether `next` is a legal successor of this status.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    /// Get a simple status string for display.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Location of a completed job's output in result storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultRef(String);

impl ResultRef {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for ResultRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Category of a job failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The external computation exited unsuccessfully.
    Execution,
    /// The external computation exceeded its timeout and was terminated.
    Timeout,
    /// The computation succeeded but its output could not be read.
    MalformedOutput,
    /// Cancellation was requested before the result was recorded.
    Cancelled,
    /// The worker holding the job stopped reporting.
    WorkerLost,
    /// The job was orphaned by an administrative reset.
    Expired,
    /// Queue or storage infrastructure failed while handling the job.
    Infrastructure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Execution => "execution",
            ErrorKind::Timeout => "timeout",
            ErrorKind::MalformedOutput => "malformed_output",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::WorkerLost => "worker_lost",
            ErrorKind::Expired => "expired",
            ErrorKind::Infrastructure => "infrastructure",
        }
    }
}

/// Structured error recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code: None,
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn timeout(timeout_secs: u64) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("execution exceeded {timeout_secs}s and was terminated"),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled on request")
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)?;
        if let Some(code) = self.exit_code {
            write!(f, " (exit code {code})")?;
        }
        Ok(())
    }
}

/// Rejected status change.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("job {job_id} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// A single submitted analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job. Serialized as `job_id`, leaving `id`
    /// to the store's record key.
    #[serde(rename = "job_id")]
    pub id: JobId,
    /// Registered analysis this job runs.
    pub kind: JobKind,
    /// Queue the job is dispatched on.
    pub queue: QueueName,
    /// Normalized parameters, including filled-in defaults.
    pub params: serde_json::Value,
    /// Hash of kind and canonical parameters.
    pub fingerprint: Fingerprint,
    /// Caller identity the submission was admitted for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    pub status: JobStatus,
    /// Timeout in seconds for the external computation.
    pub timeout_secs: u64,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Worker that claimed the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Present only once the job is completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<ResultRef>,
    /// Present only once the job has failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Cooperative cancellation flag checked by the worker.
    #[serde(default)]
    pub cancel_requested: bool,
}

impl Job {
    /// Create a new queued job.
    pub fn new(
        kind: JobKind,
        queue: QueueName,
        params: serde_json::Value,
        fingerprint: Fingerprint,
    ) -> Self {
        Self {
            id: JobId::new(),
            kind,
            queue,
            params,
            fingerprint,
            identity: None,
            status: JobStatus::Queued,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            worker_id: None,
            result_ref: None,
            error: None,
            cancel_requested: false,
        }
    }

    /// Record the caller identity.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Set the timeout for this job.
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                job_id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Claim the job for a worker.
    pub fn mark_running(
        &mut self,
        worker_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(JobStatus::Running)?;
        self.started_at = Some(now);
        self.worker_id = Some(worker_id.into());
        Ok(())
    }

    /// Record a successful run.
    pub fn mark_completed(
        &mut self,
        result_ref: ResultRef,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(JobStatus::Completed)?;
        self.finished_at = Some(now);
        self.result_ref = Some(result_ref);
        Ok(())
    }

    /// Record a failed run.
    pub fn mark_failed(&mut self, error: JobError, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Failed)?;
        self.finished_at = Some(now);
        self.error = Some(error);
        Ok(())
    }

    /// Wall-clock duration of the run, once finished.
    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        u64::try_from((finished - started).num_milliseconds()).ok()
    }
}
