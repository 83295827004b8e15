//! Event types for observability.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ErrorKind, Fingerprint, JobId, JobKind, QueueName};

/// Events emitted by the job subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    // Submission events
    /// A new job was created and enqueued.
    Submitted {
        job_id: JobId,
        kind: JobKind,
        queue: QueueName,
        timestamp: DateTime<Utc>,
    },
    /// A submission was answered from the result cache.
    CacheHit {
        kind: JobKind,
        fingerprint: Fingerprint,
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },
    /// A submission matched a job that is still queued or running.
    Deduplicated {
        job_id: JobId,
        kind: JobKind,
        timestamp: DateTime<Utc>,
    },
    /// A submission was rejected by the rate limiter.
    RateLimited {
        identity: String,
        timestamp: DateTime<Utc>,
    },
    /// The rate limit counter store could not be reached.
    RateLimiterUnavailable {
        identity: String,
        admitted: bool,
        error: String,
        timestamp: DateTime<Utc>,
    },

    // Job events
    /// A worker claimed a job.
    Started {
        job_id: JobId,
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A job completed successfully.
    Completed {
        job_id: JobId,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A job failed.
    Failed {
        job_id: JobId,
        kind: ErrorKind,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// Cancellation was requested for a job.
    CancelRequested {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },

    // Worker events
    /// A worker started consuming queues.
    WorkerConnected {
        worker_id: String,
        queues: Vec<QueueName>,
        timestamp: DateTime<Utc>,
    },
    /// A worker stopped.
    WorkerDisconnected {
        worker_id: String,
        timestamp: DateTime<Utc>,
    },

    // Maintenance events
    /// Running jobs without a live worker were failed.
    StaleJobsSwept {
        job_ids: Vec<JobId>,
        timestamp: DateTime<Utc>,
    },
    /// Expired cache entries were removed.
    CacheEvicted {
        count: usize,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::Submitted { timestamp, .. } => *timestamp,
            JobEvent::CacheHit { timestamp, .. } => *timestamp,
            JobEvent::Deduplicated { timestamp, .. } => *timestamp,
            JobEvent::RateLimited { timestamp, .. } => *timestamp,
            JobEvent::RateLimiterUnavailable { timestamp, .. } => *timestamp,
            JobEvent::Started { timestamp, .. } => *timestamp,
            JobEvent::Completed { timestamp, .. } => *timestamp,
            JobEvent::Failed { timestamp, .. } => *timestamp,
            JobEvent::CancelRequested { timestamp, .. } => *timestamp,
            JobEvent::WorkerConnected { timestamp, .. } => *timestamp,
            JobEvent::WorkerDisconnected { timestamp, .. } => *timestamp,
            JobEvent::StaleJobsSwept { timestamp, .. } => *timestamp,
            JobEvent::CacheEvicted { timestamp, .. } => *timestamp,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JobEvent::Submitted { job_id, .. } => Some(*job_id),
            JobEvent::CacheHit { job_id, .. } => Some(*job_id),
            JobEvent::Deduplicated { job_id, .. } => Some(*job_id),
            JobEvent::Started { job_id, .. } => Some(*job_id),
            JobEvent::Completed { job_id, .. } => Some(*job_id),
            JobEvent::Failed { job_id, .. } => Some(*job_id),
            JobEvent::CancelRequested { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::Submitted {
                job_id,
                kind,
                queue,
                ..
            } => format!("Job {} ({}) submitted to {}", job_id, kind, queue),
            JobEvent::CacheHit { kind, job_id, .. } => {
                format!("Cache hit for {} (job {})", kind, job_id)
            }
            JobEvent::Deduplicated { job_id, .. } => {
                format!("Submission joined in-flight job {}", job_id)
            }
            JobEvent::RateLimited { identity, .. } => format!("Rate limit hit for {}", identity),
            JobEvent::RateLimiterUnavailable {
                identity,
                admitted,
                error,
                ..
            } => {
                let outcome = if *admitted { "admitted" } else { "rejected" };
                format!("Rate limiter unavailable for {} ({}): {}", identity, outcome, error)
            }
            JobEvent::Started {
                job_id, worker_id, ..
            } => format!("Job {} started by {}", job_id, worker_id),
            JobEvent::Completed {
                job_id,
                duration_ms,
                ..
            } => format!("Job {} completed in {}ms", job_id, duration_ms),
            JobEvent::Failed { job_id, error, .. } => format!("Job {} failed: {}", job_id, error),
            JobEvent::CancelRequested { job_id, .. } => {
                format!("Cancellation requested for job {}", job_id)
            }
            JobEvent::WorkerConnected {
                worker_id, queues, ..
            } => {
                let queues: Vec<&str> = queues.iter().map(QueueName::as_str).collect();
                format!("Worker {} consuming [{}]", worker_id, queues.join(", "))
            }
            JobEvent::WorkerDisconnected { worker_id, .. } => {
                format!("Worker {} disconnected", worker_id)
            }
            JobEvent::StaleJobsSwept { job_ids, .. } => {
                format!("Swept {} stale running jobs", job_ids.len())
            }
            JobEvent::CacheEvicted { count, .. } => format!("Evicted {} cache entries", count),
        }
    }
}
