//! Submission gateway.
//!
//! The only entry point callers use: it validates and fingerprints a
//! request, answers from the result cache when it can, applies the rate
//! limiter, and otherwise records a queued job and hands it to the broker.
//! It never waits for a job to finish.

use std::sync::Arc;

use actors::{BrokerHandle, KindRegistry};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use db::{CreateOutcome, DbError, JobStore, ResultCache};
use jobs_core::{
    CacheEntry, ErrorKind, Fingerprint, Job, JobError, JobEvent, JobId, JobKind, JobStatus, QueueEntry,
    QueueName, QueueStats, ResultRef, ValidationError,
};
use serde::Serialize;
use serde_json::Value;
use storage::ResultStorage;
use tokio::sync::broadcast;

use crate::error::GatewayError;
use crate::rate_limit::RateLimiter;

/// Outcome of a successful submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Submission {
    /// A job is queued or running. `deduplicated` is set when an identical
    /// in-flight job was joined instead of creating a new one.
    Queued { job_id: JobId, deduplicated: bool },
    /// The result already exists.
    Cached { job_id: JobId, result_ref: ResultRef },
}

impl Submission {
    pub fn job_id(&self) -> JobId {
        match self {
            Submission::Queued { job_id, .. } | Submission::Cached { job_id, .. } => *job_id,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Submission::Cached { .. })
    }
}

/// What a polling client sees for a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusDocument {
    pub job_id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub params: Value,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<ResultRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub cancel_requested: bool,
}

impl From<Job> for JobStatusDocument {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind,
            status: job.status,
            params: job.params,
            submitted_at: job.submitted_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            result_ref: job.result_ref,
            error: job.error,
            cancel_requested: job.cancel_requested,
        }
    }
}

/// Accepts submissions and answers status and result queries.
#[derive(Clone)]
pub struct SubmissionGateway {
    kinds: Arc<KindRegistry>,
    jobs: JobStore,
    cache: ResultCache,
    storage: ResultStorage,
    limiter: Arc<RateLimiter>,
    /// Without a broker, jobs stay queued until a worker process picks them
    /// up in its recovery scan.
    broker: Option<BrokerHandle>,
    events: broadcast::Sender<JobEvent>,
    data_version: Option<String>,
}

impl SubmissionGateway {
    pub fn new(
        kinds: Arc<KindRegistry>,
        jobs: JobStore,
        cache: ResultCache,
        storage: ResultStorage,
        limiter: Arc<RateLimiter>,
        events: broadcast::Sender<JobEvent>,
    ) -> Self {
        Self {
            kinds,
            jobs,
            cache,
            storage,
            limiter,
            broker: None,
            events,
            data_version: None,
        }
    }

    pub fn with_broker(mut self, broker: BrokerHandle) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_data_version(mut self, data_version: Option<String>) -> Self {
        self.data_version = data_version;
        self
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    /// Serve a job that completed but whose worker has not cached the result
    /// yet. Writes the entry and releases the marker itself, so a worker
    /// that died in between leaves nothing behind.
    async fn adopt_completed(&self, job: &Job) -> Option<Submission> {
        let result_ref = job.result_ref.clone()?;
        let entry = CacheEntry::new(
            job.kind.clone(),
            job.fingerprint.clone(),
            result_ref.clone(),
            job.id,
        );
        if let Err(err) = self.cache.put(&entry).await {
            tracing::warn!("Could not cache result of job {}: {}", job.id, err);
        }
        if let Err(err) = self.jobs.release(job).await {
            tracing::warn!("Could not release in-flight marker of job {}: {}", job.id, err);
        }

        tracing::debug!("Submission served by just completed job {}", job.id);
        self.emit(JobEvent::CacheHit {
            kind: job.kind.clone(),
            fingerprint: job.fingerprint.clone(),
            job_id: job.id,
            timestamp: Utc::now(),
        });
        Some(Submission::Cached {
            job_id: job.id,
            result_ref,
        })
    }

    /// Validate, fingerprint and either answer from cache or queue a job.
    pub async fn submit(
        &self,
        identity: &str,
        kind: &JobKind,
        params: &Value,
    ) -> Result<Submission, GatewayError> {
        let descriptor = self
            .kinds
            .get(kind)
            .ok_or_else(|| ValidationError::UnknownKind(kind.to_string()))?;
        let params = descriptor.schema.validate(params)?;
        let fingerprint = Fingerprint::compute(kind, &params, self.data_version.as_deref());

        if let Some(entry) = self.cache.get(kind, &fingerprint).await? {
            tracing::debug!("Cache hit for {} ({})", kind, fingerprint);
            self.emit(JobEvent::CacheHit {
                kind: kind.clone(),
                fingerprint,
                job_id: entry.job_id,
                timestamp: Utc::now(),
            });
            return Ok(Submission::Cached {
                job_id: entry.job_id,
                result_ref: entry.result_ref,
            });
        }

        if !self.limiter.allow(identity).await {
            self.emit(JobEvent::RateLimited {
                identity: identity.to_string(),
                timestamp: Utc::now(),
            });
            return Err(GatewayError::RateLimitExceeded {
                identity: identity.to_string(),
            });
        }

        let job = Job::new(kind.clone(), descriptor.queue.clone(), params, fingerprint)
            .with_identity(identity)
            .with_timeout(descriptor.timeout_secs);

        let job = match self.jobs.create_or_join(&job).await? {
            CreateOutcome::Existing(existing) if existing.status == JobStatus::Completed => {
                if let Some(cached) = self.adopt_completed(&existing).await {
                    return Ok(cached);
                }
                return Ok(Submission::Queued {
                    job_id: existing.id,
                    deduplicated: true,
                });
            }
            CreateOutcome::Existing(existing) => {
                tracing::debug!("Submission joined in-flight job {}", existing.id);
                self.emit(JobEvent::Deduplicated {
                    job_id: existing.id,
                    kind: existing.kind.clone(),
                    timestamp: Utc::now(),
                });
                return Ok(Submission::Queued {
                    job_id: existing.id,
                    deduplicated: true,
                });
            }
            CreateOutcome::Created(job) => job,
        };

        if let Some(broker) = &self.broker {
            let entry = QueueEntry::new(job.id, job.queue.clone());
            if let Err(err) = broker.enqueue(entry).await {
                tracing::error!("Failed to enqueue job {}: {}", job.id, err);
                let error = JobError::new(ErrorKind::Infrastructure, err.to_string());
                if let Err(e) = self.jobs.fail_queued(job.id, &error).await {
                    tracing::error!("Failed to mark job {} as failed: {}", job.id, e);
                }
                return Err(err.into());
            }
        }

        tracing::info!("Job {} ({}) queued on {}", job.id, job.kind, job.queue);
        self.emit(JobEvent::Submitted {
            job_id: job.id,
            kind: job.kind.clone(),
            queue: job.queue.clone(),
            timestamp: Utc::now(),
        });

        Ok(Submission::Queued {
            job_id: job.id,
            deduplicated: false,
        })
    }

    pub async fn status(&self, job_id: JobId) -> Result<JobStatusDocument, GatewayError> {
        Ok(self.job(job_id).await?.into())
    }

    /// Stored output of a completed job.
    pub async fn result(&self, job_id: JobId) -> Result<Bytes, GatewayError> {
        let job = self.job(job_id).await?;
        match (job.status, job.result_ref, job.error) {
            (JobStatus::Completed, Some(result_ref), _) => self.result_by_ref(&result_ref).await,
            (JobStatus::Failed, _, Some(error)) => Err(GatewayError::Failed { job_id, error }),
            (status, _, _) => Err(GatewayError::NotReady { job_id, status }),
        }
    }

    pub async fn result_by_ref(&self, result_ref: &ResultRef) -> Result<Bytes, GatewayError> {
        Ok(self.storage.get_result(result_ref).await?)
    }

    /// Ask for a job to stop. A job still waiting in its queue fails at once;
    /// a running job is stopped by its worker at the next check.
    pub async fn cancel(&self, job_id: JobId) -> Result<JobStatusDocument, GatewayError> {
        let job = self.jobs.request_cancel(job_id).await.map_err(|e| match e {
            DbError::NotFound(_) => GatewayError::NotFound(job_id),
            other => other.into(),
        })?;
        if job.status.is_terminal() {
            return Ok(job.into());
        }

        self.emit(JobEvent::CancelRequested {
            job_id,
            timestamp: Utc::now(),
        });

        if job.status == JobStatus::Queued {
            let error = JobError::cancelled();
            if let Some(failed) = self.jobs.fail_queued(job_id, &error).await? {
                self.emit(JobEvent::Failed {
                    job_id,
                    kind: ErrorKind::Cancelled,
                    error: error.message,
                    timestamp: Utc::now(),
                });
                return Ok(failed.into());
            }
            // Claimed in the meantime; the worker sees the flag.
            return self.status(job_id).await;
        }

        Ok(job.into())
    }

    pub async fn queue_stats(&self) -> Result<Vec<QueueStats>, GatewayError> {
        match &self.broker {
            Some(broker) => Ok(broker.stats().await?),
            None => Ok(Vec::new()),
        }
    }

    /// Registered kinds with their queues.
    pub fn kinds(&self) -> Vec<(JobKind, QueueName)> {
        self.kinds
            .kinds()
            .into_iter()
            .filter_map(|kind| {
                let queue = self.kinds.get(&kind)?.queue.clone();
                Some((kind, queue))
            })
            .collect()
    }

    async fn job(&self, job_id: JobId) -> Result<Job, GatewayError> {
        self.jobs
            .find(job_id)
            .await?
            .ok_or(GatewayError::NotFound(job_id))
    }
}
