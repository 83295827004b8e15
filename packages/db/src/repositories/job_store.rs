//! Job store: durable job records with compare-and-set status changes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use jobs_core::{Fingerprint, Job, JobError, JobId, JobKind, JobStatus, QueueName, ResultRef};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;

use crate::{Database, DbError};

/// Internal record type for SurrealDB.
#[derive(Debug, Deserialize)]
struct JobRecord {
    #[serde(default)]
    #[allow(dead_code)]
    id: Option<Thing>,
    #[serde(flatten)]
    job: Job,
}

/// Marker held by the single in-flight job of a fingerprint.
#[derive(Debug, Serialize, Deserialize)]
struct InflightRecord {
    job_id: JobId,
}

/// Result of submitting a job record.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// The job was stored as given.
    Created(Job),
    /// A job with the same fingerprint is queued or running, or has
    /// completed and its result is not cached yet.
    Existing(Job),
}

impl CreateOutcome {
    pub fn job(&self) -> &Job {
        match self {
            CreateOutcome::Created(job) | CreateOutcome::Existing(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            CreateOutcome::Created(job) | CreateOutcome::Existing(job) => job,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

/// Filter options for listing jobs.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub kind: Option<JobKind>,
    pub queue: Option<QueueName>,
    pub limit: Option<usize>,
}

/// Repository for job persistence operations.
///
/// Every status change is a conditional update on the current status, so
/// concurrent writers can never move a job backwards or claim it twice.
#[derive(Clone)]
pub struct JobStore {
    db: Database,
}

fn first_job(records: Vec<JobRecord>) -> Option<Job> {
    records.into_iter().next().map(|r| r.job)
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store a new queued job unless another job still holds the in-flight
    /// marker of the same fingerprint, in which case that job is returned.
    pub async fn create_or_join(&self, job: &Job) -> Result<CreateOutcome, DbError> {
        match self.try_create(job).await {
            Ok(created) => return Ok(CreateOutcome::Created(created)),
            Err(err) => {
                if let Some(existing) = self.resolve_inflight(&job.fingerprint).await? {
                    return Ok(CreateOutcome::Existing(existing));
                }
                tracing::debug!(
                    "Retrying job create for {} after stale marker: {}",
                    job.fingerprint,
                    err
                );
            }
        }

        // The previous marker pointed at a finished or missing job and has
        // been removed.
        match self.try_create(job).await {
            Ok(created) => Ok(CreateOutcome::Created(created)),
            Err(err) => match self.resolve_inflight(&job.fingerprint).await? {
                Some(existing) => Ok(CreateOutcome::Existing(existing)),
                None => Err(err),
            },
        }
    }

    async fn try_create(&self, job: &Job) -> Result<Job, DbError> {
        self.db
            .query(
                r#"
                BEGIN TRANSACTION;
                CREATE type::thing('inflight', $fingerprint) CONTENT { job_id: $job_id };
                CREATE type::thing('job', $job_id) CONTENT $job;
                COMMIT TRANSACTION;
                "#,
            )
            .bind(("fingerprint", job.fingerprint.to_string()))
            .bind(("job_id", job.id.to_string()))
            .bind(("job", job.clone()))
            .await?
            .check()?;

        Ok(job.clone())
    }

    /// Find the job holding the in-flight marker for `fingerprint`.
    ///
    /// A completed job keeps its marker until [`JobStore::release`] runs
    /// after its result is cached. A marker whose job failed or vanished is
    /// deleted and `None` is returned.
    async fn resolve_inflight(&self, fingerprint: &Fingerprint) -> Result<Option<Job>, DbError> {
        let marker: Option<InflightRecord> = self
            .db
            .select(("inflight", fingerprint.to_string()))
            .await?;
        let Some(marker) = marker else {
            return Ok(None);
        };

        match self.find(marker.job_id).await? {
            Some(job) if job.status.is_in_flight() || job.status == JobStatus::Completed => {
                Ok(Some(job))
            }
            _ => {
                self.release_inflight(fingerprint, marker.job_id).await?;
                Ok(None)
            }
        }
    }

    async fn release_inflight(&self, fingerprint: &Fingerprint, job_id: JobId) -> Result<(), DbError> {
        self.db
            .query("DELETE type::thing('inflight', $fingerprint) WHERE job_id = $job_id")
            .bind(("fingerprint", fingerprint.to_string()))
            .bind(("job_id", job_id.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    /// Drop the in-flight marker `job` holds, letting the next identical
    /// submission create a new job.
    pub async fn release(&self, job: &Job) -> Result<(), DbError> {
        self.release_inflight(&job.fingerprint, job.id).await
    }

    /// Get a job by ID.
    pub async fn get(&self, id: JobId) -> Result<Job, DbError> {
        self.find(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("Job not found: {}", id)))
    }

    /// Get a job by ID, `None` when it does not exist.
    pub async fn find(&self, id: JobId) -> Result<Option<Job>, DbError> {
        let record: Option<JobRecord> = self.db.select(("job", id.to_string())).await?;
        Ok(record.map(|r| r.job))
    }

    /// Atomically move a queued job to running for `worker_id`.
    ///
    /// Returns `None` when the job is missing or no longer queued.
    pub async fn claim(&self, id: JobId, worker_id: &str) -> Result<Option<Job>, DbError> {
        let mut response = self
            .db
            .query(
                r#"
                UPDATE type::thing('job', $id)
                SET status = 'running', started_at = $now, worker_id = $worker_id
                WHERE status = 'queued'
                RETURN AFTER
                "#,
            )
            .bind(("id", id.to_string()))
            .bind(("now", Utc::now()))
            .bind(("worker_id", worker_id.to_string()))
            .await?
            .check()?;

        let records: Vec<JobRecord> = response.take(0)?;
        Ok(first_job(records))
    }

    /// Record the output of a job running on `worker_id`.
    ///
    /// Repeating the call with the same result after a lost reply returns
    /// the completed job again. Returns `None` when the job is not running
    /// on that worker any more. The in-flight marker stays until
    /// [`JobStore::release`].
    pub async fn complete(
        &self,
        id: JobId,
        worker_id: &str,
        result_ref: &ResultRef,
    ) -> Result<Option<Job>, DbError> {
        let mut response = self
            .db
            .query(
                r#"
                UPDATE type::thing('job', $id)
                SET status = 'completed', finished_at = $now, result_ref = $result_ref
                WHERE status = 'running' AND worker_id = $worker_id
                RETURN AFTER
                "#,
            )
            .bind(("id", id.to_string()))
            .bind(("now", Utc::now()))
            .bind(("worker_id", worker_id.to_string()))
            .bind(("result_ref", result_ref.clone()))
            .await?
            .check()?;

        let records: Vec<JobRecord> = response.take(0)?;
        if let Some(job) = first_job(records) {
            return Ok(Some(job));
        }

        Ok(self.find(id).await?.filter(|job| {
            job.status == JobStatus::Completed
                && job.worker_id.as_deref() == Some(worker_id)
                && job.result_ref.as_ref() == Some(result_ref)
        }))
    }

    /// Fail a job running on `worker_id`.
    pub async fn fail_claimed(
        &self,
        id: JobId,
        worker_id: &str,
        error: &JobError,
    ) -> Result<Option<Job>, DbError> {
        self.fail_where(
            id,
            "status = 'running' AND worker_id = $worker_id",
            Some(worker_id),
            error,
        )
        .await
    }

    /// Fail a job that was never claimed.
    pub async fn fail_queued(&self, id: JobId, error: &JobError) -> Result<Option<Job>, DbError> {
        self.fail_where(id, "status = 'queued'", None, error).await
    }

    async fn fail_where(
        &self,
        id: JobId,
        condition: &str,
        worker_id: Option<&str>,
        error: &JobError,
    ) -> Result<Option<Job>, DbError> {
        let query = format!(
            "UPDATE type::thing('job', $id) SET status = 'failed', finished_at = $now, error = $error WHERE {} RETURN AFTER",
            condition
        );

        let mut response = self
            .db
            .query(&query)
            .bind(("id", id.to_string()))
            .bind(("now", Utc::now()))
            .bind(("worker_id", worker_id.unwrap_or_default().to_string()))
            .bind(("error", error.clone()))
            .await?
            .check()?;

        let records: Vec<JobRecord> = response.take(0)?;
        let job = first_job(records);
        if let Some(job) = &job {
            self.release_inflight(&job.fingerprint, job.id).await?;
        }
        Ok(job)
    }

    /// Set the cooperative cancellation flag on a job.
    ///
    /// Finished jobs are returned unchanged.
    pub async fn request_cancel(&self, id: JobId) -> Result<Job, DbError> {
        let mut response = self
            .db
            .query(
                r#"
                UPDATE type::thing('job', $id)
                SET cancel_requested = true
                WHERE status INSIDE ['queued', 'running']
                RETURN AFTER
                "#,
            )
            .bind(("id", id.to_string()))
            .await?
            .check()?;

        let records: Vec<JobRecord> = response.take(0)?;
        match first_job(records) {
            Some(job) => Ok(job),
            None => self.get(id).await,
        }
    }

    /// Whether cancellation has been requested for a job.
    pub async fn is_cancel_requested(&self, id: JobId) -> Result<bool, DbError> {
        Ok(self.find(id).await?.is_some_and(|job| job.cancel_requested))
    }

    /// List jobs with optional filtering, oldest first.
    pub async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, DbError> {
        let mut conditions = Vec::new();

        if filter.status.is_some() {
            conditions.push("status = $status");
        }
        if filter.kind.is_some() {
            conditions.push("kind = $kind");
        }
        if filter.queue.is_some() {
            conditions.push("queue = $queue");
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let limit_clause = filter
            .limit
            .map(|l| format!("LIMIT {}", l))
            .unwrap_or_default();

        // ULIDs sort chronologically as strings.
        let query = format!(
            "SELECT * FROM job {} ORDER BY job_id ASC {}",
            where_clause, limit_clause
        );

        let mut response = self
            .db
            .query(&query)
            .bind(("status", filter.status.unwrap_or_default()))
            .bind(("kind", filter.kind.map(|k| k.to_string()).unwrap_or_default()))
            .bind(("queue", filter.queue.map(|q| q.to_string()).unwrap_or_default()))
            .await?
            .check()?;

        let records: Vec<JobRecord> = response.take(0)?;
        Ok(records.into_iter().map(|r| r.job).collect())
    }

    /// List every job in the given status, oldest first.
    pub async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, DbError> {
        self.list(JobFilter {
            status: Some(status),
            ..Default::default()
        })
        .await
    }

    /// Running jobs whose worker claimed them before `started_before`.
    pub async fn find_stale_running(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, DbError> {
        let running = self.list_by_status(JobStatus::Running).await?;
        Ok(running
            .into_iter()
            .filter(|job| job.started_at.is_some_and(|started| started < started_before))
            .collect())
    }

    /// Count jobs by status.
    pub async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>, DbError> {
        let mut response = self
            .db
            .query("SELECT status, count() AS count FROM job GROUP BY status")
            .await?
            .check()?;

        #[derive(Deserialize)]
        struct StatusCount {
            status: JobStatus,
            count: i64,
        }

        let counts: Vec<StatusCount> = response.take(0)?;

        Ok(counts
            .into_iter()
            .map(|c| (c.status, u64::try_from(c.count).unwrap_or(0)))
            .collect())
    }

    /// Fail every job that is still queued, returning their ids.
    pub async fn expire_queued(&self, error: &JobError) -> Result<Vec<JobId>, DbError> {
        let mut expired = Vec::new();
        for job in self.list_by_status(JobStatus::Queued).await? {
            if self.fail_queued(job.id, error).await?.is_some() {
                expired.push(job.id);
            }
        }
        Ok(expired)
    }

    /// Remove every in-flight marker.
    pub async fn clear_inflight(&self) -> Result<(), DbError> {
        self.db.query("DELETE inflight").await?.check()?;
        Ok(())
    }
}
