#![allow(dead_code)]

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use actors::{
    ExecutionFuture, ExecutionOutput, ExecutionRequest, Executor, FnExecutor, JobServices,
    MaintenanceSettings, SupervisorArgs, SupervisorHandle, WorkerPool, WorkerSettings,
    start_supervisor,
};
use db::{DbConfig, JobStore, ResultCache};
use jobs_core::{CachePolicy, Fingerprint, Job, JobEvent, JobId, JobKind, JobStatus, QueueName};
use serde_json::Value;
use storage::{ResultStorage, StorageConfig};
use tokio::sync::broadcast;

pub type TestResult<T = ()> = Result<T, Box<dyn Error>>;

pub async fn services(executor: Arc<dyn Executor>) -> TestResult<(JobServices, broadcast::Receiver<JobEvent>)> {
    let db = db::init(&DbConfig::memory()).await?;
    let (events, rx) = broadcast::channel(256);
    let services = JobServices {
        jobs: JobStore::new(db.clone()),
        cache: ResultCache::new(db, CachePolicy::Permanent),
        storage: ResultStorage::new(StorageConfig::memory()).await?,
        executor,
        events,
    };
    Ok((services, rx))
}

pub fn fast_settings() -> WorkerSettings {
    WorkerSettings {
        poll_timeout: Duration::from_millis(200),
        cancel_check_interval: Duration::from_millis(50),
        retry_backoff: Duration::from_millis(50),
    }
}

pub async fn start(services: JobServices, pools: Vec<WorkerPool>) -> TestResult<SupervisorHandle> {
    let handle = start_supervisor(SupervisorArgs {
        services,
        settings: fast_settings(),
        pools,
        maintenance: MaintenanceSettings {
            tick_interval: Duration::from_millis(200),
            stale_after: None,
        },
    })
    .await
    .map_err(|e| e.to_string())?;
    Ok(handle)
}

pub fn default_pool(concurrency: usize) -> WorkerPool {
    WorkerPool::new(vec![QueueName::default_queue()], concurrency)
}

/// Executor that writes the job parameters back as JSON.
pub fn echo_executor() -> Arc<dyn Executor> {
    Arc::new(FnExecutor::new(|request: ExecutionRequest| -> ExecutionFuture {
        Box::pin(async move { Ok(ExecutionOutput::json(&request.params)) })
    }))
}

pub fn job_for(kind: &str, queue: QueueName, params: Value) -> Job {
    let kind = JobKind::from(kind);
    let fingerprint = Fingerprint::compute(&kind, &params, None);
    Job::new(kind, queue, params, fingerprint)
}

/// Poll the store until the job reaches a terminal status.
pub async fn wait_until_finished(jobs: &JobStore, id: JobId) -> TestResult<Job> {
    wait_for_status(jobs, id, |s| s.is_terminal()).await
}

pub async fn wait_for_status(
    jobs: &JobStore,
    id: JobId,
    done: impl Fn(JobStatus) -> bool,
) -> TestResult<Job> {
    for _ in 0..200 {
        let job = jobs.get(id).await?;
        if done(job.status) {
            return Ok(job);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    Err(format!("job {id} did not reach the expected status").into())
}

/// Receive events until one matches, returning everything seen.
pub async fn events_until(
    events: &mut broadcast::Receiver<JobEvent>,
    matches: impl Fn(&JobEvent) -> bool,
) -> TestResult<Vec<JobEvent>> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await??;
        let done = matches(&event);
        seen.push(event);
        if done {
            return Ok(seen);
        }
    }
}
