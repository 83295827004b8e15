//! Worker actor for executing jobs.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use db::{DbError, JobStore, ResultCache};
use jobs_core::{CacheEntry, Delivery, ErrorKind, Job, JobError, JobEvent, JobId, QueueName};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use storage::ResultStorage;
use tokio::sync::broadcast;

use crate::broker::BrokerHandle;
use crate::executor::{ExecutionOutput, ExecutionRequest, Executor};
use crate::messages::WorkerMessage;

/// Attempts for the final status write of a claimed job.
const FINISH_ATTEMPTS: u32 = 3;

/// Timing knobs shared by every worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// How long one dequeue blocks before the worker polls again.
    pub poll_timeout: Duration,
    /// How often a running job's cancellation flag is read.
    pub cancel_check_interval: Duration,
    /// Pause after an infrastructure failure.
    pub retry_backoff: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(5),
            cancel_check_interval: Duration::from_secs(2),
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Stores and executor a worker needs, independent of the broker.
#[derive(Clone)]
pub struct JobServices {
    pub jobs: JobStore,
    pub cache: ResultCache,
    pub storage: ResultStorage,
    pub executor: Arc<dyn Executor>,
    pub events: broadcast::Sender<JobEvent>,
}

impl JobServices {
    pub fn emit(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }
}

/// Everything a worker reads while running.
pub struct WorkerContext {
    pub broker: BrokerHandle,
    pub services: JobServices,
    pub settings: WorkerSettings,
}

/// State for the worker actor.
pub struct WorkerState {
    pub worker_id: String,
    pub queues: Vec<QueueName>,
    ctx: Arc<WorkerContext>,
    running: bool,
}

/// Worker actor arguments.
pub struct WorkerArgs {
    pub worker_id: String,
    pub queues: Vec<QueueName>,
    pub ctx: Arc<WorkerContext>,
}

/// Worker actor that runs one job at a time from its queues.
pub struct Worker;

impl Actor for Worker {
    type Msg = WorkerMessage;
    type State = WorkerState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let queue_names: Vec<&str> = args.queues.iter().map(QueueName::as_str).collect();
        tracing::info!("Starting worker {} on [{}]", args.worker_id, queue_names.join(", "));

        args.ctx.services.emit(JobEvent::WorkerConnected {
            worker_id: args.worker_id.clone(),
            queues: args.queues.clone(),
            timestamp: Utc::now(),
        });

        myself.send_message(WorkerMessage::Poll)?;

        Ok(WorkerState {
            worker_id: args.worker_id,
            queues: args.queues,
            ctx: args.ctx,
            running: true,
        })
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!("Worker {} stopped", state.worker_id);
        let _ = state.ctx.broker.release_worker(&state.worker_id);
        state.ctx.services.emit(JobEvent::WorkerDisconnected {
            worker_id: state.worker_id.clone(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Poll => {
                if !state.running {
                    myself.stop(None);
                    return Ok(());
                }

                let ctx = state.ctx.clone();
                let polled = ctx
                    .broker
                    .dequeue(&state.worker_id, &state.queues, ctx.settings.poll_timeout)
                    .await;

                match polled {
                    Ok(Some(delivery)) => {
                        if let Err(err) = process(&ctx, &state.worker_id, &delivery).await {
                            tracing::warn!(
                                "Worker {} could not claim job {}, requeueing: {}",
                                state.worker_id,
                                delivery.entry.job_id,
                                err
                            );
                            let _ = ctx.broker.nack(delivery.tag);
                            tokio::time::sleep(ctx.settings.retry_backoff).await;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!("Worker {} could not reach the broker: {}", state.worker_id, err);
                        tokio::time::sleep(ctx.settings.retry_backoff).await;
                    }
                }

                myself.send_message(WorkerMessage::Poll)?;
            }

            WorkerMessage::Shutdown => {
                tracing::info!("Shutting down worker: {}", state.worker_id);
                state.running = false;
                myself.stop(None);
            }
        }

        Ok(())
    }
}

enum Outcome {
    Completed(ExecutionOutput),
    Failed(JobError),
}

/// Claim and run one delivery. Errors are returned only while the job is
/// still unclaimed, in which case the delivery should be retried.
async fn process(ctx: &WorkerContext, worker_id: &str, delivery: &Delivery) -> Result<(), DbError> {
    let services = &ctx.services;
    let job_id = delivery.entry.job_id;

    let Some(job) = services.jobs.claim(job_id, worker_id).await? else {
        tracing::debug!(
            "Job {} is no longer queued, dropping delivery {}",
            job_id,
            delivery.tag
        );
        let _ = ctx.broker.ack(delivery.tag);
        return Ok(());
    };

    tracing::info!(
        "Worker {} started job {} ({}, attempt {})",
        worker_id,
        job.id,
        job.kind,
        delivery.attempt
    );
    services.emit(JobEvent::Started {
        job_id: job.id,
        worker_id: worker_id.to_string(),
        timestamp: Utc::now(),
    });

    let outcome = run_claimed(ctx, &job).await;
    finish(ctx, worker_id, &job, outcome).await;

    let _ = ctx.broker.ack(delivery.tag);
    Ok(())
}

async fn run_claimed(ctx: &WorkerContext, job: &Job) -> Outcome {
    let services = &ctx.services;
    if job.cancel_requested {
        return Outcome::Failed(JobError::cancelled());
    }

    let request = ExecutionRequest {
        job_id: job.id,
        kind: job.kind.clone(),
        params: job.params.clone(),
        timeout: Duration::from_secs(job.timeout_secs),
    };

    // Dropping the execution future stops the computation.
    let result = tokio::select! {
        result = services.executor.run(request) => result,
        () = wait_for_cancel(&services.jobs, job.id, ctx.settings.cancel_check_interval) => {
            tracing::info!("Job {} cancelled while running", job.id);
            return Outcome::Failed(JobError::cancelled());
        }
    };

    match result {
        Ok(output) => match services.jobs.is_cancel_requested(job.id).await {
            Ok(true) => Outcome::Failed(JobError::cancelled()),
            Ok(false) => Outcome::Completed(output),
            Err(err) => {
                tracing::warn!("Could not re-check cancellation of job {}: {}", job.id, err);
                Outcome::Completed(output)
            }
        },
        Err(err) => {
            tracing::info!("Job {} execution failed: {}", job.id, err);
            Outcome::Failed(err.into())
        }
    }
}

async fn wait_for_cancel(jobs: &JobStore, job_id: JobId, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        match jobs.is_cancel_requested(job_id).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(err) => tracing::warn!("Could not check cancellation of job {}: {}", job_id, err),
        }
    }
}

/// Write the terminal status of a claimed job.
async fn finish(ctx: &WorkerContext, worker_id: &str, job: &Job, outcome: Outcome) {
    let services = &ctx.services;

    let error = match outcome {
        Outcome::Completed(output) => {
            match services
                .storage
                .put_result(&job.kind, job.id, &output.extension, output.bytes)
                .await
            {
                Ok(result_ref) => {
                    let completed = with_retries(ctx, job.id, || {
                        services.jobs.complete(job.id, worker_id, &result_ref)
                    })
                    .await;

                    match completed {
                        Ok(Some(done)) => {
                            let entry = CacheEntry::new(
                                done.kind.clone(),
                                done.fingerprint.clone(),
                                result_ref.clone(),
                                done.id,
                            );
                            if let Err(err) = services.cache.put(&entry).await {
                                tracing::warn!("Could not cache result of job {}: {}", done.id, err);
                            }
                            // Identical submissions join this job until the entry exists.
                            if let Err(err) =
                                with_retries(ctx, done.id, || services.jobs.release(&done)).await
                            {
                                tracing::warn!("Could not release in-flight marker of job {}: {}", done.id, err);
                            }

                            let duration_ms = done.duration_ms().unwrap_or(0);
                            tracing::info!("Job {} completed in {}ms", done.id, duration_ms);
                            services.emit(JobEvent::Completed {
                                job_id: done.id,
                                duration_ms,
                                timestamp: Utc::now(),
                            });
                        }
                        Ok(None) => {
                            tracing::warn!("Job {} is no longer held by {}", job.id, worker_id);
                            // Nothing references the stored output.
                            if let Err(err) = services.storage.delete(result_ref.as_str()).await {
                                tracing::warn!("Could not remove output of job {}: {}", job.id, err);
                            }
                        }
                        Err(err) => {
                            tracing::error!("Could not record completion of job {}: {}", job.id, err);
                        }
                    }
                    return;
                }
                Err(err) => JobError::new(
                    ErrorKind::Infrastructure,
                    format!("could not store result: {err}"),
                ),
            }
        }
        Outcome::Failed(error) => error,
    };

    match with_retries(ctx, job.id, || services.jobs.fail_claimed(job.id, worker_id, &error)).await {
        Ok(Some(_)) => {
            tracing::info!("Job {} failed: {}", job.id, error);
            services.emit(JobEvent::Failed {
                job_id: job.id,
                kind: error.kind,
                error: error.message.clone(),
                timestamp: Utc::now(),
            });
        }
        Ok(None) => tracing::warn!("Job {} is no longer held by {}", job.id, worker_id),
        Err(err) => tracing::error!("Could not record failure of job {}: {}", job.id, err),
    }
}

async fn with_retries<T, F, Fut>(ctx: &WorkerContext, job_id: JobId, mut op: F) -> Result<T, DbError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DbError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < FINISH_ATTEMPTS => {
                tracing::warn!(
                    "Status write for job {} failed (attempt {}): {}",
                    job_id,
                    attempt,
                    err
                );
                tokio::time::sleep(ctx.settings.retry_backoff * attempt).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
