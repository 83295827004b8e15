//! Supervisor actor owning the broker and the worker pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use db::{DbError, JobStore};
use jobs_core::{ErrorKind, JobError, JobEvent, JobId, JobStatus, QueueEntry, QueueName};
use ractor::rpc::CallResult;
use ractor::{Actor, ActorId, ActorProcessingErr, ActorRef, SupervisionEvent};
use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::broker::{Broker, BrokerHandle, QueueError};
use crate::messages::{BrokerMessage, SupervisorMessage, WorkerMessage};
use crate::worker::{JobServices, Worker, WorkerArgs, WorkerContext, WorkerSettings};

#[derive(Debug, thiserror::Error)]
pub enum MaintenanceError {
    #[error("job store error: {0}")]
    Store(#[from] DbError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("invalid duration: {0}")]
    Duration(String),
}

/// A group of workers consuming the same queues.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkerPool {
    pub queues: Vec<QueueName>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    1
}

impl WorkerPool {
    pub fn new(queues: Vec<QueueName>, concurrency: usize) -> Self {
        Self {
            queues,
            concurrency,
        }
    }
}

/// Periodic housekeeping settings.
#[derive(Debug, Clone)]
pub struct MaintenanceSettings {
    pub tick_interval: Duration,
    /// Fail running jobs older than this. Must exceed the longest job
    /// timeout; `None` disables the sweep.
    pub stale_after: Option<Duration>,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            stale_after: None,
        }
    }
}

/// Supervisor actor arguments.
pub struct SupervisorArgs {
    pub services: JobServices,
    pub settings: WorkerSettings,
    pub pools: Vec<WorkerPool>,
    pub maintenance: MaintenanceSettings,
}

struct WorkerSlot {
    worker_id: String,
    pool: usize,
    actor: ActorRef<WorkerMessage>,
}

/// State for the supervisor actor.
pub struct SupervisorState {
    ctx: Arc<WorkerContext>,
    broker: ActorRef<BrokerMessage>,
    pools: Vec<WorkerPool>,
    workers: HashMap<ActorId, WorkerSlot>,
    maintenance: MaintenanceSettings,
    /// Prefix making worker ids unique across processes.
    instance: String,
    worker_counter: u64,
    shutting_down: bool,
}

impl SupervisorState {
    fn next_worker_id(&mut self) -> String {
        self.worker_counter += 1;
        format!("{}-worker-{}", self.instance, self.worker_counter)
    }

    fn stop_all(&mut self) {
        self.shutting_down = true;
        for slot in self.workers.values() {
            slot.actor.stop(None);
        }
        self.broker.stop(None);
    }
}

async fn spawn_worker(
    myself: &ActorRef<SupervisorMessage>,
    state: &mut SupervisorState,
    pool: usize,
) -> Result<(), ActorProcessingErr> {
    let worker_id = state.next_worker_id();
    let queues = state.pools[pool].queues.clone();
    let args = WorkerArgs {
        worker_id: worker_id.clone(),
        queues,
        ctx: state.ctx.clone(),
    };

    let (actor, _handle) = Actor::spawn_linked(None, Worker, args, myself.get_cell())
        .await
        .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn worker: {}", e)))?;

    state.workers.insert(
        actor.get_id(),
        WorkerSlot {
            worker_id,
            pool,
            actor,
        },
    );
    Ok(())
}

/// Enqueue every queued job the broker does not already hold.
///
/// Queue entries are transient; this rebuilds them from the job store after
/// a restart or a reset, and picks up jobs submitted by other processes.
pub async fn recover_queued(jobs: &JobStore, broker: &BrokerHandle) -> Result<usize, MaintenanceError> {
    let mut recovered = 0;
    for job in jobs.list_by_status(JobStatus::Queued).await? {
        if broker.enqueue(QueueEntry::new(job.id, job.queue.clone())).await? {
            recovered += 1;
        }
    }
    if recovered > 0 {
        tracing::info!("Recovered {} queued jobs", recovered);
    }
    Ok(recovered)
}

/// Fail running jobs claimed more than `older_than` ago.
pub async fn sweep_stale(
    services: &JobServices,
    older_than: Duration,
) -> Result<Vec<JobId>, MaintenanceError> {
    let age = chrono::Duration::from_std(older_than)
        .map_err(|e| MaintenanceError::Duration(e.to_string()))?;
    let cutoff = Utc::now() - age;

    let mut swept = Vec::new();
    for job in services.jobs.find_stale_running(cutoff).await? {
        let worker_id = job.worker_id.clone().unwrap_or_default();
        let error = JobError::new(
            ErrorKind::WorkerLost,
            format!("no result from {} within {:?}", worker_id, older_than),
        );
        if services
            .jobs
            .fail_claimed(job.id, &worker_id, &error)
            .await?
            .is_some()
        {
            swept.push(job.id);
        }
    }

    if !swept.is_empty() {
        tracing::warn!("Failed {} stale running jobs", swept.len());
        services.emit(JobEvent::StaleJobsSwept {
            job_ids: swept.clone(),
            timestamp: Utc::now(),
        });
    }
    Ok(swept)
}

/// Fail the running jobs of a worker that died.
async fn fail_jobs_of(services: &JobServices, worker_id: &str) -> Result<(), MaintenanceError> {
    let error = JobError::new(ErrorKind::WorkerLost, format!("{} stopped unexpectedly", worker_id));
    for job in services.jobs.list_by_status(JobStatus::Running).await? {
        if job.worker_id.as_deref() != Some(worker_id) {
            continue;
        }
        if services.jobs.fail_claimed(job.id, worker_id, &error).await?.is_some() {
            services.emit(JobEvent::Failed {
                job_id: job.id,
                kind: error.kind,
                error: error.message.clone(),
                timestamp: Utc::now(),
            });
        }
    }
    Ok(())
}

/// Supervisor actor that runs the broker and restarts workers.
pub struct Supervisor;

impl Supervisor {
    async fn tick(&self, state: &mut SupervisorState) {
        let services = &state.ctx.services;

        if let Err(e) = recover_queued(&services.jobs, &state.ctx.broker).await {
            tracing::warn!("Recovery scan failed: {}", e);
        }

        match services.cache.evict(Utc::now()).await {
            Ok(0) => {}
            Ok(count) => services.emit(JobEvent::CacheEvicted {
                count,
                timestamp: Utc::now(),
            }),
            Err(e) => tracing::warn!("Cache eviction failed: {}", e),
        }

        if let Some(stale_after) = state.maintenance.stale_after
            && let Err(e) = sweep_stale(services, stale_after).await
        {
            tracing::warn!("Stale job sweep failed: {}", e);
        }
    }

    async fn child_exited(
        &self,
        myself: &ActorRef<SupervisorMessage>,
        state: &mut SupervisorState,
        id: ActorId,
        reason: String,
        failed: bool,
    ) -> Result<(), ActorProcessingErr> {
        if id == state.broker.get_id() {
            if !state.shutting_down {
                tracing::error!("Queue broker stopped: {}", reason);
                state.stop_all();
                myself.stop(Some(format!("broker stopped: {}", reason)));
            }
            return Ok(());
        }

        let Some(slot) = state.workers.remove(&id) else {
            return Ok(());
        };

        let _ = state.ctx.broker.release_worker(&slot.worker_id);
        if failed {
            tracing::warn!("Worker {} failed: {}", slot.worker_id, reason);
            if let Err(e) = fail_jobs_of(&state.ctx.services, &slot.worker_id).await {
                tracing::warn!("Could not fail jobs of {}: {}", slot.worker_id, e);
            }
        }

        if !state.shutting_down {
            tracing::info!("Restarting worker {}", slot.worker_id);
            spawn_worker(myself, state, slot.pool).await?;
        }
        Ok(())
    }
}

impl Actor for Supervisor {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = SupervisorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting job supervisor");

        let (broker, _handle) = Actor::spawn_linked(None, Broker, (), myself.get_cell())
            .await
            .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn broker: {}", e)))?;

        let ctx = Arc::new(WorkerContext {
            broker: BrokerHandle::new(broker.clone()),
            services: args.services,
            settings: args.settings,
        });

        let mut state = SupervisorState {
            ctx,
            broker,
            pools: args.pools,
            workers: HashMap::new(),
            maintenance: args.maintenance,
            instance: ulid::Ulid::new().to_string().to_lowercase(),
            worker_counter: 0,
            shutting_down: false,
        };

        for pool in 0..state.pools.len() {
            for _ in 0..state.pools[pool].concurrency {
                spawn_worker(&myself, &mut state, pool).await?;
            }
        }

        myself.send_message(SupervisorMessage::Recover { reply: None })?;

        let tick_interval = state.maintenance.tick_interval;
        let myself_clone = myself.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            // The first tick fires immediately and recovery already ran.
            interval.tick().await;
            loop {
                interval.tick().await;
                if myself_clone.send_message(SupervisorMessage::Tick).is_err() {
                    break;
                }
            }
        });

        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::Tick => {
                self.tick(state).await;
            }

            SupervisorMessage::Recover { reply } => {
                let recovered = match recover_queued(&state.ctx.services.jobs, &state.ctx.broker).await
                {
                    Ok(count) => count,
                    Err(e) => {
                        tracing::warn!("Recovery scan failed: {}", e);
                        0
                    }
                };
                if let Some(reply) = reply {
                    let _ = reply.send(recovered);
                }
            }

            SupervisorMessage::SweepStale { older_than, reply } => {
                let swept = match sweep_stale(&state.ctx.services, older_than).await {
                    Ok(swept) => swept,
                    Err(e) => {
                        tracing::warn!("Stale job sweep failed: {}", e);
                        Vec::new()
                    }
                };
                let _ = reply.send(swept);
            }

            SupervisorMessage::GetBroker { reply } => {
                let _ = reply.send(state.ctx.broker.clone());
            }

            SupervisorMessage::WorkerCount { reply } => {
                let _ = reply.send(state.workers.len());
            }

            SupervisorMessage::Shutdown => {
                tracing::info!("Shutting down job supervisor");
                state.stop_all();
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                let reason = reason.unwrap_or_else(|| "stopped".to_string());
                self.child_exited(&myself, state, cell.get_id(), reason, false)
                    .await?;
            }
            SupervisionEvent::ActorFailed(cell, err) => {
                self.child_exited(&myself, state, cell.get_id(), err.to_string(), true)
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Running supervisor plus the broker it owns.
pub struct SupervisorHandle {
    pub supervisor: ActorRef<SupervisorMessage>,
    pub broker: BrokerHandle,
    pub join: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Run a recovery scan now and return how many jobs were enqueued.
    pub async fn recover(&self) -> Result<usize, MaintenanceError> {
        self.call(|reply| SupervisorMessage::Recover { reply: Some(reply) })
            .await
    }

    pub async fn sweep_stale(&self, older_than: Duration) -> Result<Vec<JobId>, MaintenanceError> {
        self.call(|reply| SupervisorMessage::SweepStale { older_than, reply })
            .await
    }

    pub async fn worker_count(&self) -> Result<usize, MaintenanceError> {
        self.call(|reply| SupervisorMessage::WorkerCount { reply })
            .await
    }

    /// Stop every worker and the broker, then wait for the supervisor.
    pub async fn shutdown(self) {
        let _ = self.supervisor.send_message(SupervisorMessage::Shutdown);
        if let Err(e) = self.join.await {
            tracing::warn!("Supervisor task ended abnormally: {}", e);
        }
    }

    async fn call<T: Send + 'static>(
        &self,
        build: impl FnOnce(ractor::RpcReplyPort<T>) -> SupervisorMessage,
    ) -> Result<T, MaintenanceError> {
        match ractor::rpc::call(&self.supervisor, build, Some(Duration::from_secs(60))).await {
            Ok(CallResult::Success(value)) => Ok(value),
            Ok(CallResult::Timeout) => Err(QueueError::Timeout.into()),
            Ok(CallResult::SenderError) => {
                Err(QueueError::Unavailable("supervisor dropped the reply".into()).into())
            }
            Err(e) => Err(QueueError::Unavailable(e.to_string()).into()),
        }
    }
}

/// Start the supervisor with its broker and workers.
pub async fn start_supervisor(
    args: SupervisorArgs,
) -> Result<SupervisorHandle, ActorProcessingErr> {
    let (supervisor, join) = Actor::spawn(None, Supervisor, args).await?;

    let broker = match ractor::rpc::call(
        &supervisor,
        |reply| SupervisorMessage::GetBroker { reply },
        Some(Duration::from_secs(10)),
    )
    .await
    {
        Ok(CallResult::Success(broker)) => broker,
        _ => {
            supervisor.stop(None);
            return Err(ActorProcessingErr::from(
                "supervisor did not hand out its broker",
            ));
        }
    };

    Ok(SupervisorHandle {
        supervisor,
        broker,
        join,
    })
}
