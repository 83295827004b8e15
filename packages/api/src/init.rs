//! Startup of the job system.

use std::sync::Arc;
use std::time::Duration;

use actors::{
    CommandExecutor, Executor, JobServices, KindRegistry, SupervisorArgs, SupervisorHandle,
    start_supervisor,
};
use chrono::Utc;
use db::{DbError, JobStore, RateCounterRepository, ResultCache};
use jobs_core::JobEvent;
use storage::{ResultStorage, StorageError};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::admin::Admin;
use crate::config::AppConfig;
use crate::gateway::SubmissionGateway;
use crate::rate_limit::RateLimiter;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum InitError {
    #[error("database: {0}")]
    Database(#[from] DbError),

    #[error("result storage: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to start workers: {0}")]
    Supervisor(String),
}

/// A connected job system: gateway and admin, plus workers when started.
pub struct JobSystem {
    gateway: SubmissionGateway,
    admin: Admin,
    limiter: Arc<RateLimiter>,
    events: broadcast::Sender<JobEvent>,
    supervisor: Option<SupervisorHandle>,
    purge_task: Option<JoinHandle<()>>,
}

struct Parts {
    kinds: Arc<KindRegistry>,
    jobs: JobStore,
    cache: ResultCache,
    counters: RateCounterRepository,
    storage: ResultStorage,
    limiter: Arc<RateLimiter>,
    events: broadcast::Sender<JobEvent>,
}

async fn open(config: &AppConfig) -> Result<Parts, InitError> {
    tracing::info!(
        "Connecting to {} (namespace {}, database {})",
        config.db.endpoint,
        config.db.namespace,
        config.db.database
    );
    let db = db::init(&config.db).await?;
    let storage = ResultStorage::new(config.storage.clone()).await?;
    tracing::info!("Result storage: {}", storage.kind_str());

    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let counters = RateCounterRepository::new(db.clone());
    let limiter = RateLimiter::new(&config.rate_limit, Arc::new(counters.clone()))
        .with_events(events.clone());
    if !limiter.is_enabled() {
        tracing::info!("Rate limiting disabled");
    }

    Ok(Parts {
        kinds: Arc::new(config.kind_registry()),
        jobs: JobStore::new(db.clone()),
        cache: ResultCache::new(db, config.cache),
        counters,
        storage,
        limiter: Arc::new(limiter),
        events,
    })
}

impl JobSystem {
    /// Connect without running workers. Submitted jobs wait in the store
    /// until a worker process recovers them.
    pub async fn connect(config: &AppConfig) -> Result<Self, InitError> {
        let parts = open(config).await?;
        Ok(Self::assemble(parts, config, None))
    }

    /// Connect and start the broker, worker pools and maintenance.
    pub async fn start(config: &AppConfig) -> Result<Self, InitError> {
        let executor = {
            let kinds = Arc::new(config.kind_registry());
            Arc::new(CommandExecutor::new(kinds))
        };
        Self::start_with_executor(config, executor).await
    }

    pub async fn start_with_executor(
        config: &AppConfig,
        executor: Arc<dyn Executor>,
    ) -> Result<Self, InitError> {
        tracing::info!("Initializing job system...");
        let parts = open(config).await?;

        let services = JobServices {
            jobs: parts.jobs.clone(),
            cache: parts.cache.clone(),
            storage: parts.storage.clone(),
            executor,
            events: parts.events.clone(),
        };
        let supervisor = start_supervisor(SupervisorArgs {
            services,
            settings: config.workers.settings(),
            pools: config.workers.pools.clone(),
            maintenance: config.workers.maintenance(),
        })
        .await
        .map_err(|e| InitError::Supervisor(e.to_string()))?;

        let purge_task = spawn_counter_purge(
            parts.limiter.clone(),
            config.workers.maintenance().tick_interval,
        );

        let mut system = Self::assemble(parts, config, Some(supervisor));
        system.purge_task = Some(purge_task);
        tracing::info!("Job system initialized");
        Ok(system)
    }

    fn assemble(parts: Parts, config: &AppConfig, supervisor: Option<SupervisorHandle>) -> Self {
        let mut gateway = SubmissionGateway::new(
            parts.kinds,
            parts.jobs.clone(),
            parts.cache.clone(),
            parts.storage,
            parts.limiter.clone(),
            parts.events.clone(),
        )
        .with_data_version(config.data_version.clone());
        let mut admin = Admin::new(parts.jobs, parts.cache, parts.counters);

        if let Some(handle) = &supervisor {
            gateway = gateway.with_broker(handle.broker.clone());
            admin = admin.with_broker(handle.broker.clone());
        }

        Self {
            gateway,
            admin,
            limiter: parts.limiter,
            events: parts.events,
            supervisor,
            purge_task: None,
        }
    }

    pub fn gateway(&self) -> &SubmissionGateway {
        &self.gateway
    }

    pub fn admin(&self) -> &Admin {
        &self.admin
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn supervisor(&self) -> Option<&SupervisorHandle> {
        self.supervisor.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Stop workers and background tasks.
    pub async fn shutdown(self) {
        if let Some(task) = self.purge_task {
            task.abort();
        }
        if let Some(supervisor) = self.supervisor {
            tracing::info!("Stopping workers...");
            supervisor.shutdown().await;
        }
    }
}

fn spawn_counter_purge(limiter: Arc<RateLimiter>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            if let Err(e) = limiter.purge_expired(Utc::now()).await {
                tracing::warn!("Failed to purge rate limit counters: {}", e);
            }
        }
    })
}
