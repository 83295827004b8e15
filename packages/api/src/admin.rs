//! Administrative reset of one deployment instance.

use actors::BrokerHandle;
use db::{JobStore, RateCounterRepository, ResultCache};
use jobs_core::{ErrorKind, JobError, JobId};
use serde::Serialize;

use crate::error::GatewayError;

/// What a reset removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    /// Queue entries dropped from the local broker, zero without one.
    pub purged_entries: usize,
    /// Queued jobs failed as expired.
    pub expired_jobs: Vec<JobId>,
}

/// Clears queue, cache and rate-limit state of the connected namespace.
///
/// Running jobs are left alone; their workers finish them normally. Safe to
/// run repeatedly and while workers are active.
///
/// Without a broker handle, as from a separate admin process, entries held
/// by the brokers of running worker processes are not purged. Those workers
/// drop them on delivery, since an expired job can no longer be claimed.
#[derive(Clone)]
pub struct Admin {
    jobs: JobStore,
    cache: ResultCache,
    counters: RateCounterRepository,
    broker: Option<BrokerHandle>,
}

impl Admin {
    pub fn new(jobs: JobStore, cache: ResultCache, counters: RateCounterRepository) -> Self {
        Self {
            jobs,
            cache,
            counters,
            broker: None,
        }
    }

    pub fn with_broker(mut self, broker: BrokerHandle) -> Self {
        self.broker = Some(broker);
        self
    }

    pub async fn reset(&self) -> Result<ResetReport, GatewayError> {
        // Expire before purging so the recovery scan cannot re-enqueue them.
        let expired_jobs = self
            .jobs
            .expire_queued(&JobError::new(ErrorKind::Expired, "cleared by reset"))
            .await?;

        let purged_entries = match &self.broker {
            Some(broker) => broker.purge().await?,
            None => 0,
        };

        self.cache.clear().await?;
        self.counters.clear().await?;
        self.jobs.clear_inflight().await?;

        tracing::info!(
            "Reset cleared {} queue entries and expired {} queued jobs",
            purged_entries,
            expired_jobs.len()
        );

        Ok(ResetReport {
            purged_entries,
            expired_jobs,
        })
    }
}
