//! Queue domain types for the broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::JobId;

/// Name of a broker queue. Workers subscribe to one or more names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueName(String);

impl QueueName {
    pub const DEFAULT: &'static str = "default";
    pub const HEAVY: &'static str = "heavy";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The queue ordinary analyses run on.
    pub fn default_queue() -> Self {
        Self::new(Self::DEFAULT)
    }

    /// The queue for long-running Steiner-tree style analyses.
    pub fn heavy() -> Self {
        Self::new(Self::HEAVY)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for QueueName {
    fn default() -> Self {
        Self::default_queue()
    }
}

impl From<&str> for QueueName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Envelope placed on a queue. It carries only what is needed to find the
/// job again, so it can always be rebuilt from the job store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub queue: QueueName,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(job_id: JobId, queue: QueueName) -> Self {
        Self {
            job_id,
            queue,
            enqueued_at: Utc::now(),
        }
    }
}

/// Broker-assigned handle for one delivery of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryTag(pub u64);

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An entry handed to a worker. It stays owned by the broker until the
/// worker acknowledges the tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub entry: QueueEntry,
    /// 1 on first delivery, incremented on each redelivery.
    pub attempt: u32,
}

/// Point-in-time counters for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueStats {
    pub queue: String,
    /// Entries waiting for a worker.
    pub pending: u64,
    /// Entries delivered but not yet acknowledged.
    pub in_flight: u64,
    /// Workers currently blocked on this queue.
    pub waiting_workers: u64,
}

impl QueueStats {
    /// Total entries the broker still owns.
    pub fn active(&self) -> u64 {
        self.pending + self.in_flight
    }
}
