//! Message types for actor communication.

use std::time::Duration;

use jobs_core::{Delivery, DeliveryTag, JobId, QueueEntry, QueueName, QueueStats};
use ractor::RpcReplyPort;

use crate::broker::BrokerHandle;

/// Messages for the queue broker.
#[derive(Debug)]
pub enum BrokerMessage {
    /// Append an entry to its queue. Replies false when the job is already
    /// pending or delivered.
    Enqueue {
        entry: QueueEntry,
        reply: RpcReplyPort<bool>,
    },

    /// Take the oldest entry from the first non-empty queue in `queues`,
    /// waiting up to `timeout` for one to arrive.
    Dequeue {
        worker_id: String,
        queues: Vec<QueueName>,
        timeout: Duration,
        reply: RpcReplyPort<Option<Delivery>>,
    },

    /// A parked dequeue ran out of time.
    WaiterExpired { waiter_id: u64 },

    /// The delivery was handled and can be forgotten.
    Ack { tag: DeliveryTag },

    /// The delivery was not handled and goes back to the head of its queue.
    Nack { tag: DeliveryTag },

    /// Requeue every delivery held by a worker that went away.
    ReleaseWorker { worker_id: String },

    /// Whether a job is pending or delivered.
    Contains {
        job_id: JobId,
        reply: RpcReplyPort<bool>,
    },

    /// Counters for every known queue.
    Stats { reply: RpcReplyPort<Vec<QueueStats>> },

    /// Drop every pending entry. Replies with the number removed.
    Purge { reply: RpcReplyPort<usize> },
}

/// Messages for worker actors.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Block on the broker for the next delivery and run it.
    Poll,

    /// Stop after the current job.
    Shutdown,
}

/// Messages for the supervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// Periodic maintenance.
    Tick,

    /// Enqueue every queued job the broker does not hold.
    Recover { reply: Option<RpcReplyPort<usize>> },

    /// Fail running jobs started before `older_than` ago.
    SweepStale {
        older_than: Duration,
        reply: RpcReplyPort<Vec<JobId>>,
    },

    /// Handle to the broker owned by this supervisor.
    GetBroker { reply: RpcReplyPort<BrokerHandle> },

    /// Number of live workers.
    WorkerCount { reply: RpcReplyPort<usize> },

    /// Stop every worker, then the supervisor.
    Shutdown,
}
