//! Actor system for the job subsystem.
//!
//! This crate provides the Ractor-based broker, worker pool and supervisor
//! that run submitted analyses.
//!
//! # Architecture
//!
//! - `Supervisor` - Top-level actor that owns the broker and restarts workers
//! - `Broker` - Holds the named FIFO queues and tracks unacknowledged deliveries
//! - `Worker` - Claims one job at a time and runs it through an [`Executor`]
//!
//! # Usage
//!
//! ```ignore
//! use actors::{start_supervisor, SupervisorArgs, WorkerPool};
//!
//! let handle = start_supervisor(SupervisorArgs {
//!     services,
//!     settings: WorkerSettings::default(),
//!     pools: vec![WorkerPool::new(vec![QueueName::default_queue()], 4)],
//!     maintenance: MaintenanceSettings::default(),
//! })
//! .await?;
//!
//! handle.broker.enqueue(QueueEntry::new(job.id, job.queue.clone())).await?;
//! ```

mod broker;
mod executor;
mod kinds;
mod messages;
mod supervisor;
mod worker;

pub use broker::{Broker, BrokerHandle, QueueError};
pub use executor::{
    CommandExecutor, ExecutionError, ExecutionFuture, ExecutionOutput, ExecutionRequest,
    ExecutionResult, Executor, FnExecutor,
};
pub use kinds::{CommandTemplate, KindDescriptor, KindRegistry, OutputFormat};
pub use messages::{BrokerMessage, SupervisorMessage, WorkerMessage};
pub use supervisor::{
    MaintenanceError, MaintenanceSettings, Supervisor, SupervisorArgs, SupervisorHandle,
    WorkerPool, recover_queued, start_supervisor, sweep_stale,
};
pub use worker::{JobServices, Worker, WorkerArgs, WorkerContext, WorkerSettings};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort};
