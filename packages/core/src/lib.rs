//! Core domain types for the asynchronous job subsystem.
//!
//! This crate contains shared types used across all packages:
//! - Job, JobStatus and JobError for analysis runs
//! - Queue entries and deliveries for the broker
//! - Input fingerprints and parameter schemas for deduplication
//! - Cache entries and expiry policies
//! - Events for observability

mod cache;
mod events;
mod fingerprint;
mod job;
mod queue;
mod schema;

pub use cache::{CacheEntry, CachePolicy};
pub use events::JobEvent;
pub use fingerprint::{Fingerprint, canonical_json};
pub use job::{
    DEFAULT_TIMEOUT_SECS, ErrorKind, Job, JobError, JobId, JobKind, JobStatus, ResultRef,
    TransitionError,
};
pub use queue::{Delivery, DeliveryTag, QueueEntry, QueueName, QueueStats};
pub use schema::{FieldSpec, FieldType, ParamSchema, ValidationError, normalize_seeds};
