//! Repository implementations for database operations.

mod job_store;
mod rate_counter;
mod result_cache;

pub use job_store::{CreateOutcome, JobFilter, JobStore};
pub use rate_counter::RateCounterRepository;
pub use result_cache::ResultCache;
