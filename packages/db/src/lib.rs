//! SurrealDB integration for the job subsystem.
//!
//! This crate provides database connectivity and repositories for the job
//! store, the result cache and rate limit counters.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod connection;
mod schema;
pub mod repositories;

pub use connection::{Database, DbConfig, DbCredentials, DbError, connect};
pub use repositories::{CreateOutcome, JobFilter, JobStore, RateCounterRepository, ResultCache};
pub use schema::init_schema;

/// Connect with the given configuration and make sure the schema exists.
///
/// This should be called once at process startup; the returned handle is
/// cloned into every component that needs it.
pub async fn init(config: &DbConfig) -> Result<Database, DbError> {
    let db = connect(config).await?;
    init_schema(&db).await?;
    Ok(db)
}
