//! Database schema definitions using SurrealQL.
//!
//! Tables are schemaless so nested job parameters and errors round-trip
//! unchanged; only the fields queries filter on are typed and indexed.

use crate::{Database, DbError};

/// Initialize the database schema.
///
/// This creates all necessary tables, fields, and indexes.
pub async fn init_schema(db: &Database) -> Result<(), DbError> {
    tracing::info!("Initializing database schema...");

    db.query(JOB_SCHEMA).await?.check()?;
    db.query(INFLIGHT_SCHEMA).await?.check()?;
    db.query(RESULT_CACHE_SCHEMA).await?.check()?;
    db.query(RATE_LIMIT_SCHEMA).await?.check()?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Job table schema.
const JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job SCHEMALESS;

DEFINE FIELD IF NOT EXISTS job_id ON job TYPE string;
DEFINE FIELD IF NOT EXISTS status ON job TYPE string
    ASSERT $value INSIDE ["queued", "running", "completed", "failed"];
DEFINE FIELD IF NOT EXISTS cancel_requested ON job TYPE bool DEFAULT false;

DEFINE INDEX IF NOT EXISTS job_status ON job FIELDS status;
DEFINE INDEX IF NOT EXISTS job_kind ON job FIELDS kind;
DEFINE INDEX IF NOT EXISTS job_fingerprint ON job FIELDS fingerprint;
"#;

/// In-flight markers: one record per fingerprint with a queued or running
/// job. The record key is the fingerprint, so creating a second marker for
/// the same input fails.
const INFLIGHT_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS inflight SCHEMALESS;

DEFINE FIELD IF NOT EXISTS job_id ON inflight TYPE string;
"#;

/// Result cache, keyed by fingerprint.
const RESULT_CACHE_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS result_cache SCHEMALESS;

DEFINE FIELD IF NOT EXISTS fingerprint ON result_cache TYPE string;
DEFINE INDEX IF NOT EXISTS result_cache_kind ON result_cache FIELDS kind;
"#;

/// Rate limit counters, keyed by `[identity, window_start]`.
const RATE_LIMIT_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS rate_limit SCHEMALESS;

DEFINE FIELD IF NOT EXISTS identity ON rate_limit TYPE string;
DEFINE FIELD IF NOT EXISTS window_start ON rate_limit TYPE int;
DEFINE INDEX IF NOT EXISTS rate_limit_window ON rate_limit FIELDS window_start;
"#;
