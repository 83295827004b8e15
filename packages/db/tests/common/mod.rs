#![allow(dead_code)]

use jobs_core::{Fingerprint, Job, JobKind, QueueName};
use serde_json::Value;

use db::{Database, DbConfig, DbError};

/// Fresh in-memory database with the schema applied.
pub async fn setup_db() -> Result<Database, DbError> {
    db::init(&DbConfig::memory()).await
}

pub fn job_for(kind: &str, params: Value) -> Job {
    let kind = JobKind::from(kind);
    let fingerprint = Fingerprint::compute(&kind, &params, None);
    Job::new(kind, QueueName::default_queue(), params, fingerprint)
}
