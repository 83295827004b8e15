//! Rate limit counters.

use serde::Deserialize;

use crate::{Database, DbError};

/// Attempts for a counter increment that loses a write conflict.
const INCREMENT_ATTEMPTS: usize = 5;

#[derive(Debug, Deserialize)]
struct CounterRecord {
    #[serde(default)]
    count: u64,
}

/// Repository for per-identity request counters.
///
/// Counters are keyed by identity and the start of their window, so a new
/// window starts from zero without any reset step.
#[derive(Clone)]
pub struct RateCounterRepository {
    db: Database,
}

impl RateCounterRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Atomically add one to the counter and return the new count.
    pub async fn increment(&self, identity: &str, window_start: i64) -> Result<u64, DbError> {
        let mut last_error = None;

        for attempt in 1..=INCREMENT_ATTEMPTS {
            let result = self
                .db
                .query(
                    r#"
                    UPSERT type::thing('rate_limit', [$identity, $window_start])
                    SET identity = $identity, window_start = $window_start, count += 1
                    RETURN AFTER
                    "#,
                )
                .bind(("identity", identity.to_string()))
                .bind(("window_start", window_start))
                .await
                .and_then(|response| response.check());

            match result {
                Ok(mut response) => {
                    let records: Vec<CounterRecord> = response.take(0)?;
                    return records
                        .into_iter()
                        .next()
                        .map(|r| r.count)
                        .ok_or_else(|| DbError::Query("Counter upsert returned nothing".into()));
                }
                Err(err) => {
                    tracing::debug!(
                        "Rate counter increment for {} failed (attempt {}): {}",
                        identity,
                        attempt,
                        err
                    );
                    last_error = Some(err);
                    tokio::task::yield_now().await;
                }
            }
        }

        Err(last_error
            .map(DbError::from)
            .unwrap_or_else(|| DbError::Query("Counter increment failed".into())))
    }

    /// Current count, zero when the window has no counter yet.
    pub async fn get(&self, identity: &str, window_start: i64) -> Result<u64, DbError> {
        let mut response = self
            .db
            .query("SELECT count FROM type::thing('rate_limit', [$identity, $window_start])")
            .bind(("identity", identity.to_string()))
            .bind(("window_start", window_start))
            .await?
            .check()?;

        let records: Vec<CounterRecord> = response.take(0)?;
        Ok(records.into_iter().next().map(|r| r.count).unwrap_or(0))
    }

    /// Drop counters for windows that started before `window_start`.
    pub async fn purge_before(&self, window_start: i64) -> Result<(), DbError> {
        self.db
            .query("DELETE rate_limit WHERE window_start < $window_start")
            .bind(("window_start", window_start))
            .await?
            .check()?;
        Ok(())
    }

    /// Remove every counter.
    pub async fn clear(&self) -> Result<(), DbError> {
        self.db.query("DELETE rate_limit").await?.check()?;
        Ok(())
    }
}
