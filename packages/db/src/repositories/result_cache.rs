//! Result cache: fingerprint to stored output, written once.

use chrono::{DateTime, Utc};
use jobs_core::{CacheEntry, CachePolicy, Fingerprint, JobKind};
use serde::Deserialize;
use surrealdb::sql::Thing;

use crate::{Database, DbError};

#[derive(Debug, Deserialize)]
struct CacheRecord {
    #[serde(default)]
    #[allow(dead_code)]
    id: Option<Thing>,
    #[serde(flatten)]
    entry: CacheEntry,
}

/// Repository for result cache entries.
///
/// Entries are only ever created, never overwritten: the first completed
/// job for a fingerprint wins. Expired entries read as misses even before
/// [`ResultCache::evict`] removes them.
#[derive(Clone)]
pub struct ResultCache {
    db: Database,
    policy: CachePolicy,
}

impl ResultCache {
    pub fn new(db: Database, policy: CachePolicy) -> Self {
        Self { db, policy }
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// Look up a fresh entry for `kind` and `fingerprint`.
    pub async fn get(
        &self,
        kind: &JobKind,
        fingerprint: &Fingerprint,
    ) -> Result<Option<CacheEntry>, DbError> {
        let record: Option<CacheRecord> = self
            .db
            .select(("result_cache", fingerprint.to_string()))
            .await?;

        Ok(record.map(|r| r.entry).filter(|entry| {
            if &entry.kind != kind {
                return false;
            }
            let fresh = self.policy.is_fresh(entry, Utc::now());
            if !fresh {
                tracing::debug!("Cache entry for {} has expired", fingerprint);
            }
            fresh
        }))
    }

    /// Store an entry unless one already exists for its fingerprint.
    ///
    /// Returns `true` when this call created the entry.
    pub async fn put(&self, entry: &CacheEntry) -> Result<bool, DbError> {
        let created = self
            .db
            .query("CREATE type::thing('result_cache', $fingerprint) CONTENT $entry")
            .bind(("fingerprint", entry.fingerprint.to_string()))
            .bind(("entry", entry.clone()))
            .await?
            .check();

        match created {
            Ok(_) => Ok(true),
            Err(err) => {
                let existing: Option<CacheRecord> = self
                    .db
                    .select(("result_cache", entry.fingerprint.to_string()))
                    .await?;
                if existing.is_some() {
                    tracing::debug!("Cache entry for {} already present", entry.fingerprint);
                    Ok(false)
                } else {
                    Err(err.into())
                }
            }
        }
    }

    /// Remove entries the policy no longer admits. Returns how many were
    /// removed.
    pub async fn evict(&self, now: DateTime<Utc>) -> Result<usize, DbError> {
        let mut entries = self.entries().await?;

        let expired: Vec<Fingerprint> = match self.policy {
            CachePolicy::Permanent => Vec::new(),
            CachePolicy::MaxAge { .. } => entries
                .into_iter()
                .filter(|entry| !self.policy.is_fresh(entry, now))
                .map(|entry| entry.fingerprint)
                .collect(),
            CachePolicy::MaxEntries { max_entries } => {
                if entries.len() <= max_entries {
                    Vec::new()
                } else {
                    // Newest first; everything past the limit goes.
                    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                    entries
                        .split_off(max_entries)
                        .into_iter()
                        .map(|entry| entry.fingerprint)
                        .collect()
                }
            }
        };

        for fingerprint in &expired {
            self.remove(fingerprint).await?;
        }

        Ok(expired.len())
    }

    /// Remove a single entry.
    pub async fn remove(&self, fingerprint: &Fingerprint) -> Result<(), DbError> {
        let _: Option<CacheRecord> = self
            .db
            .delete(("result_cache", fingerprint.to_string()))
            .await?;
        Ok(())
    }

    /// All entries, regardless of freshness.
    pub async fn entries(&self) -> Result<Vec<CacheEntry>, DbError> {
        let records: Vec<CacheRecord> = self.db.select("result_cache").await?;
        Ok(records.into_iter().map(|r| r.entry).collect())
    }

    /// Remove every entry.
    pub async fn clear(&self) -> Result<(), DbError> {
        self.db.query("DELETE result_cache").await?.check()?;
        Ok(())
    }
}
