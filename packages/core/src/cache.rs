//! Result cache domain types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{Fingerprint, JobId, JobKind, ResultRef};

/// Pointer from a fingerprint to the stored output of the job that first
/// completed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub kind: JobKind,
    pub fingerprint: Fingerprint,
    pub result_ref: ResultRef,
    /// The job whose output this entry points at.
    pub job_id: JobId,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(kind: JobKind, fingerprint: Fingerprint, result_ref: ResultRef, job_id: JobId) -> Self {
        Self {
            kind,
            fingerprint,
            result_ref,
            job_id,
            created_at: Utc::now(),
        }
    }
}

/// Expiry and eviction policy for cache entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum CachePolicy {
    /// Entries live until an administrative reset.
    #[default]
    Permanent,
    /// Entries older than `max_age_secs` are misses and get evicted.
    MaxAge { max_age_secs: u64 },
    /// Only the newest `max_entries` entries are kept.
    MaxEntries { max_entries: usize },
}

impl CachePolicy {
    /// Whether `entry` may still be served at `now`.
    pub fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        match self.cutoff(now) {
            Some(cutoff) => entry.created_at >= cutoff,
            None => true,
        }
    }

    /// Entries created before the returned instant are expired.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            CachePolicy::MaxAge { max_age_secs } => {
                let age = i64::try_from(*max_age_secs)
                    .ok()
                    .and_then(Duration::try_seconds);
                Some(
                    age.and_then(|age| now.checked_sub_signed(age))
                        .unwrap_or(DateTime::<Utc>::MIN_UTC),
                )
            }
            _ => None,
        }
    }

    pub fn max_entries(&self) -> Option<usize> {
        match self {
            CachePolicy::MaxEntries { max_entries } => Some(*max_entries),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(age_secs: i64) -> CacheEntry {
        let kind = JobKind::from("diamond");
        let mut entry = CacheEntry::new(
            kind.clone(),
            Fingerprint::compute(&kind, &json!({}), None),
            ResultRef::new("results/diamond/a.json"),
            JobId::new(),
        );
        entry.created_at = Utc::now() - Duration::seconds(age_secs);
        entry
    }

    #[test]
    fn permanent_is_always_fresh() {
        assert!(CachePolicy::Permanent.is_fresh(&entry(10_000_000), Utc::now()));
    }

    #[test]
    fn max_age_expires_old_entries() {
        let policy = CachePolicy::MaxAge { max_age_secs: 60 };
        assert!(policy.is_fresh(&entry(10), Utc::now()));
        assert!(!policy.is_fresh(&entry(120), Utc::now()));
    }

    #[test]
    fn policy_deserializes_from_tag() {
        let policy: CachePolicy =
            serde_json::from_value(json!({"policy": "max_entries", "max_entries": 100})).unwrap();
        assert_eq!(policy.max_entries(), Some(100));
        assert!(policy.cutoff(Utc::now()).is_none());
    }
}
