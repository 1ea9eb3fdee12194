//! Time-based retention

use crate::fingerprint::Fingerprint;
use crate::index::{CacheEntry, CacheIndex};
use crate::store::ArtifactStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Removes entries older than a horizon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    horizon: Option<Duration>,
}

/// Summary of what retention would remove, without removing anything
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    /// Configured horizon in whole days, if retention is enabled
    pub retention_days: Option<i64>,
    /// Entries created before this instant are expired
    pub cutoff: Option<DateTime<Utc>>,
    /// Number of indexed entries
    pub total_entries: usize,
    /// Entries retention would remove
    pub expired_entries: usize,
    /// Entries retention would keep
    pub active_entries: usize,
    /// Size of all entries
    pub total_size_bytes: u64,
    /// Size of expired entries
    pub expired_size_bytes: u64,
    /// Size of active entries
    pub active_size_bytes: u64,
}

impl RetentionPolicy {
    /// Policy with an explicit horizon; `None` disables retention
    #[must_use]
    pub fn new(horizon: Option<Duration>) -> Self {
        Self { horizon }
    }

    /// Policy from a day count; `None` or `0` disables retention
    #[must_use]
    pub fn from_days(days: Option<u64>) -> Self {
        let horizon = days
            .filter(|d| *d > 0)
            .and_then(|d| i64::try_from(d).ok())
            .and_then(Duration::try_days);
        Self { horizon }
    }

    /// The configured horizon
    #[must_use]
    pub fn horizon(&self) -> Option<Duration> {
        self.horizon
    }

    /// Whether `entry` is past the horizon at `now`.
    ///
    /// Malformed creation times count as expired.
    #[must_use]
    pub fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        self.horizon
            .is_some_and(|horizon| older_than(entry, now, horizon))
    }

    /// Remove every expired entry from index and store.
    ///
    /// Returns the removed fingerprints. Entries whose directory could not be
    /// deleted stay indexed and are retried on the next pass.
    pub fn apply(
        &self,
        index: &mut CacheIndex,
        store: &ArtifactStore,
        now: DateTime<Utc>,
    ) -> Vec<Fingerprint> {
        let Some(horizon) = self.horizon else {
            return Vec::new();
        };
        let removed = expire_older_than(index, store, now, horizon);
        if !removed.is_empty() {
            info!(
                removed = removed.len(),
                horizon_days = horizon.num_days(),
                "Retention policy removed expired cache entries"
            );
        }
        removed
    }

    /// What [`apply`](Self::apply) would do at `now`
    #[must_use]
    pub fn report(&self, index: &CacheIndex, now: DateTime<Utc>) -> RetentionReport {
        let mut report = RetentionReport {
            retention_days: self.horizon.map(|h| h.num_days()),
            cutoff: self.horizon.and_then(|h| now.checked_sub_signed(h)),
            total_entries: 0,
            expired_entries: 0,
            active_entries: 0,
            total_size_bytes: 0,
            expired_size_bytes: 0,
            active_size_bytes: 0,
        };
        for entry in index.entries() {
            report.total_entries += 1;
            report.total_size_bytes += entry.size_bytes;
            if self.is_expired(entry, now) {
                report.expired_entries += 1;
                report.expired_size_bytes += entry.size_bytes;
            } else {
                report.active_entries += 1;
                report.active_size_bytes += entry.size_bytes;
            }
        }
        report
    }
}

fn older_than(entry: &CacheEntry, now: DateTime<Utc>, horizon: Duration) -> bool {
    entry.created_at.age(now).is_none_or(|age| age > horizon)
}

/// Remove entries whose age exceeds `horizon`; shared by retention and
/// age-bounded clears.
pub(crate) fn expire_older_than(
    index: &mut CacheIndex,
    store: &ArtifactStore,
    now: DateTime<Utc>,
    horizon: Duration,
) -> Vec<Fingerprint> {
    let expired: Vec<Fingerprint> = index
        .entries()
        .filter(|e| older_than(e, now, horizon))
        .map(|e| e.fingerprint.clone())
        .collect();

    let mut removed = Vec::with_capacity(expired.len());
    for fingerprint in expired {
        if index.purge(&fingerprint, store) {
            debug!(fingerprint = %fingerprint.short(), "Removed expired cache entry");
            removed.push(fingerprint);
        }
    }
    removed
}
