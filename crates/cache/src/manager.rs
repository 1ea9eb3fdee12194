//! The cache façade used by build orchestration
//!
//! [`CacheManager`] owns one cache root: its artifact store, index, stats and
//! the two size-bounding policies. Hit/miss decisions come from the artifact
//! directories; the index and stats are a best-effort layer that is reconciled
//! against them, so several build processes may share one root without
//! locking.

use crate::Result;
use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::eviction::EvictionPolicy;
use crate::fingerprint::Fingerprint;
use crate::index::{CacheEntry, CacheIndex, RecordedTime};
use crate::retention::{RetentionPolicy, RetentionReport, expire_older_than};
use crate::stats::{StatsSnapshot, StatsTracker};
use crate::store::{ArtifactStore, Materialized};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Staging leftovers older than this are assumed abandoned
const STALE_STAGING_AGE: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

/// Facts about the build that produced an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildMetadata {
    /// Wall time the build took
    pub build_duration: std::time::Duration,
    /// Whether the build succeeded
    pub success: bool,
}

impl BuildMetadata {
    /// Metadata for a build
    #[must_use]
    pub fn new(build_duration: std::time::Duration, success: bool) -> Self {
        Self {
            build_duration,
            success,
        }
    }
}

impl Default for BuildMetadata {
    fn default() -> Self {
        Self::new(std::time::Duration::ZERO, true)
    }
}

/// Outcome of a successful store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreReport {
    /// Where the artifacts now live
    pub artifact_path: PathBuf,
    /// Size of the stored tree
    pub size_bytes: u64,
    /// Entries removed by the retention pass that followed
    pub expired: Vec<Fingerprint>,
    /// Entries removed by the eviction pass that followed
    pub evicted: Vec<Fingerprint>,
}

/// A local build-artifact cache rooted at one directory
#[derive(Debug)]
pub struct CacheManager {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    store: ArtifactStore,
    index: CacheIndex,
    stats: StatsTracker,
    retention: RetentionPolicy,
    eviction: EvictionPolicy,
}

impl CacheManager {
    /// Open (creating if needed) the cache described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or no cache root is usable.
    pub fn open(config: CacheConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// [`open`](Self::open) with an explicit time source.
    ///
    /// Loads index and stats, sweeps abandoned staging directories,
    /// reconciles the index with the artifact directories and applies
    /// retention.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or no cache root is usable.
    pub fn open_with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let root = config.resolve_root()?;
        let store = ArtifactStore::new(&root);
        store.sweep_staging(STALE_STAGING_AGE);

        let mut manager = Self {
            index: CacheIndex::load(&root),
            stats: StatsTracker::load(&root),
            retention: config.retention_policy(),
            eviction: config.eviction_policy(),
            config,
            clock,
            store,
        };

        let reconciled = manager.reconcile();
        let now = manager.clock.now();
        let expired = manager
            .retention
            .apply(&mut manager.index, &manager.store, now);
        if reconciled || !expired.is_empty() {
            manager.persist_index();
        }

        info!(
            root = %root.display(),
            entries = manager.index.len(),
            size_bytes = manager.index.total_size_bytes(),
            "Opened build cache"
        );
        Ok(manager)
    }

    /// The cache root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        self.store.root()
    }

    /// The settings this cache was opened with
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Index record for a fingerprint, without counting a lookup
    #[must_use]
    pub fn entry(&self, fingerprint: &Fingerprint) -> Option<&CacheEntry> {
        self.index.get(fingerprint)
    }

    /// Look up cached artifacts.
    ///
    /// The artifact directory decides: if it exists this is a hit (an
    /// unindexed directory is adopted), otherwise a miss (a dangling index
    /// record is dropped). Never fails.
    pub fn lookup(&mut self, fingerprint: &Fingerprint) -> Option<PathBuf> {
        let now = self.clock.now();
        match self.store.retrieve(fingerprint) {
            Some(path) => {
                if !self.index.touch(fingerprint, now) {
                    self.adopt(fingerprint, now);
                }
                self.stats.record_hit();
                info!(fingerprint = %fingerprint.short(), "Build cache hit");
                self.persist();
                Some(path)
            }
            None => {
                if self.index.remove(fingerprint).is_some() {
                    warn!(
                        fingerprint = %fingerprint.short(),
                        "Indexed artifacts are missing on disk; dropping entry"
                    );
                }
                self.stats.record_miss();
                info!(fingerprint = %fingerprint.short(), "Build cache miss");
                self.persist();
                None
            }
        }
    }

    /// Whether the caller may skip the build: `false` when a rebuild is
    /// forced, otherwise whether [`lookup`](Self::lookup) hits.
    pub fn should_reuse(&mut self, fingerprint: &Fingerprint, force_rebuild: bool) -> bool {
        if force_rebuild {
            info!(fingerprint = %fingerprint.short(), "Rebuild forced, ignoring cache");
            return false;
        }
        self.lookup(fingerprint).is_some()
    }

    /// Store a build's output directory; failures are logged and reported
    /// as `false` so they never abort the build.
    pub fn store(
        &mut self,
        fingerprint: &Fingerprint,
        artifacts: &Path,
        metadata: BuildMetadata,
    ) -> bool {
        match self.try_store(fingerprint, artifacts, metadata) {
            Ok(_) => true,
            Err(e) => {
                warn!(fingerprint = %fingerprint.short(), "Failed to cache build artifacts: {e}");
                false
            }
        }
    }

    /// Store a build's output directory.
    ///
    /// On success the entry is indexed, the store is counted, and retention
    /// then eviction run. The new entry is never evicted by its own store.
    ///
    /// # Errors
    ///
    /// Returns an error if the artifacts cannot be copied into the cache; the
    /// index and the fingerprint's directory are then left as they were.
    pub fn try_store(
        &mut self,
        fingerprint: &Fingerprint,
        artifacts: &Path,
        metadata: BuildMetadata,
    ) -> Result<StoreReport> {
        // Sized during the copy, so nothing can fail between the rename and
        // the index update
        let Materialized {
            path: artifact_path,
            size_bytes,
        } = self.store.materialize(fingerprint, artifacts)?;
        let now = self.clock.now();

        self.index.put(CacheEntry {
            fingerprint: fingerprint.clone(),
            artifact_path: artifact_path.clone(),
            created_at: now.into(),
            last_accessed_at: now.into(),
            size_bytes,
            build_duration_ms: u64::try_from(metadata.build_duration.as_millis())
                .unwrap_or(u64::MAX),
            success: metadata.success,
        });
        self.stats.record_store(size_bytes);
        info!(
            fingerprint = %fingerprint.short(),
            size_bytes,
            success = metadata.success,
            "Stored build artifacts"
        );

        let expired = self.retention.apply(&mut self.index, &self.store, now);
        let evicted = self
            .eviction
            .apply(&mut self.index, &self.store, Some(fingerprint));
        self.persist();

        Ok(StoreReport {
            artifact_path,
            size_bytes,
            expired,
            evicted,
        })
    }

    /// Remove entries older than `older_than`, or everything (stats included)
    /// when `None`. Failures are logged; returns how many entries went.
    pub fn clear(&mut self, older_than: Option<Duration>) -> usize {
        let (removed, outcome) = self.clear_entries(older_than);
        if let Err(e) = outcome {
            warn!(removed, "Build cache was only partly cleared: {e}");
        }
        removed
    }

    /// Fallible form of [`clear`](Self::clear).
    ///
    /// The index and stats are saved even when this fails part way.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache root cannot be listed during a full
    /// clear or an unindexed artifact directory cannot be removed.
    pub fn try_clear(&mut self, older_than: Option<Duration>) -> Result<usize> {
        let (removed, outcome) = self.clear_entries(older_than);
        outcome.map(|()| removed)
    }

    fn clear_entries(&mut self, older_than: Option<Duration>) -> (usize, Result<()>) {
        let (removed, outcome) = match older_than {
            Some(horizon) => {
                let now = self.clock.now();
                let removed = expire_older_than(&mut self.index, &self.store, now, horizon);
                (removed.len(), Ok(()))
            }
            None => {
                let mut removed = 0;
                for fingerprint in self.index.fingerprints() {
                    if self.index.purge(&fingerprint, &self.store) {
                        removed += 1;
                    }
                }
                let outcome = self.remove_unindexed(&mut removed);
                self.stats.reset();
                (removed, outcome)
            }
        };
        info!(removed, full = older_than.is_none(), "Cleared build cache");
        self.persist();
        (removed, outcome)
    }

    /// Delete artifact directories the index never knew about
    fn remove_unindexed(&self, removed: &mut usize) -> Result<()> {
        for fingerprint in self.store.list()? {
            if !self.index.contains(&fingerprint) && self.store.remove(&fingerprint)? {
                *removed += 1;
            }
        }
        Ok(())
    }

    /// Counters plus current size and entry count
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(&self.index)
    }

    /// Zero the hit/miss/store counters
    pub fn reset_stats(&mut self) {
        self.stats.reset();
        self.persist_stats();
    }

    /// Every entry, most recently accessed first
    #[must_use]
    pub fn list_entries(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.index.entries().cloned().collect();
        entries.sort_by(|a, b| {
            b.last_accessed_at
                .ordering_key()
                .cmp(&a.last_accessed_at.ordering_key())
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        entries
    }

    /// What retention would remove right now
    #[must_use]
    pub fn retention_report(&self) -> RetentionReport {
        self.retention.report(&self.index, self.clock.now())
    }

    /// Run retention outside of a store
    pub fn apply_retention(&mut self) -> Vec<Fingerprint> {
        let now = self.clock.now();
        let removed = self.retention.apply(&mut self.index, &self.store, now);
        if !removed.is_empty() {
            self.persist_index();
        }
        removed
    }

    /// Run eviction outside of a store
    pub fn enforce_size_limit(&mut self) -> Vec<Fingerprint> {
        let removed = self.eviction.apply(&mut self.index, &self.store, None);
        if !removed.is_empty() {
            self.persist_index();
        }
        removed
    }

    /// Drop index records whose directory is gone and adopt directories the
    /// index does not know. Returns whether the index changed.
    fn reconcile(&mut self) -> bool {
        let mut changed = false;
        for fingerprint in self.index.fingerprints() {
            if self.store.retrieve(&fingerprint).is_none() {
                debug!(fingerprint = %fingerprint.short(), "Dropping entry without artifacts");
                self.index.remove(&fingerprint);
                changed = true;
            }
        }

        match self.store.list() {
            Ok(on_disk) => {
                let now = self.clock.now();
                for fingerprint in on_disk {
                    if !self.index.contains(&fingerprint) {
                        self.adopt(&fingerprint, now);
                        changed = true;
                    }
                }
            }
            Err(e) => warn!("Failed to list cache root for reconciliation: {e}"),
        }
        changed
    }

    /// Index an artifact directory written by another process (or left over
    /// from a lost index). Its age is unknown, so it counts from `now`.
    fn adopt(&mut self, fingerprint: &Fingerprint, now: DateTime<Utc>) {
        let size_bytes = self.store.size_of(fingerprint).unwrap_or_else(|e| {
            warn!(fingerprint = %fingerprint.short(), "Failed to size adopted artifacts: {e}");
            0
        });
        debug!(fingerprint = %fingerprint.short(), size_bytes, "Adopting unindexed artifacts");
        self.index.put(CacheEntry {
            fingerprint: fingerprint.clone(),
            artifact_path: self.store.entry_path(fingerprint),
            created_at: RecordedTime::At(now),
            last_accessed_at: RecordedTime::At(now),
            size_bytes,
            build_duration_ms: 0,
            success: true,
        });
    }

    fn persist(&self) {
        self.persist_index();
        self.persist_stats();
    }

    fn persist_index(&self) {
        if let Err(e) = self.index.save() {
            warn!(path = %self.index.path().display(), "Failed to save cache index: {e}");
        }
    }

    fn persist_stats(&self) {
        if let Err(e) = self.stats.save() {
            warn!("Failed to save cache stats: {e}");
        }
    }
}
