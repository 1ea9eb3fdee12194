//! Hit/miss accounting persisted next to the index

use crate::Result;
use crate::index::CacheIndex;
use crate::persist::{read_json, write_json_atomic};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// File name of the stats file within the cache root
pub const STATS_FILE: &str = "cache_stats.json";

/// Persisted counters. Monotonic until explicitly reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheStats {
    /// Lookups that found an entry
    pub hits: u64,
    /// Lookups that did not
    pub misses: u64,
    /// Artifacts ever stored
    pub total_stored: u64,
    /// Bytes ever stored
    pub cumulative_size_bytes: u64,
}

/// Point-in-time view combining counters with current index totals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Lookups that found an entry
    pub hits: u64,
    /// Lookups that did not
    pub misses: u64,
    /// `hits / (hits + misses)`, or 0.0 before any lookup
    pub hit_rate: f64,
    /// Artifacts ever stored
    pub total_stored: u64,
    /// Bytes ever stored
    pub cumulative_size_bytes: u64,
    /// Bytes currently held, per the index
    pub current_size_bytes: u64,
    /// Entries currently held, per the index
    pub entry_count: usize,
}

/// `hits / (hits + misses)`, defined as zero when there were no lookups
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits.saturating_add(misses);
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Owns the counters for one cache root
#[derive(Debug, Clone)]
pub struct StatsTracker {
    path: PathBuf,
    stats: CacheStats,
}

impl StatsTracker {
    /// Load counters from `root`; missing or unreadable files start at zero
    #[must_use]
    pub fn load(root: &Path) -> Self {
        let path = root.join(STATS_FILE);
        let stats = match read_json::<CacheStats>(&path) {
            Ok(stats) => stats.unwrap_or_default(),
            Err(e) => {
                warn!(path = %path.display(), "Cache stats are unreadable, resetting: {e}");
                CacheStats::default()
            }
        };
        Self { path, stats }
    }

    /// Persist the counters atomically
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.stats)
    }

    /// Count a hit
    pub fn record_hit(&mut self) {
        self.stats.hits = self.stats.hits.saturating_add(1);
    }

    /// Count a miss
    pub fn record_miss(&mut self) {
        self.stats.misses = self.stats.misses.saturating_add(1);
    }

    /// Count a newly stored artifact of `size_bytes`
    pub fn record_store(&mut self, size_bytes: u64) {
        self.stats.total_stored = self.stats.total_stored.saturating_add(1);
        self.stats.cumulative_size_bytes =
            self.stats.cumulative_size_bytes.saturating_add(size_bytes);
    }

    /// Zero every counter
    pub fn reset(&mut self) {
        self.stats = CacheStats::default();
    }

    /// The raw counters
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Counters plus current index totals
    #[must_use]
    pub fn snapshot(&self, index: &CacheIndex) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.stats.hits,
            misses: self.stats.misses,
            hit_rate: hit_rate(self.stats.hits, self.stats.misses),
            total_stored: self.stats.total_stored,
            cumulative_size_bytes: self.stats.cumulative_size_bytes,
            current_size_bytes: index.total_size_bytes(),
            entry_count: index.len(),
        }
    }
}
