//! Size-bounded least-recently-used eviction

use crate::fingerprint::Fingerprint;
use crate::index::CacheIndex;
use crate::store::ArtifactStore;
use tracing::{debug, info};

/// Fraction of the budget an eviction pass cleans down to
pub const DEFAULT_TARGET_RATIO: f64 = 0.8;

/// Evicts least-recently-accessed entries once the cache outgrows its budget.
///
/// A pass only starts when the aggregate size exceeds `max_size_bytes` and
/// then keeps going until it is at or below `max_size_bytes * target_ratio`,
/// so the next store does not immediately trigger another pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvictionPolicy {
    max_size_bytes: Option<u64>,
    target_ratio: f64,
}

impl EvictionPolicy {
    /// Policy with a budget (`None` disables eviction) and hysteresis ratio.
    ///
    /// Ratios outside `(0, 1]` fall back to [`DEFAULT_TARGET_RATIO`].
    #[must_use]
    pub fn new(max_size_bytes: Option<u64>, target_ratio: f64) -> Self {
        let target_ratio = if target_ratio > 0.0 && target_ratio <= 1.0 {
            target_ratio
        } else {
            DEFAULT_TARGET_RATIO
        };
        Self {
            max_size_bytes,
            target_ratio,
        }
    }

    /// The configured budget
    #[must_use]
    pub fn max_size_bytes(&self) -> Option<u64> {
        self.max_size_bytes
    }

    /// Size a pass cleans down to
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn target_bytes(&self) -> Option<u64> {
        self.max_size_bytes
            .map(|max| (max as f64 * self.target_ratio).floor() as u64)
    }

    /// Whether the index currently exceeds the budget
    #[must_use]
    pub fn needs_eviction(&self, index: &CacheIndex) -> bool {
        self.max_size_bytes
            .is_some_and(|max| index.total_size_bytes() > max)
    }

    /// Run one eviction pass.
    ///
    /// Candidates are ordered by `last_accessed_at` (malformed values first),
    /// ties broken by fingerprint. `protect` is skipped so an entry is never
    /// evicted by its own insertion. Returns the removed fingerprints in
    /// eviction order.
    pub fn apply(
        &self,
        index: &mut CacheIndex,
        store: &ArtifactStore,
        protect: Option<&Fingerprint>,
    ) -> Vec<Fingerprint> {
        let (Some(max), Some(target)) = (self.max_size_bytes, self.target_bytes()) else {
            return Vec::new();
        };
        let before = index.total_size_bytes();
        if before <= max {
            return Vec::new();
        }

        let mut candidates: Vec<_> = index
            .entries()
            .filter(|e| Some(&e.fingerprint) != protect)
            .map(|e| (e.last_accessed_at.ordering_key(), e.fingerprint.clone()))
            .collect();
        candidates.sort();

        let mut removed = Vec::new();
        for (_, fingerprint) in candidates {
            if index.total_size_bytes() <= target {
                break;
            }
            if index.purge(&fingerprint, store) {
                debug!(fingerprint = %fingerprint.short(), "Evicted least recently used entry");
                removed.push(fingerprint);
            }
        }

        info!(
            evicted = removed.len(),
            before_bytes = before,
            after_bytes = index.total_size_bytes(),
            max_bytes = max,
            target_bytes = target,
            "Size-based eviction pass finished"
        );
        removed
    }
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::new(None, DEFAULT_TARGET_RATIO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{CacheEntry, RecordedTime};
    use chrono::{Duration, TimeZone, Utc};
    use std::fs;
    use tempfile::TempDir;

    fn fp(c: char) -> Fingerprint {
        Fingerprint::from_hex(c.to_string().repeat(64)).unwrap()
    }

    /// (fingerprint char, size, minutes since base for last access)
    fn seeded(specs: &[(char, u64, i64)]) -> (TempDir, CacheIndex, ArtifactStore) {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let mut index = CacheIndex::empty(tmp.path());
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for (c, size, minutes) in specs {
            let path = store.entry_path(&fp(*c));
            fs::create_dir_all(&path).unwrap();
            index.put(CacheEntry {
                fingerprint: fp(*c),
                artifact_path: path,
                created_at: base.into(),
                last_accessed_at: (base + Duration::minutes(*minutes)).into(),
                size_bytes: *size,
                build_duration_ms: 0,
                success: true,
            });
        }
        (tmp, index, store)
    }

    #[test]
    fn under_budget_is_untouched() {
        let (_tmp, mut index, store) = seeded(&[('a', 40, 0), ('b', 60, 1)]);
        let policy = EvictionPolicy::new(Some(100), 0.8);
        assert!(!policy.needs_eviction(&index));
        assert!(policy.apply(&mut index, &store, None).is_empty());
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn evicts_oldest_access_down_to_target() {
        // 4 x 30 = 120 > 100; target 80 requires dropping two entries
        let (_tmp, mut index, store) =
            seeded(&[('a', 30, 3), ('b', 30, 0), ('c', 30, 2), ('d', 30, 1)]);
        let policy = EvictionPolicy::new(Some(100), 0.8);

        let removed = policy.apply(&mut index, &store, None);
        assert_eq!(removed, vec![fp('b'), fp('d')]);
        assert_eq!(index.total_size_bytes(), 60);
        assert!(store.retrieve(&fp('b')).is_none());
        assert!(store.retrieve(&fp('a')).is_some());
    }

    #[test]
    fn ties_break_by_fingerprint() {
        let (_tmp, mut index, store) = seeded(&[('c', 50, 0), ('a', 50, 0), ('b', 50, 0)]);
        let removed = EvictionPolicy::new(Some(100), 0.5).apply(&mut index, &store, None);
        assert_eq!(removed, vec![fp('a'), fp('b')]);
    }

    #[test]
    fn malformed_access_time_goes_first() {
        let (_tmp, mut index, store) = seeded(&[('a', 60, 0), ('b', 60, 5)]);
        let mut broken = index.get(&fp('b')).unwrap().clone();
        broken.last_accessed_at = RecordedTime::Malformed("garbage".into());
        index.put(broken);

        let removed = EvictionPolicy::new(Some(100), 0.8).apply(&mut index, &store, None);
        assert_eq!(removed, vec![fp('b')]);
    }

    #[test]
    fn protected_entry_survives_its_own_insertion() {
        let (_tmp, mut index, store) = seeded(&[('a', 10, 0), ('z', 500, 9)]);
        let removed = EvictionPolicy::new(Some(100), 0.8).apply(&mut index, &store, Some(&fp('z')));
        assert_eq!(removed, vec![fp('a')]);
        assert!(index.contains(&fp('z')));
    }

    #[test]
    fn disabled_budget_never_evicts() {
        let (_tmp, mut index, store) = seeded(&[('a', u64::MAX / 2, 0)]);
        let policy = EvictionPolicy::default();
        assert!(policy.target_bytes().is_none());
        assert!(policy.apply(&mut index, &store, None).is_empty());
    }

    #[test]
    fn invalid_ratio_falls_back_to_default() {
        let policy = EvictionPolicy::new(Some(1000), 1.5);
        assert_eq!(policy.target_bytes(), Some(800));
        let policy = EvictionPolicy::new(Some(1000), 0.0);
        assert_eq!(policy.target_bytes(), Some(800));
    }
}
