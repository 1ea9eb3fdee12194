//! Persistent per-fingerprint metadata
//!
//! The index is a single JSON object under the cache root mapping each
//! fingerprint to its [`CacheEntry`]. It is rewritten atomically on every
//! save. It is an optimization layer: the artifact directories decide hits
//! and misses, and the index is reconciled against them lazily.

use crate::Result;
use crate::fingerprint::Fingerprint;
use crate::persist::{read_json, write_json_atomic};
use crate::store::ArtifactStore;
use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File name of the index within the cache root
pub const INDEX_FILE: &str = "build_index.json";

/// A timestamp as recorded on disk.
///
/// Text that does not parse is kept verbatim instead of failing the whole
/// index; policies treat it as infinitely old.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RecordedTime {
    /// A valid instant
    At(DateTime<Utc>),
    /// Unparsable text found on disk
    Malformed(String),
}

impl RecordedTime {
    /// The instant, if the recorded value was valid
    #[must_use]
    pub fn instant(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::At(t) => Some(*t),
            Self::Malformed(_) => None,
        }
    }

    /// Age relative to `now`; `None` for malformed values
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.instant().map(|t| now - t)
    }

    /// Sort key where malformed values order before every valid instant
    #[must_use]
    pub fn ordering_key(&self) -> DateTime<Utc> {
        self.instant().unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl From<DateTime<Utc>> for RecordedTime {
    fn from(value: DateTime<Utc>) -> Self {
        Self::At(value)
    }
}

impl From<String> for RecordedTime {
    fn from(value: String) -> Self {
        if let Ok(t) = DateTime::parse_from_rfc3339(&value) {
            return Self::At(t.with_timezone(&Utc));
        }
        // Zone-less ISO 8601, as written by older tooling, is read as UTC
        if let Ok(naive) = NaiveDateTime::parse_from_str(&value, "%Y-%m-%dT%H:%M:%S%.f") {
            return Self::At(naive.and_utc());
        }
        Self::Malformed(value)
    }
}

impl From<RecordedTime> for String {
    fn from(value: RecordedTime) -> Self {
        match value {
            RecordedTime::At(t) => t.to_rfc3339_opts(SecondsFormat::Micros, true),
            RecordedTime::Malformed(raw) => raw,
        }
    }
}

/// Metadata for one cached build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheEntry {
    /// Key of the entry
    pub fingerprint: Fingerprint,
    /// Directory holding the artifacts
    pub artifact_path: PathBuf,
    /// When the entry was stored
    pub created_at: RecordedTime,
    /// Last time a lookup hit this entry
    pub last_accessed_at: RecordedTime,
    /// Total size of the artifact files
    pub size_bytes: u64,
    /// How long the build that produced it took
    pub build_duration_ms: u64,
    /// Whether that build succeeded
    pub success: bool,
}

/// Fingerprint → entry map with an incrementally maintained size total
#[derive(Debug, Clone)]
pub struct CacheIndex {
    path: PathBuf,
    entries: BTreeMap<Fingerprint, CacheEntry>,
    total_size_bytes: u64,
}

impl CacheIndex {
    /// An empty index that will persist to `root/build_index.json`
    #[must_use]
    pub fn empty(root: &Path) -> Self {
        Self {
            path: root.join(INDEX_FILE),
            entries: BTreeMap::new(),
            total_size_bytes: 0,
        }
    }

    /// Load the index from `root`.
    ///
    /// A missing file yields an empty index. An unreadable or malformed file is
    /// logged and also yields an empty index (a cold cache); the bad file stays
    /// on disk until the next successful save overwrites it.
    #[must_use]
    pub fn load(root: &Path) -> Self {
        let mut index = Self::empty(root);
        match read_json::<BTreeMap<Fingerprint, CacheEntry>>(&index.path) {
            Ok(Some(entries)) => {
                for (key, mut entry) in entries {
                    if entry.fingerprint != key {
                        warn!(
                            key = %key.short(),
                            recorded = %entry.fingerprint.short(),
                            "Index entry fingerprint disagrees with its key; using the key"
                        );
                        entry.fingerprint = key;
                    }
                    index.put(entry);
                }
                debug!(
                    entries = index.len(),
                    size_bytes = index.total_size_bytes,
                    "Loaded cache index"
                );
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    path = %index.path.display(),
                    "Cache index is unreadable, starting cold: {e}"
                );
            }
        }
        index
    }

    /// Where the index persists
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the index atomically
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or any filesystem step fails; the
    /// previous file is left intact in that case.
    pub fn save(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.entries)
    }

    /// Entry for a fingerprint
    #[must_use]
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&CacheEntry> {
        self.entries.get(fingerprint)
    }

    /// Whether a fingerprint is indexed
    #[must_use]
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.entries.contains_key(fingerprint)
    }

    /// Insert or replace an entry, returning the previous one
    pub fn put(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        self.total_size_bytes = self.total_size_bytes.saturating_add(entry.size_bytes);
        let previous = self.entries.insert(entry.fingerprint.clone(), entry);
        if let Some(prev) = &previous {
            self.total_size_bytes = self.total_size_bytes.saturating_sub(prev.size_bytes);
        }
        previous
    }

    /// Remove an entry
    pub fn remove(&mut self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let removed = self.entries.remove(fingerprint);
        if let Some(entry) = &removed {
            self.total_size_bytes = self.total_size_bytes.saturating_sub(entry.size_bytes);
        }
        removed
    }

    /// Delete an entry's artifact directory, then its index record.
    ///
    /// If the directory cannot be removed the record is kept so a later pass
    /// retries; returns whether the entry is gone.
    pub(crate) fn purge(&mut self, fingerprint: &Fingerprint, store: &ArtifactStore) -> bool {
        match store.remove(fingerprint) {
            Ok(_) => {
                self.remove(fingerprint);
                true
            }
            Err(e) => {
                warn!(fingerprint = %fingerprint.short(), "Failed to remove cache entry: {e}");
                false
            }
        }
    }

    /// Refresh `last_accessed_at` and nothing else. Returns `false` if the
    /// fingerprint is not indexed.
    pub fn touch(&mut self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> bool {
        match self.entries.get_mut(fingerprint) {
            Some(entry) => {
                entry.last_accessed_at = RecordedTime::At(now);
                true
            }
            None => false,
        }
    }

    /// All entries in fingerprint order
    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    /// All indexed fingerprints in order
    #[must_use]
    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        self.entries.keys().cloned().collect()
    }

    /// Sum of `size_bytes` over all entries
    #[must_use]
    pub fn total_size_bytes(&self) -> u64 {
        self.total_size_bytes
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index has no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
