//! Local build-artifact cache for kiln
//!
//! This crate decides whether a build can be skipped and keeps the outputs
//! of builds that could not:
//! - Deterministic fingerprints over sources, options, dependencies and
//!   compiler identity
//! - Crash-safe artifact storage (copy to staging, then rename)
//! - A persisted index and hit/miss statistics
//! - Time-based retention and size-based LRU eviction
//!
//! # Overview
//!
//! ```no_run
//! use kiln_cache::{BuildConfig, BuildMetadata, CacheConfig, CacheManager, compute_fingerprint};
//! use std::path::Path;
//! use std::time::Duration;
//!
//! # fn main() -> kiln_cache::Result<()> {
//! let mut cache = CacheManager::open(CacheConfig::from_env()?)?;
//! let config = BuildConfig::new()
//!     .source("src/main.c")
//!     .option("shared", "true")
//!     .dependency("openssl")
//!     .compiler("name", "gcc")
//!     .compiler("version", "13.2.0");
//! let fingerprint = compute_fingerprint(&config)?;
//!
//! if cache.lookup(&fingerprint).is_none() {
//!     // ... run the build into ./out ...
//!     cache.store(
//!         &fingerprint,
//!         Path::new("out"),
//!         BuildMetadata::new(Duration::from_secs(42), true),
//!     );
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Cache layout
//!
//! ```text
//! <root>/build_index.json   fingerprint -> entry metadata
//! <root>/cache_stats.json   hit/miss/store counters
//! <root>/<fingerprint>/     verbatim artifact tree
//! <root>/.staging/          in-flight writes
//! ```

pub mod clock;
pub mod config;
mod error;
pub mod eviction;
pub mod fingerprint;
pub mod index;
pub mod manager;
mod persist;
pub mod retention;
pub mod stats;
pub mod store;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use eviction::EvictionPolicy;
pub use fingerprint::{BuildConfig, Fingerprint, compute_fingerprint, discover_include_dependencies};
pub use index::{CacheEntry, CacheIndex, RecordedTime};
pub use manager::{BuildMetadata, CacheManager, StoreReport};
pub use retention::{RetentionPolicy, RetentionReport};
pub use stats::{CacheStats, StatsSnapshot, StatsTracker};
pub use store::{ArtifactStore, Materialized};
