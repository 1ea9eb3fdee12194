//! Cache configuration and cache-root resolution

use crate::eviction::{DEFAULT_TARGET_RATIO, EvictionPolicy};
use crate::retention::RetentionPolicy;
use crate::{Error, Result};
use dirs::{cache_dir, home_dir};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Overrides the cache root
pub const ENV_CACHE_DIR: &str = "KILN_CACHE_DIR";
/// Overrides the size budget, in bytes
pub const ENV_MAX_SIZE: &str = "KILN_CACHE_MAX_SIZE";
/// Overrides the retention horizon, in days (`0` disables retention)
pub const ENV_RETENTION_DAYS: &str = "KILN_CACHE_RETENTION_DAYS";

/// Default size budget: 10 GiB
pub const DEFAULT_MAX_SIZE_BYTES: u64 = 10 * 1024 * 1024 * 1024;
/// Default retention horizon
pub const DEFAULT_RETENTION_DAYS: u64 = 30;

/// Settings for one [`CacheManager`](crate::CacheManager)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Cache root; resolved from the environment and platform dirs when unset
    pub root: Option<PathBuf>,
    /// Size budget; `None` disables eviction
    pub max_size_bytes: Option<u64>,
    /// Retention horizon in days; `None` or `0` disables retention
    pub retention_days: Option<u64>,
    /// Fraction of the budget an eviction pass cleans down to
    pub eviction_target_ratio: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: None,
            max_size_bytes: Some(DEFAULT_MAX_SIZE_BYTES),
            retention_days: Some(DEFAULT_RETENTION_DAYS),
            eviction_target_ratio: DEFAULT_TARGET_RATIO,
        }
    }
}

impl CacheConfig {
    /// Defaults with an explicit root
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Self::default()
        }
    }

    /// Set the size budget
    #[must_use]
    pub fn max_size_bytes(mut self, max: Option<u64>) -> Self {
        self.max_size_bytes = max;
        self
    }

    /// Set the retention horizon
    #[must_use]
    pub fn retention_days(mut self, days: Option<u64>) -> Self {
        self.retention_days = days;
        self
    }

    /// Set the eviction hysteresis ratio
    #[must_use]
    pub fn eviction_target_ratio(mut self, ratio: f64) -> Self {
        self.eviction_target_ratio = ratio;
        self
    }

    /// Defaults overlaid with `KILN_CACHE_*` environment variables.
    ///
    /// Empty values are ignored.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a numeric variable does not parse.
    pub fn from_env() -> Result<Self> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = var(ENV_CACHE_DIR) {
            self.root = Some(PathBuf::from(dir));
        }
        if let Some(raw) = var(ENV_MAX_SIZE) {
            self.max_size_bytes = Some(parse_u64(ENV_MAX_SIZE, &raw)?);
        }
        if let Some(raw) = var(ENV_RETENTION_DAYS) {
            self.retention_days = Some(parse_u64(ENV_RETENTION_DAYS, &raw)?);
        }
        Ok(self)
    }

    /// Reject settings no cache can operate under
    ///
    /// # Errors
    ///
    /// Returns a validation error for a ratio outside `(0, 1]` or a zero
    /// size budget.
    pub fn validate(&self) -> Result<()> {
        let ratio = self.eviction_target_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(Error::validation(format!(
                "eviction_target_ratio must be in (0, 1], got {ratio}"
            )));
        }
        if self.max_size_bytes == Some(0) {
            return Err(Error::validation(
                "max_size_bytes must be positive; use no budget to disable eviction",
            ));
        }
        Ok(())
    }

    /// Pick the cache root: the configured one, else the first writable
    /// platform location.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if no candidate is writable.
    pub fn resolve_root(&self) -> Result<PathBuf> {
        cache_root_from_inputs(CacheInputs {
            root_override: self.root.clone(),
            xdg_cache_home: std::env::var("XDG_CACHE_HOME")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            os_cache_dir: cache_dir(),
            home_dir: home_dir(),
            temp_dir: std::env::temp_dir(),
        })
    }

    /// Retention policy for these settings
    #[must_use]
    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy::from_days(self.retention_days)
    }

    /// Eviction policy for these settings
    #[must_use]
    pub fn eviction_policy(&self) -> EvictionPolicy {
        EvictionPolicy::new(self.max_size_bytes, self.eviction_target_ratio)
    }
}

fn parse_u64(key: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse()
        .map_err(|e| Error::configuration(format!("{key}={raw:?} is not a whole number: {e}")))
}

#[derive(Debug, Clone)]
struct CacheInputs {
    root_override: Option<PathBuf>,
    xdg_cache_home: Option<PathBuf>,
    os_cache_dir: Option<PathBuf>,
    home_dir: Option<PathBuf>,
    temp_dir: PathBuf,
}

fn cache_root_from_inputs(inputs: CacheInputs) -> Result<PathBuf> {
    // First writable wins:
    // 1) explicit root (config or KILN_CACHE_DIR)
    // 2) XDG_CACHE_HOME/kiln/artifacts
    // 3) OS cache dir/kiln/artifacts
    // 4) ~/.kiln/cache/artifacts
    // 5) TMPDIR/kiln/cache/artifacts
    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Some(dir) = inputs.root_override.filter(|p| !p.as_os_str().is_empty()) {
        candidates.push(dir);
    }
    if let Some(xdg) = inputs.xdg_cache_home {
        candidates.push(xdg.join("kiln/artifacts"));
    }
    if let Some(os_cache) = inputs.os_cache_dir {
        candidates.push(os_cache.join("kiln/artifacts"));
    }
    if let Some(home) = inputs.home_dir {
        candidates.push(home.join(".kiln/cache/artifacts"));
    }
    candidates.push(inputs.temp_dir.join("kiln/cache/artifacts"));

    for path in candidates {
        // Nix build sandboxes point HOME here and it is never writable
        if path.starts_with("/homeless-shelter") {
            continue;
        }
        if path.exists() {
            let probe = path.join(".write_probe");
            if std::fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&probe)
                .is_ok()
            {
                let _ = std::fs::remove_file(&probe);
                return Ok(path);
            }
            continue;
        }
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        }
    }
    Err(Error::configuration(
        "Failed to determine a writable cache directory",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        let config = CacheConfig::default();
        assert_eq!(config.max_size_bytes, Some(DEFAULT_MAX_SIZE_BYTES));
        assert_eq!(config.retention_days, Some(30));
        assert!((config.eviction_target_ratio - 0.8).abs() < f64::EPSILON);
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_bad_ratio_and_zero_budget() {
        for ratio in [0.0, -0.5, 1.01, f64::NAN] {
            let err = CacheConfig::default()
                .eviction_target_ratio(ratio)
                .validate()
                .unwrap_err();
            assert!(matches!(err, Error::Validation { .. }), "ratio {ratio}");
        }
        assert!(
            CacheConfig::default()
                .max_size_bytes(Some(0))
                .validate()
                .is_err()
        );
        CacheConfig::default()
            .max_size_bytes(None)
            .eviction_target_ratio(1.0)
            .validate()
            .unwrap();
    }

    #[test]
    fn from_env_overlays_variables() {
        temp_env::with_vars(
            [
                (ENV_CACHE_DIR, Some("/srv/kiln-cache")),
                (ENV_MAX_SIZE, Some("4096")),
                (ENV_RETENTION_DAYS, Some(" 7 ")),
            ],
            || {
                let config = CacheConfig::from_env().unwrap();
                assert_eq!(config.root, Some(PathBuf::from("/srv/kiln-cache")));
                assert_eq!(config.max_size_bytes, Some(4096));
                assert_eq!(config.retention_days, Some(7));
            },
        );
    }

    #[test]
    fn from_env_ignores_empty_and_rejects_garbage() {
        temp_env::with_vars(
            [
                (ENV_CACHE_DIR, Some("")),
                (ENV_MAX_SIZE, None),
                (ENV_RETENTION_DAYS, Some("a month")),
            ],
            || {
                let err = CacheConfig::from_env().unwrap_err();
                assert!(matches!(err, Error::Configuration { .. }));
            },
        );
        temp_env::with_vars_unset([ENV_CACHE_DIR, ENV_MAX_SIZE, ENV_RETENTION_DAYS], || {
            assert_eq!(CacheConfig::from_env().unwrap(), CacheConfig::default());
        });
    }

    #[test]
    fn deserializes_partial_documents() {
        let config: CacheConfig =
            serde_json::from_str(r#"{ "retention_days": 0, "max_size_bytes": null }"#).unwrap();
        assert_eq!(config.retention_days, Some(0));
        assert_eq!(config.max_size_bytes, None);
        assert!(config.retention_policy().horizon().is_none());
        assert!(config.eviction_policy().max_size_bytes().is_none());

        assert!(serde_json::from_str::<CacheConfig>(r#"{ "ttl": 3 }"#).is_err());
    }

    #[test]
    fn cache_root_respects_override() {
        let tmp = TempDir::new().unwrap();
        let wanted = tmp.path().join("custom");
        let dir = cache_root_from_inputs(CacheInputs {
            root_override: Some(wanted.clone()),
            xdg_cache_home: Some(tmp.path().join("xdg")),
            os_cache_dir: None,
            home_dir: None,
            temp_dir: tmp.path().to_path_buf(),
        })
        .unwrap();
        assert_eq!(dir, wanted);
        assert!(dir.is_dir());
    }

    #[test]
    fn cache_root_prefers_xdg_over_home() {
        let tmp = TempDir::new().unwrap();
        let dir = cache_root_from_inputs(CacheInputs {
            root_override: None,
            xdg_cache_home: Some(tmp.path().join("xdg")),
            os_cache_dir: Some(tmp.path().join("os")),
            home_dir: Some(tmp.path().join("home")),
            temp_dir: tmp.path().to_path_buf(),
        })
        .unwrap();
        assert_eq!(dir, tmp.path().join("xdg/kiln/artifacts"));
    }

    #[test]
    fn cache_root_skips_homeless_shelter() {
        let tmp = TempDir::new().unwrap();
        let dir = cache_root_from_inputs(CacheInputs {
            root_override: None,
            xdg_cache_home: Some(PathBuf::from("/homeless-shelter/.cache")),
            os_cache_dir: None,
            home_dir: Some(PathBuf::from("/homeless-shelter")),
            temp_dir: tmp.path().to_path_buf(),
        })
        .unwrap();
        assert!(dir.starts_with(tmp.path()));
    }

    #[test]
    fn cache_root_skips_candidate_blocked_by_file() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("blocked");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let dir = cache_root_from_inputs(CacheInputs {
            root_override: Some(blocker.join("cache")),
            xdg_cache_home: None,
            os_cache_dir: None,
            home_dir: None,
            temp_dir: tmp.path().to_path_buf(),
        })
        .unwrap();
        assert_eq!(dir, tmp.path().join("kiln/cache/artifacts"));
    }
}
