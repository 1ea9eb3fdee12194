//! Deterministic build fingerprints
//!
//! A [`Fingerprint`] is the SHA-256 of a canonicalized [`BuildConfig`]. Every
//! input category is sorted before hashing so callers may supply sources,
//! options and dependencies in any order. Categories are fed into one digest
//! in a fixed order (sources, options, dependencies, compiler) with each
//! variable-length field length-prefixed, which keeps distinct configurations
//! from colliding on the same byte stream.

use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Read buffer used when streaming source contents into the digest
const READ_CHUNK: usize = 64 * 1024;

/// Length of a hex-encoded SHA-256 digest
const FINGERPRINT_LEN: usize = 64;

/// File extensions scanned by [`discover_include_dependencies`]
const INCLUDE_SCAN_EXTENSIONS: &[&str] = &["c", "cc", "cpp", "cxx", "h", "hpp"];

/// Content-derived key identifying one build configuration (64 lowercase hex chars)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Validate and wrap a hex digest
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] unless the input is exactly 64 hex digits.
    /// Uppercase input is normalized to lowercase.
    pub fn from_hex(hex: impl Into<String>) -> Result<Self> {
        let s = hex.into();
        if s.len() != FINGERPRINT_LEN {
            return Err(Error::validation(format!(
                "Fingerprint must be {FINGERPRINT_LEN} hex characters, got {}",
                s.len()
            )));
        }
        if !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::validation("Fingerprint must contain only hex digits"));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    /// Hex representation
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::from_hex(value)
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

impl std::str::FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

/// Everything that determines whether a previous build can be reused
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Source files whose path, mtime, size and content are hashed
    pub sources: Vec<PathBuf>,
    /// Build options (e.g. `shared=true`, `build_type=Release`)
    pub options: BTreeMap<String, String>,
    /// Resolved dependency identifiers (e.g. `zlib/1.3.1`)
    pub dependencies: Vec<String>,
    /// Compiler identity fields (e.g. `name`, `version`, `target_arch`)
    pub compiler: BTreeMap<String, String>,
}

impl BuildConfig {
    /// Empty configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source file
    #[must_use]
    pub fn source(mut self, path: impl Into<PathBuf>) -> Self {
        self.sources.push(path.into());
        self
    }

    /// Add several source files
    #[must_use]
    pub fn sources<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.sources.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Set a build option
    #[must_use]
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Add a dependency identifier
    #[must_use]
    pub fn dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.push(dep.into());
        self
    }

    /// Set a compiler identity field
    #[must_use]
    pub fn compiler(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.compiler.insert(key.into(), value.into());
        self
    }
}

/// SHA-256 wrapper that length-prefixes every field
struct FieldHasher(Sha256);

impl FieldHasher {
    fn new() -> Self {
        Self(Sha256::new())
    }

    fn field(&mut self, bytes: &[u8]) {
        self.0.update((bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
    }

    fn count(&mut self, n: usize) {
        self.0.update((n as u64).to_le_bytes());
    }

    fn finish(self) -> Fingerprint {
        Fingerprint(hex::encode(self.0.finalize()))
    }
}

/// Compute the fingerprint of a build configuration
///
/// # Errors
///
/// Returns [`Error::MissingInput`] if any declared source cannot be opened,
/// stat'ed or read. The file is never silently left out of the digest.
pub fn compute_fingerprint(config: &BuildConfig) -> Result<Fingerprint> {
    let mut hasher = FieldHasher::new();

    // Equal paths with different spellings (`src/./a.c`, `src/a.c/`) must
    // hash identically whichever comes first
    let mut sources: Vec<PathBuf> = config
        .sources
        .iter()
        .map(|p| p.components().collect())
        .collect();
    sources.sort();
    sources.dedup();
    hasher.field(b"sources");
    hasher.count(sources.len());
    for path in &sources {
        hash_source(&mut hasher, path)?;
    }

    hasher.field(b"options");
    hasher.count(config.options.len());
    for (key, value) in &config.options {
        hasher.field(key.as_bytes());
        hasher.field(value.as_bytes());
    }

    let dependencies: BTreeSet<&str> = config.dependencies.iter().map(String::as_str).collect();
    hasher.field(b"dependencies");
    hasher.count(dependencies.len());
    for dep in dependencies {
        hasher.field(dep.as_bytes());
    }

    hasher.field(b"compiler");
    hasher.count(config.compiler.len());
    for (key, value) in &config.compiler {
        hasher.field(key.as_bytes());
        hasher.field(value.as_bytes());
    }

    let fingerprint = hasher.finish();
    tracing::debug!(
        fingerprint = %fingerprint.short(),
        sources = config.sources.len(),
        options = config.options.len(),
        dependencies = config.dependencies.len(),
        "Computed build fingerprint"
    );
    Ok(fingerprint)
}

fn hash_source(hasher: &mut FieldHasher, path: &Path) -> Result<()> {
    let mut file = File::open(path).map_err(|e| Error::missing_input(e, path))?;
    let metadata = file.metadata().map_err(|e| Error::missing_input(e, path))?;
    let modified = metadata.modified().map_err(|e| Error::missing_input(e, path))?;
    let mtime = DateTime::<Utc>::from(modified).to_rfc3339_opts(SecondsFormat::Nanos, true);

    hasher.field(path.as_os_str().as_encoded_bytes());
    hasher.field(mtime.as_bytes());
    hasher.0.update(metadata.len().to_le_bytes());

    let mut buf = vec![0u8; READ_CHUNK];
    let mut read_total = 0u64;
    loop {
        let n = file.read(&mut buf).map_err(|e| Error::missing_input(e, path))?;
        if n == 0 {
            break;
        }
        hasher.0.update(&buf[..n]);
        read_total += n as u64;
    }
    // Trailer: a file that changed size mid-read hashes differently from either version
    hasher.0.update(read_total.to_le_bytes());
    Ok(())
}

/// Find top-level include directories referenced by C/C++ sources.
///
/// `#include <openssl/ssl.h>` yields `openssl`; includes without a directory
/// component are ignored. Discovery is advisory, so unreadable or non-UTF-8
/// files are skipped rather than failing.
#[must_use]
pub fn discover_include_dependencies(sources: &[PathBuf]) -> Vec<String> {
    let mut found = BTreeSet::new();
    for path in sources {
        let scanned = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| INCLUDE_SCAN_EXTENSIONS.contains(&ext));
        if !scanned {
            continue;
        }
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(path = %path.display(), "Skipping include scan: {e}");
                continue;
            }
        };
        for line in content.lines() {
            if let Some(target) = include_target(line)
                && let Some((dir, _)) = target.split_once('/')
                && !dir.is_empty()
            {
                found.insert(dir.to_string());
            }
        }
    }
    found.into_iter().collect()
}

fn include_target(line: &str) -> Option<&str> {
    let rest = line.trim().strip_prefix('#')?.trim_start();
    let rest = rest.strip_prefix("include")?.trim_start();
    let (open, close) = match rest.chars().next()? {
        '"' => ('"', '"'),
        '<' => ('<', '>'),
        _ => return None,
    };
    let inner = rest.strip_prefix(open)?;
    inner.find(close).map(|end| &inner[..end])
}
