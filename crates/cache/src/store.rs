//! Filesystem-backed artifact storage
//!
//! Each cached build lives in `cache_root/<fingerprint>/` as a verbatim copy
//! of the tree the build produced. New entries are assembled under
//! `cache_root/.staging/` and renamed into place, so other readers (including
//! other processes sharing the cache root) observe either the complete entry
//! or nothing.

use crate::fingerprint::Fingerprint;
use crate::{Error, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Directory under the cache root holding in-flight writes
pub const STAGING_DIR: &str = ".staging";

/// A tree that was just copied into the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Materialized {
    /// Entry directory
    pub path: PathBuf,
    /// Bytes copied, i.e. the size of the stored tree
    pub size_bytes: u64,
}

/// Stores artifact trees keyed by fingerprint
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Create a store rooted at `root` (created lazily on first write)
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The cache root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the entry for `fingerprint` lives, whether or not it exists
    #[must_use]
    pub fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(fingerprint.as_str())
    }

    fn staging_root(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    fn staging_dir(&self, fingerprint: &Fingerprint, purpose: &str) -> Result<tempfile::TempDir> {
        let staging = self.staging_root();
        fs::create_dir_all(&staging).map_err(|e| Error::io(e, &staging, "create_dir_all"))?;
        tempfile::Builder::new()
            .prefix(&format!("{}.{purpose}.", fingerprint.as_str()))
            .tempdir_in(&staging)
            .map_err(|e| Error::io(e, &staging, "create_staging"))
    }

    /// Copy `source` into the store under `fingerprint`.
    ///
    /// The tree is copied into a staging directory and renamed into place. An
    /// existing entry for the same fingerprint is swapped out first. On failure
    /// the staging directory is removed and the previous entry (if any) is left
    /// where it was.
    ///
    /// # Errors
    ///
    /// Returns an error if `source` is not a directory or any copy, rename or
    /// directory creation fails.
    pub fn materialize(&self, fingerprint: &Fingerprint, source: &Path) -> Result<Materialized> {
        let meta = fs::metadata(source).map_err(|e| Error::io(e, source, "metadata"))?;
        if !meta.is_dir() {
            return Err(Error::validation(format!(
                "Artifact source {} is not a directory",
                source.display()
            )));
        }

        let staged = self.staging_dir(fingerprint, "new")?;
        let (files, size_bytes) = copy_tree(source, staged.path())?;

        let target = self.entry_path(fingerprint);
        if target.exists() {
            self.replace_existing(fingerprint, staged.path(), &target)?;
        } else {
            fs::rename(staged.path(), &target).map_err(|e| Error::io(e, &target, "rename"))?;
        }
        // Renamed away; nothing left for the guard to clean up
        let _ = staged.keep();

        debug!(
            fingerprint = %fingerprint.short(),
            files,
            size_bytes,
            path = %target.display(),
            "Materialized artifacts"
        );
        Ok(Materialized {
            path: target,
            size_bytes,
        })
    }

    fn replace_existing(
        &self,
        fingerprint: &Fingerprint,
        staged: &Path,
        target: &Path,
    ) -> Result<()> {
        let trash = self.staging_dir(fingerprint, "old")?;
        let displaced = trash.path().join("entry");
        fs::rename(target, &displaced).map_err(|e| Error::io(e, target, "rename"))?;

        if let Err(e) = fs::rename(staged, target) {
            if let Err(restore) = fs::rename(&displaced, target) {
                warn!(
                    fingerprint = %fingerprint.short(),
                    "Failed to restore previous entry: {restore}"
                );
            }
            return Err(Error::io(e, target, "rename"));
        }
        // `trash` drops here and deletes the displaced entry
        Ok(())
    }

    /// Path of the stored entry, or `None` if it is not on disk.
    ///
    /// This existence check is the authoritative hit/miss signal.
    #[must_use]
    pub fn retrieve(&self, fingerprint: &Fingerprint) -> Option<PathBuf> {
        let path = self.entry_path(fingerprint);
        path.is_dir().then_some(path)
    }

    /// Delete an entry. Returns `Ok(false)` if it was already absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    pub fn remove(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let path = self.entry_path(fingerprint);
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                debug!(fingerprint = %fingerprint.short(), "Removed artifact directory");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::io(e, &path, "remove_dir_all")),
        }
    }

    /// Recursive size in bytes of the regular files in an entry
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the entry is absent, or an I/O error if
    /// the tree cannot be walked.
    pub fn size_of(&self, fingerprint: &Fingerprint) -> Result<u64> {
        let path = self
            .retrieve(fingerprint)
            .ok_or_else(|| Error::not_found(fingerprint.as_str()))?;
        directory_size(&path)
    }

    /// Fingerprints of every entry directory currently on disk
    ///
    /// # Errors
    ///
    /// Returns an error if the cache root exists but cannot be listed.
    pub fn list(&self) -> Result<Vec<Fingerprint>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(e, &self.root, "read_dir")),
        };

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(e, &self.root, "read_dir_entry"))?;
            if !entry.path().is_dir() {
                continue;
            }
            // Staging and anything else that is not a digest is ignored
            if let Some(fp) = entry
                .file_name()
                .to_str()
                .and_then(|name| Fingerprint::from_hex(name).ok())
                .filter(|fp| Some(fp.as_str()) == entry.file_name().to_str())
            {
                found.push(fp);
            }
        }
        found.sort();
        Ok(found)
    }

    /// Remove staging leftovers at least `older_than` old (e.g. from a crashed
    /// writer). Returns how many were removed.
    pub fn sweep_staging(&self, older_than: Duration) -> usize {
        let staging = self.staging_root();
        let Ok(entries) = fs::read_dir(&staging) else {
            return 0;
        };
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.filter_map(|e| e.ok()) {
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age >= older_than);
            if !stale {
                continue;
            }
            let path = entry.path();
            match fs::remove_dir_all(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), "Failed to sweep staging leftover: {e}"),
            }
        }
        if removed > 0 {
            debug!(removed, "Swept stale staging directories");
        }
        removed
    }
}

/// Copy every file under `src` into `dst`, returning files and bytes copied
fn copy_tree(src: &Path, dst: &Path) -> Result<(usize, u64)> {
    let mut files = 0usize;
    let mut bytes = 0u64;
    for entry in walkdir::WalkDir::new(src).follow_links(true) {
        let entry = entry.map_err(|e| Error::io(e.into(), src, "walk"))?;
        let p = entry.path();
        let rel = p.strip_prefix(src).map_err(|_| {
            Error::configuration(format!(
                "path {} is not under artifact root {}",
                p.display(),
                src.display()
            ))
        })?;
        let out = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&out).map_err(|e| Error::io(e, &out, "create_dir_all"))?;
        } else {
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
            }
            bytes += fs::copy(p, &out).map_err(|e| Error::io(e, &out, "copy"))?;
            files += 1;
        }
    }
    Ok((files, bytes))
}

/// Sum of regular-file sizes below `path`
pub(crate) fn directory_size(path: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in walkdir::WalkDir::new(path) {
        let entry = entry.map_err(|e| Error::io(e.into(), path, "walk"))?;
        if entry.file_type().is_file() {
            let meta = entry
                .metadata()
                .map_err(|e| Error::io(e.into(), entry.path(), "metadata"))?;
            total += meta.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fp(c: char) -> Fingerprint {
        Fingerprint::from_hex(c.to_string().repeat(64)).unwrap()
    }

    fn build_output() -> TempDir {
        let out = TempDir::new().unwrap();
        fs::create_dir_all(out.path().join("lib")).unwrap();
        fs::write(out.path().join("lib/libssl.a"), b"archive-bytes").unwrap();
        fs::write(out.path().join("VERSION"), b"3.5.2").unwrap();
        out
    }

    #[test]
    fn materialize_and_retrieve_roundtrip() {
        let cache = TempDir::new().unwrap();
        let store = ArtifactStore::new(cache.path());
        let out = build_output();

        let stored = store.materialize(&fp('a'), out.path()).unwrap();
        let path = stored.path.clone();
        assert_eq!(store.retrieve(&fp('a')), Some(path.clone()));
        assert_eq!(stored.size_bytes, store.size_of(&fp('a')).unwrap());
        assert_eq!(fs::read(path.join("lib/libssl.a")).unwrap(), b"archive-bytes");
        assert_eq!(fs::read(path.join("VERSION")).unwrap(), b"3.5.2");
    }

    #[test]
    fn materialize_leaves_no_staging_behind() {
        let cache = TempDir::new().unwrap();
        let store = ArtifactStore::new(cache.path());
        let out = build_output();
        store.materialize(&fp('a'), out.path()).unwrap();

        let leftovers: Vec<_> = fs::read_dir(cache.path().join(STAGING_DIR))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn materialize_replaces_existing_entry() {
        let cache = TempDir::new().unwrap();
        let store = ArtifactStore::new(cache.path());
        let first = build_output();
        store.materialize(&fp('a'), first.path()).unwrap();

        let second = TempDir::new().unwrap();
        fs::write(second.path().join("only.txt"), b"second").unwrap();
        let path = store.materialize(&fp('a'), second.path()).unwrap().path;

        assert_eq!(fs::read(path.join("only.txt")).unwrap(), b"second");
        assert!(!path.join("VERSION").exists());
    }

    #[test]
    fn materialize_missing_source_fails_cleanly() {
        let cache = TempDir::new().unwrap();
        let store = ArtifactStore::new(cache.path());
        let err = store
            .materialize(&fp('b'), &cache.path().join("no-such-output"))
            .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert!(store.retrieve(&fp('b')).is_none());
    }

    #[test]
    fn materialize_file_source_is_rejected() {
        let cache = TempDir::new().unwrap();
        let store = ArtifactStore::new(cache.path());
        let file = cache.path().join("artifact.bin");
        fs::write(&file, b"x").unwrap();
        let err = store.materialize(&fp('b'), &file).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn materialize_fails_when_staging_is_blocked() {
        let cache = TempDir::new().unwrap();
        // A plain file where the staging directory should be
        fs::write(cache.path().join(STAGING_DIR), b"in the way").unwrap();
        let store = ArtifactStore::new(cache.path());
        let out = build_output();

        assert!(store.materialize(&fp('c'), out.path()).is_err());
        assert!(!cache.path().join(fp('c').as_str()).exists());
    }

    #[test]
    fn remove_is_idempotent() {
        let cache = TempDir::new().unwrap();
        let store = ArtifactStore::new(cache.path());
        let out = build_output();
        store.materialize(&fp('d'), out.path()).unwrap();

        assert!(store.remove(&fp('d')).unwrap());
        assert!(!store.remove(&fp('d')).unwrap());
        assert!(store.retrieve(&fp('d')).is_none());
    }

    #[test]
    fn size_of_counts_nested_files() {
        let cache = TempDir::new().unwrap();
        let store = ArtifactStore::new(cache.path());
        let out = build_output();
        store.materialize(&fp('e'), out.path()).unwrap();

        let expected = (b"archive-bytes".len() + b"3.5.2".len()) as u64;
        assert_eq!(store.size_of(&fp('e')).unwrap(), expected);
        assert!(matches!(
            store.size_of(&fp('f')).unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[test]
    fn list_reports_only_fingerprint_directories() {
        let cache = TempDir::new().unwrap();
        let store = ArtifactStore::new(cache.path());
        let out = build_output();
        store.materialize(&fp('2'), out.path()).unwrap();
        store.materialize(&fp('1'), out.path()).unwrap();
        fs::create_dir_all(cache.path().join("not-a-fingerprint")).unwrap();
        fs::write(cache.path().join("build_index.json"), b"{}").unwrap();

        assert_eq!(store.list().unwrap(), vec![fp('1'), fp('2')]);
    }

    #[test]
    fn list_on_missing_root_is_empty() {
        let cache = TempDir::new().unwrap();
        let store = ArtifactStore::new(cache.path().join("never-created"));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn sweep_staging_respects_age() {
        let cache = TempDir::new().unwrap();
        let store = ArtifactStore::new(cache.path());
        let leftover = cache.path().join(STAGING_DIR).join("crashed.new.x");
        fs::create_dir_all(&leftover).unwrap();

        assert_eq!(store.sweep_staging(Duration::from_secs(3600)), 0);
        assert!(leftover.exists());
        assert_eq!(store.sweep_staging(Duration::ZERO), 1);
        assert!(!leftover.exists());
    }
}
