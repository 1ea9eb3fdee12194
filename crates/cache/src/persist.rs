//! Crash-safe JSON persistence for the index and stats files

use crate::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

/// Serialize `value` and replace `path` with it atomically.
///
/// The bytes go to a temporary file in the same directory which is synced and
/// then renamed over `path`, so readers see either the old or the new file.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::configuration(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(dir).map_err(|e| Error::io(e, dir, "create_dir_all"))?;

    let json = serde_json::to_vec_pretty(value).map_err(|e| {
        Error::serialization(format!("Failed to encode {}: {e}", path.display()))
    })?;

    let mut tmp =
        tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::io(e, dir, "create_temp"))?;
    tmp.write_all(&json)
        .map_err(|e| Error::io(e, tmp.path(), "write"))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::io(e, tmp.path(), "sync"))?;
    tmp.persist(path)
        .map_err(|e| Error::io(e.error, path, "rename"))?;
    Ok(())
}

/// Read and decode a JSON file; `Ok(None)` when it does not exist
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io(e, path, "read")),
    };
    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|e| Error::serialization(format!("Failed to parse {}: {e}", path.display())))
}
