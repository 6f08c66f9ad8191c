//! Crash-safe JSON state files.
//!
//! Writes go to `<path>.tmp`, are synced, then renamed over the target so a
//! reader never observes a partially written file.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::{Error, Result};

/// Serialize `value` and atomically replace the file at `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| persistence_error(parent, e))?;
        }
    }

    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp_path).map_err(|e| persistence_error(&tmp_path, e))?;
        file.write_all(&bytes)
            .map_err(|e| persistence_error(&tmp_path, e))?;
        file.sync_all().map_err(|e| persistence_error(&tmp_path, e))?;
    }

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        persistence_error(path, e)
    })?;

    debug!(path = %path.display(), bytes = bytes.len(), "State written");
    Ok(())
}

/// Read a JSON state file. A missing file is `Ok(None)`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(persistence_error(path, e)),
    };
    let value = serde_json::from_slice(&bytes)?;
    Ok(Some(value))
}

fn persistence_error(path: &Path, err: std::io::Error) -> Error {
    Error::Persistence {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}
