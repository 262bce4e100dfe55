//! File I/O utilities with atomic writes
//!
//! Provides safe file operations that won't leave a half-written file at
//! the destination path on failure.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::BackupError;

/// Read JSON from a file, returning a default value if file doesn't exist
pub fn read_json<T, P>(path: P) -> Result<T, BackupError>
where
    T: DeserializeOwned + Default,
    P: AsRef<Path>,
{
    let path = path.as_ref();

    if !path.exists() {
        return Ok(T::default());
    }

    let file = File::open(path)
        .map_err(|e| BackupError::Storage(format!("Failed to open {}: {}", path.display(), e)))?;

    let reader = BufReader::new(file);
    serde_json::from_reader(reader)
        .map_err(|e| BackupError::Storage(format!("Failed to parse {}: {}", path.display(), e)))
}

/// Write JSON to a file atomically (write to temp, then rename)
pub fn write_json_atomic<T, P>(path: P, data: &T) -> Result<(), BackupError>
where
    T: Serialize,
    P: AsRef<Path>,
{
    write_atomic(path, |writer| {
        serde_json::to_writer_pretty(writer, data)
            .map_err(|e| BackupError::Storage(format!("Failed to serialize data: {}", e)))
    })
}

/// Stream content into `path` through a temp file in the same directory.
///
/// The destination is only created or replaced once `fill` succeeded and
/// the data is synced; on any failure the temp file is removed and the
/// destination is left as it was.
pub fn write_atomic<P, F, R>(path: P, fill: F) -> Result<R, BackupError>
where
    P: AsRef<Path>,
    F: FnOnce(&mut BufWriter<File>) -> Result<R, BackupError>,
{
    let path = path.as_ref();

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| {
            BackupError::Io(format!(
                "Failed to create directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    // Same directory, so the final rename stays on one filesystem
    let temp_path = temp_path_for(path);

    let file = File::create(&temp_path)
        .map_err(|e| BackupError::Io(format!("Failed to create temp file: {}", e)))?;
    let mut writer = BufWriter::new(file);

    let result = fill(&mut writer).and_then(|value| {
        writer
            .flush()
            .map_err(|e| BackupError::Io(format!("Failed to flush data: {}", e)))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| BackupError::Io(format!("Failed to sync data: {}", e)))?;
        Ok(value)
    });

    let value = match result {
        Ok(value) => value,
        Err(err) => {
            drop(writer);
            let _ = fs::remove_file(&temp_path);
            return Err(err);
        }
    };
    drop(writer);

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        BackupError::Io(format!("Failed to rename temp file: {}", e))
    })?;

    Ok(value)
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
