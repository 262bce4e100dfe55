//! Relational store files
//!
//! Every relational store is a SQLite file in one directory. The live store
//! sits at a canonical name; a restore builds a uniquely named staging store
//! next to it and swaps it into place with a single rename.

use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{BackupError, BackupResult};

/// Side files SQLite may keep next to a database file
const SIDE_FILE_SUFFIXES: [&str; 3] = ["-journal", "-wal", "-shm"];

/// Directory of SQLite stores with one canonical (live) store
#[derive(Debug, Clone)]
pub struct DatabaseStores {
    dir: PathBuf,
    canonical: String,
}

impl DatabaseStores {
    pub fn new(dir: PathBuf, canonical: impl Into<String>) -> Self {
        Self {
            dir,
            canonical: canonical.into(),
        }
    }

    /// Name of the live store
    pub fn canonical_name(&self) -> &str {
        &self.canonical
    }

    /// Path of the store `name`
    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Path of the live store
    pub fn canonical_path(&self) -> PathBuf {
        self.path_of(&self.canonical)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_of(name).exists()
    }

    /// Open (creating if needed) a store for reading and writing
    pub fn open(&self, name: &str) -> BackupResult<Connection> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            BackupError::Storage(format!(
                "Failed to create database directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let path = self.path_of(name);
        Connection::open(&path).map_err(|e| {
            BackupError::Storage(format!("Failed to open {}: {}", path.display(), e))
        })
    }

    /// Open an existing store without write access
    pub fn open_read_only(&self, name: &str) -> BackupResult<Connection> {
        let path = self.path_of(name);
        Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| BackupError::Storage(format!("Failed to open {}: {}", path.display(), e)))
    }

    /// Create a fresh, uniquely named staging store
    pub fn create_staging(&self) -> BackupResult<StagingStore> {
        let name = format!("restore-{}.db", Uuid::new_v4());
        let conn = self.open(&name)?;
        debug!(staging = %name, "Created staging store");

        Ok(StagingStore {
            path: self.path_of(&name),
            name,
            conn: Some(conn),
            consumed: false,
        })
    }

    /// Delete a store and its side files; a missing store is not an error
    pub fn delete_store(&self, name: &str) -> BackupResult<()> {
        remove_store_files(&self.path_of(name))
    }

    /// Move a committed staging store over the live store
    ///
    /// The live store is checkpointed first so its main file holds every
    /// committed page. The swap itself is one rename; only once it succeeded
    /// are the old side files removed. On failure the live store is intact.
    pub fn atomic_replace(&self, mut staging: StagingStore) -> BackupResult<()> {
        if let Some(conn) = staging.conn.take() {
            conn.close().map_err(|(_, e)| {
                BackupError::Storage(format!("Failed to close staging store: {}", e))
            })?;
        }

        let target = self.canonical_path();
        self.checkpoint_live()?;

        fs::rename(&staging.path, &target).map_err(|e| {
            BackupError::Storage(format!(
                "Failed to move {} to {}: {}",
                staging.path.display(),
                target.display(),
                e
            ))
        })?;
        staging.consumed = true;

        // Leftovers of the old live store and of the staging file
        for suffix in SIDE_FILE_SUFFIXES {
            remove_if_exists(&side_file(&target, suffix))?;
            remove_if_exists(&side_file(&staging.path, suffix))?;
        }

        debug!(staging = %staging.name, target = %target.display(), "Swapped staging store into place");
        Ok(())
    }

    /// Fold the live store's journal or WAL back into its main file
    fn checkpoint_live(&self) -> BackupResult<()> {
        let target = self.canonical_path();
        if !target.is_file() {
            return Ok(());
        }

        let conn = self.open(&self.canonical)?;
        // Reading the header rolls back a hot journal
        user_version(&conn)?;
        let busy: i64 = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| row.get(0))?;
        conn.close().map_err(|(_, e)| {
            BackupError::Storage(format!("Failed to close live store: {}", e))
        })?;

        if busy != 0 {
            return Err(BackupError::Storage(format!(
                "Live store {} is busy, close other connections and retry",
                target.display()
            )));
        }
        Ok(())
    }
}

/// A staging store owned by a running restore
///
/// Dropping a staging store that was never swapped into place closes it and
/// deletes its files.
#[derive(Debug)]
pub struct StagingStore {
    name: String,
    path: PathBuf,
    conn: Option<Connection>,
    consumed: bool,
}

impl StagingStore {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Connection to the staging store
    pub fn connection(&mut self) -> BackupResult<&mut Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| BackupError::Storage("Staging store is already closed".into()))
    }
}

impl Drop for StagingStore {
    fn drop(&mut self) {
        if self.consumed {
            return;
        }

        // Close before unlinking so no handle outlives the file
        drop(self.conn.take());
        if let Err(e) = remove_store_files(&self.path) {
            warn!(staging = %self.name, error = %e, "Failed to delete staging store");
        } else {
            debug!(staging = %self.name, "Discarded staging store");
        }
    }
}

/// Read `PRAGMA user_version`
pub fn user_version(conn: &Connection) -> BackupResult<i64> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Write `PRAGMA user_version`
pub fn set_user_version(conn: &Connection, version: i64) -> BackupResult<()> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

fn side_file(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_store_files(path: &Path) -> BackupResult<()> {
    remove_if_exists(path)?;
    for suffix in SIDE_FILE_SUFFIXES {
        remove_if_exists(&side_file(path, suffix))?;
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> BackupResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BackupError::Storage(format!(
            "Failed to delete {}: {}",
            path.display(),
            e
        ))),
    }
}
