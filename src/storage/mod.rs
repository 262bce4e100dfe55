//! Storage layer for reckon
//!
//! The live app state is one SQLite relational store plus two preference
//! stores. [`LiveState`] bundles the handles an export or restore works on.

pub mod database;
pub mod file_io;
pub mod preferences;

pub use database::{DatabaseStores, StagingStore};
pub use file_io::{read_json, write_atomic, write_json_atomic};
pub use preferences::{PrefType, PrefValue, PreferenceEditor, PreferenceStore};

use crate::config::{AppPaths, Settings};
use crate::error::BackupError;

/// Handles to every store that makes up the app state
#[derive(Debug, Clone)]
pub struct LiveState {
    pub database: DatabaseStores,
    pub preferences: PreferenceStore,
    pub highscore: PreferenceStore,
}

impl LiveState {
    /// Create handles for the stores named in `settings`
    pub fn new(paths: &AppPaths, settings: &Settings) -> Result<Self, BackupError> {
        paths.ensure_directories()?;

        Ok(Self {
            database: DatabaseStores::new(paths.database_dir(), &settings.database_name),
            preferences: PreferenceStore::new(paths.prefs_dir(), &settings.preferences_name),
            highscore: PreferenceStore::new(paths.prefs_dir(), &settings.highscore_name),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_live_state_creation() {
        let temp_dir = TempDir::new().unwrap();
        let paths = AppPaths::with_base_dir(temp_dir.path().to_path_buf());
        let state = LiveState::new(&paths, &Settings::default()).unwrap();

        assert!(temp_dir.path().join("databases").exists());
        assert!(temp_dir.path().join("shared_prefs").exists());
        assert_eq!(
            state.database.canonical_path(),
            temp_dir.path().join("databases").join("reckoning.db")
        );
        assert_eq!(
            state.highscore.path(),
            &temp_dir.path().join("shared_prefs").join("pfa-math-highscore.json")
        );
    }
}
