//! User settings for reckon
//!
//! Names the stores that make up the app state. The defaults match the
//! names the app itself uses.

use serde::{Deserialize, Serialize};

use super::paths::AppPaths;
use crate::error::BackupError;

/// Settings for reckon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// File name of the live relational store inside the database directory
    #[serde(default = "default_database_name")]
    pub database_name: String,

    /// Name of the general preference store
    #[serde(default = "default_preferences_name")]
    pub preferences_name: String,

    /// Name of the highscore preference store
    #[serde(default = "default_highscore_name")]
    pub highscore_name: String,
}

fn default_database_name() -> String {
    "reckoning.db".to_string()
}

fn default_preferences_name() -> String {
    "preferences".to_string()
}

fn default_highscore_name() -> String {
    "pfa-math-highscore".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_name: default_database_name(),
            preferences_name: default_preferences_name(),
            highscore_name: default_highscore_name(),
        }
    }
}

impl Settings {
    /// Load settings from disk, or use defaults if the file doesn't exist
    pub fn load_or_create(paths: &AppPaths) -> Result<Self, BackupError> {
        let settings_path = paths.settings_file();

        if settings_path.exists() {
            let contents = std::fs::read_to_string(&settings_path)
                .map_err(|e| BackupError::Io(format!("Failed to read settings file: {}", e)))?;

            let settings: Settings = serde_json::from_str(&contents).map_err(|e| {
                BackupError::Config(format!("Failed to parse settings file: {}", e))
            })?;

            settings.validate()?;
            Ok(settings)
        } else {
            // Don't save yet - let caller decide when to persist
            Ok(Settings::default())
        }
    }

    /// Save settings to disk
    pub fn save(&self, paths: &AppPaths) -> Result<(), BackupError> {
        paths.ensure_directories()?;

        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| BackupError::Config(format!("Failed to serialize settings: {}", e)))?;

        std::fs::write(paths.settings_file(), contents)
            .map_err(|e| BackupError::Io(format!("Failed to write settings file: {}", e)))?;

        Ok(())
    }

    /// Reject store names that would escape their directory
    pub fn validate(&self) -> Result<(), BackupError> {
        for (field, name) in [
            ("database_name", &self.database_name),
            ("preferences_name", &self.preferences_name),
            ("highscore_name", &self.highscore_name),
        ] {
            if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
                return Err(BackupError::Config(format!(
                    "Invalid store name for {}: '{}'",
                    field, name
                )));
            }
        }

        if self.preferences_name == self.highscore_name {
            return Err(BackupError::Config(
                "preferences_name and highscore_name must differ".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.database_name, "reckoning.db");
        assert_eq!(settings.highscore_name, "pfa-math-highscore");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let paths = AppPaths::with_base_dir(temp_dir.path().to_path_buf());

        let mut settings = Settings::default();
        settings.database_name = "game.db".into();
        settings.save(&paths).unwrap();

        let loaded = Settings::load_or_create(&paths).unwrap();
        assert_eq!(loaded.database_name, "game.db");
        assert_eq!(loaded.preferences_name, "preferences");
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"database_name":"x.db"}"#).unwrap();
        assert_eq!(settings.database_name, "x.db");
        assert_eq!(settings.highscore_name, "pfa-math-highscore");
    }

    #[test]
    fn test_rejects_path_like_names() {
        let mut settings = Settings::default();
        settings.database_name = "../escape.db".into();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.highscore_name = settings.preferences_name.clone();
        assert!(settings.validate().is_err());
    }
}
