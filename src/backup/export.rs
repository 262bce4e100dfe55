//! Backup export
//!
//! Streams the live state into a backup document. Nothing is collected in
//! memory beyond one table row and the (small) preference maps.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::error::{BackupError, BackupResult};
use crate::storage::database::user_version;
use crate::storage::{write_atomic, LiveState, PrefValue, PreferenceStore};

use super::document::{
    CONTENT_KEY, DATABASE_SECTION, HIGHSCORE_SECTION, PREFERENCES_SECTION, VERSION_KEY,
};
use super::schema::PreferenceSchema;
use super::snapshot::{ContentWriter, SnapshotCounter, TableDump};

/// What an export wrote
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    /// `user_version` of the exported relational store
    pub database_version: i64,
    pub tables: usize,
    pub rows: usize,
    /// Keys written to the `preferences` section
    pub preferences: usize,
    /// Keys written to the `highscore` section
    pub highscores: usize,
}

impl ExportSummary {
    pub fn summary(&self) -> String {
        format!(
            "Exported database v{} ({} tables, {} rows), {} preferences, {} highscore entries",
            self.database_version, self.tables, self.rows, self.preferences, self.highscores
        )
    }
}

/// Writes backup documents from the live state
pub struct Exporter<'a> {
    state: &'a LiveState,
}

impl<'a> Exporter<'a> {
    pub fn new(state: &'a LiveState) -> Self {
        Self { state }
    }

    /// Stream a complete document into `writer`
    ///
    /// On error the bytes already written are not a valid document and must
    /// be discarded by the caller; [`export_to_file`](Self::export_to_file)
    /// does that itself.
    pub fn export<W: Write>(&self, writer: W) -> BackupResult<ExportSummary> {
        info!("Export started");

        // Preference values are checked before the first byte goes out
        let preferences = checked_entries(&self.state.preferences, PreferenceSchema::general())?;
        let highscore = checked_entries(&self.state.highscore, PreferenceSchema::highscore())?;

        let database = self.open_database()?;
        let version = match &database {
            Some(conn) => user_version(conn)?,
            None => 0,
        };

        let counter = SnapshotCounter::default();
        let document = DocumentWriter {
            database: DatabaseWriter {
                conn: database.as_ref(),
                version,
                counter: &counter,
            },
            preferences: &preferences,
            highscore: &highscore,
        };

        let mut serializer = serde_json::Serializer::new(writer);
        document.serialize(&mut serializer).map_err(|e| {
            if e.is_io() {
                BackupError::Io(format!("Failed to write backup document: {}", e))
            } else {
                BackupError::Storage(format!("Failed to read live state: {}", e))
            }
        })?;
        serializer
            .into_inner()
            .flush()
            .map_err(|e| BackupError::Io(format!("Failed to flush backup document: {}", e)))?;

        if let Some(conn) = database {
            conn.close().map_err(|(_, e)| {
                BackupError::Storage(format!("Failed to close relational store: {}", e))
            })?;
        }

        let summary = ExportSummary {
            database_version: version,
            tables: counter.tables(),
            rows: counter.rows(),
            preferences: preferences.len(),
            highscores: highscore.len(),
        };
        info!(
            version = summary.database_version,
            tables = summary.tables,
            rows = summary.rows,
            "Export finished"
        );
        Ok(summary)
    }

    /// Export into `path`, which only appears once the document is complete
    pub fn export_to_file(&self, path: &Path) -> BackupResult<ExportSummary> {
        write_atomic(path, |writer| self.export(writer))
    }

    fn open_database(&self) -> BackupResult<Option<Connection>> {
        let stores = &self.state.database;
        let name = stores.canonical_name();

        if !stores.exists(name) {
            debug!(store = %name, "No relational store yet, exporting empty content");
            return Ok(None);
        }
        stores.open_read_only(name).map(Some)
    }
}

/// File name for a document exported at `now`
pub fn timestamped_file_name(now: DateTime<Utc>) -> String {
    format!(
        "backup-{}-{:03}.json",
        now.format("%Y%m%d-%H%M%S"),
        now.timestamp_subsec_millis()
    )
}

/// Stored entries that the schema allows
///
/// Keys outside the schema could never be restored and are skipped; a known
/// key holding the wrong type means the store is corrupt.
fn checked_entries(
    store: &PreferenceStore,
    schema: PreferenceSchema,
) -> BackupResult<BTreeMap<String, PrefValue>> {
    let mut entries = store.load()?;

    entries.retain(|key, _| {
        let known = schema.expected_type(key).is_ok();
        if !known {
            warn!(store = %store.name(), key = %key, "Skipping preference outside the schema");
        }
        known
    });

    for (key, value) in &entries {
        schema.check(key, value)?;
    }
    Ok(entries)
}

struct DocumentWriter<'a> {
    database: DatabaseWriter<'a>,
    preferences: &'a BTreeMap<String, PrefValue>,
    highscore: &'a BTreeMap<String, PrefValue>,
}

impl Serialize for DocumentWriter<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        debug!("Writing database");
        map.serialize_entry(DATABASE_SECTION, &self.database)?;
        debug!("Writing preferences");
        map.serialize_entry(PREFERENCES_SECTION, self.preferences)?;
        debug!("Writing highscores");
        map.serialize_entry(HIGHSCORE_SECTION, self.highscore)?;
        map.end()
    }
}

struct DatabaseWriter<'a> {
    conn: Option<&'a Connection>,
    version: i64,
    counter: &'a SnapshotCounter,
}

impl Serialize for DatabaseWriter<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry(VERSION_KEY, &self.version)?;
        match self.conn {
            Some(conn) => {
                map.serialize_entry(CONTENT_KEY, &ContentWriter::new(conn, self.counter))?
            }
            None => map.serialize_entry(CONTENT_KEY, &Vec::<TableDump>::new())?,
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppPaths, Settings};
    use crate::storage::database::set_user_version;
    use tempfile::TempDir;

    fn create_test_state() -> (LiveState, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let paths = AppPaths::with_base_dir(temp_dir.path().to_path_buf());
        let state = LiveState::new(&paths, &Settings::default()).unwrap();
        (state, temp_dir)
    }

    fn seed_database(state: &LiveState, version: i64) {
        let conn = state.database.open(state.database.canonical_name()).unwrap();
        conn.execute_batch(
            "CREATE TABLE results (id INTEGER PRIMARY KEY, mode TEXT, correct INTEGER);
             INSERT INTO results (mode, correct) VALUES ('add', 9);
             INSERT INTO results (mode, correct) VALUES ('sub', 4);",
        )
        .unwrap();
        set_user_version(&conn, version).unwrap();
    }

    #[test]
    fn test_export_document_shape() {
        let (state, _temp) = create_test_state();
        seed_database(&state, 7);
        let mut editor = state.preferences.edit();
        editor.put_boolean("pref_switch_answer", true).put_string("weight", "2");
        editor.commit().unwrap();
        let mut editor = state.highscore.edit();
        editor.put_string("hs_add", "12").put_int("right_add", 40).put_boolean("continue", false);
        editor.commit().unwrap();

        let mut out = Vec::new();
        let summary = Exporter::new(&state).export(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with(r#"{"database":{"version":7,"content":[{"name":"results""#));
        assert!(text.contains(r#""rows":[[1,"add",9],[2,"sub",4]]"#));
        assert!(text.ends_with(
            r#""preferences":{"pref_switch_answer":true,"weight":"2"},"highscore":{"continue":false,"hs_add":"12","right_add":40}}"#
        ));
        assert!(!text.contains('\n'));

        assert_eq!(summary.database_version, 7);
        assert_eq!(summary.tables, 1);
        assert_eq!(summary.rows, 2);
        assert_eq!(summary.preferences, 2);
        assert_eq!(summary.highscores, 3);
    }

    #[test]
    fn test_export_without_database() {
        let (state, _temp) = create_test_state();

        let mut out = Vec::new();
        let summary = Exporter::new(&state).export(&mut out).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            r#"{"database":{"version":0,"content":[]},"preferences":{},"highscore":{}}"#
        );
        assert_eq!(summary.tables, 0);
        assert!(!state.database.canonical_path().exists());
    }

    #[test]
    fn test_export_skips_keys_outside_schema() {
        let (state, _temp) = create_test_state();
        let mut editor = state.preferences.edit();
        editor.put_string("weight", "1").put_int("first_launch", 1);
        editor.commit().unwrap();

        let mut out = Vec::new();
        let summary = Exporter::new(&state).export(&mut out).unwrap();

        assert_eq!(summary.preferences, 1);
        assert!(!String::from_utf8(out).unwrap().contains("first_launch"));
    }

    #[test]
    fn test_export_rejects_mistyped_known_key() {
        let (state, _temp) = create_test_state();
        let mut editor = state.preferences.edit();
        editor.put_int("weight", 3);
        editor.commit().unwrap();

        let mut out = Vec::new();
        let err = Exporter::new(&state).export(&mut out).unwrap_err();

        assert!(err.is_schema_violation());
        assert!(out.is_empty());
    }

    #[test]
    fn test_failed_export_leaves_no_file() {
        let (state, temp) = create_test_state();
        let mut editor = state.highscore.edit();
        editor.put_int("hs_add", 3);
        editor.commit().unwrap();

        let target = temp.path().join("backups").join("out.json");
        assert!(Exporter::new(&state).export_to_file(&target).is_err());
        assert!(!target.exists());
    }

    #[test]
    fn test_export_to_file() {
        let (state, temp) = create_test_state();
        seed_database(&state, 2);

        let target = temp.path().join("backups").join("out.json");
        let summary = Exporter::new(&state).export_to_file(&target).unwrap();

        assert_eq!(summary.rows, 2);
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&target).unwrap()).unwrap();
        assert_eq!(value["database"]["version"], 2);
    }

    #[test]
    fn test_timestamped_file_name() {
        let now = DateTime::parse_from_rfc3339("2025-11-27T14:30:22.456Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(timestamped_file_name(now), "backup-20251127-143022-456.json");
    }
}
