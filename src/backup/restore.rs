//! Backup restoration
//!
//! Reads an untrusted document in one streaming pass. The `database`
//! section is replayed into a fresh staging store inside a single
//! transaction; the preference sections are collected in editors. Nothing
//! live is touched until the whole document has been read. Then the staging
//! store is swapped over the live store with one rename and the editors are
//! committed.
//!
//! After a successful import every open handle on the stores is stale and
//! must be re-opened (or the process restarted).

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::de::{DeserializeSeed, Deserializer, MapAccess, Visitor};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{BackupError, BackupResult};
use crate::storage::database::set_user_version;
use crate::storage::{DatabaseStores, LiveState, PreferenceEditor, StagingStore};

use super::document::{
    ErrorSlot, CONTENT_KEY, DATABASE_SECTION, HIGHSCORE_SECTION, PREFERENCES_SECTION, SECTIONS,
    VERSION_KEY,
};
use super::schema::PreferenceSchema;
use super::snapshot::{ContentSeed, ReplayStats};

/// Result of a restore operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreOutcome {
    /// `user_version` applied to the restored relational store
    pub database_version: i64,
    pub tables: usize,
    pub rows: usize,
    /// Keys restored into the general preference store
    pub preferences: usize,
    /// Keys restored into the highscore store
    pub highscores: usize,
    /// False for a dry run
    pub applied: bool,
}

impl RestoreOutcome {
    /// Whether open store handles must be re-opened before further use
    pub fn requires_reopen(&self) -> bool {
        self.applied
    }

    /// Get a summary of what was restored
    pub fn summary(&self) -> String {
        let verb = if self.applied { "Restored" } else { "Validated" };
        format!(
            "{}: database v{} ({} tables, {} rows), {} preferences, {} highscore entries",
            verb, self.database_version, self.tables, self.rows, self.preferences, self.highscores
        )
    }
}

/// Restores backup documents into the live state
pub struct Importer<'a> {
    state: &'a LiveState,
}

impl<'a> Importer<'a> {
    pub fn new(state: &'a LiveState) -> Self {
        Self { state }
    }

    /// Restore the document read from `reader`
    ///
    /// On error the live relational store is exactly as before the call and
    /// no preference has been written.
    pub fn import<R: Read>(&self, reader: R) -> BackupResult<RestoreOutcome> {
        info!("Restore started");
        let staged = self.stage(reader)?;

        let mut outcome = staged.outcome();
        self.state.database.atomic_replace(staged.staging)?;
        info!(version = staged.version, "Database restored");

        outcome.preferences = staged.preferences.commit()?;
        outcome.highscores = staged.highscore.commit()?;
        outcome.applied = true;

        info!("{}", outcome.summary());
        Ok(outcome)
    }

    /// Read and stage the document fully, then throw the result away
    pub fn validate<R: Read>(&self, reader: R) -> BackupResult<RestoreOutcome> {
        let staged = self.stage(reader)?;
        let outcome = staged.outcome();
        debug!(staging = %staged.staging.name(), "Dry run, discarding staged state");
        Ok(outcome)
    }

    /// Restore from a document file
    pub fn import_file(&self, path: &Path) -> BackupResult<RestoreOutcome> {
        self.import(open_document(path)?)
    }

    /// Validate a document file without restoring it
    pub fn validate_file(&self, path: &Path) -> BackupResult<RestoreOutcome> {
        self.validate(open_document(path)?)
    }

    fn stage<R: Read>(&self, reader: R) -> BackupResult<StagedRestore<'a>> {
        let mut slot = ErrorSlot::default();
        let mut de = serde_json::Deserializer::from_reader(reader);

        let seed = RootSeed {
            stores: &self.state.database,
            preferences: self.state.preferences.edit(),
            highscore: self.state.highscore.edit(),
            slot: &mut slot,
        };

        seed.deserialize(&mut de)
            .and_then(|staged| {
                de.end()?;
                Ok(staged)
            })
            .map_err(|e| slot.resolve(e))
    }
}

fn open_document(path: &Path) -> BackupResult<BufReader<File>> {
    let file = File::open(path)
        .map_err(|e| BackupError::Io(format!("Failed to open {}: {}", path.display(), e)))?;
    Ok(BufReader::new(file))
}

/// Everything read from a document, not yet applied
struct StagedRestore<'a> {
    staging: StagingStore,
    version: i64,
    stats: ReplayStats,
    preferences: PreferenceEditor<'a>,
    highscore: PreferenceEditor<'a>,
}

impl StagedRestore<'_> {
    fn outcome(&self) -> RestoreOutcome {
        RestoreOutcome {
            database_version: self.version,
            tables: self.stats.tables,
            rows: self.stats.rows,
            preferences: self.preferences.len(),
            highscores: self.highscore.len(),
            applied: false,
        }
    }
}

struct RootSeed<'s, 'a> {
    stores: &'a DatabaseStores,
    preferences: PreferenceEditor<'a>,
    highscore: PreferenceEditor<'a>,
    slot: &'s mut ErrorSlot,
}

impl<'de, 'a> DeserializeSeed<'de> for RootSeed<'_, 'a> {
    type Value = StagedRestore<'a>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de, 'a> Visitor<'de> for RootSeed<'_, 'a> {
    type Value = StagedRestore<'a>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a backup document object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let RootSeed {
            stores,
            mut preferences,
            mut highscore,
            slot,
        } = self;

        let mut database = None;
        let mut seen = [false; 3];

        while let Some(key) = map.next_key::<String>()? {
            let Some(index) = SECTIONS.iter().position(|s| *s == key) else {
                return Err(slot.raise(BackupError::structural(format!(
                    "Can not parse type '{}'",
                    key
                ))));
            };
            if seen[index] {
                return Err(slot.raise(BackupError::structural(format!(
                    "Section '{}' appears more than once",
                    key
                ))));
            }
            seen[index] = true;

            match key.as_str() {
                DATABASE_SECTION => {
                    debug!("Reading database");
                    database = Some(map.next_value_seed(DatabaseSeed {
                        stores,
                        slot: &mut *slot,
                    })?);
                }
                PREFERENCES_SECTION => {
                    debug!("Reading preferences");
                    map.next_value_seed(PreferenceSeed {
                        schema: PreferenceSchema::general(),
                        editor: &mut preferences,
                        slot: &mut *slot,
                    })?;
                }
                _ => {
                    debug!("Reading highscores");
                    map.next_value_seed(PreferenceSeed {
                        schema: PreferenceSchema::highscore(),
                        editor: &mut highscore,
                        slot: &mut *slot,
                    })?;
                }
            }
        }

        if let Some(index) = seen.iter().position(|s| !s) {
            return Err(slot.raise(BackupError::structural(format!(
                "Missing section '{}'",
                SECTIONS[index]
            ))));
        }
        let Some((staging, version, stats)) = database else {
            return Err(slot.raise(BackupError::structural("Missing section 'database'")));
        };

        Ok(StagedRestore {
            staging,
            version,
            stats,
            preferences,
            highscore,
        })
    }
}

struct DatabaseSeed<'s> {
    stores: &'s DatabaseStores,
    slot: &'s mut ErrorSlot,
}

impl<'de> DeserializeSeed<'de> for DatabaseSeed<'_> {
    type Value = (StagingStore, i64, ReplayStats);

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for DatabaseSeed<'_> {
    type Value = (StagingStore, i64, ReplayStats);

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a database section object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let DatabaseSeed { stores, slot } = self;

        slot.expect_key(&mut map, VERSION_KEY)?;
        let version: i64 = map.next_value()?;
        // SQLite keeps user_version as a 32-bit signed integer
        if i32::try_from(version).is_err() {
            return Err(slot.raise(BackupError::structural(format!(
                "Database version {} out of range",
                version
            ))));
        }
        slot.expect_key(&mut map, CONTENT_KEY)?;

        let mut staging = stores
            .create_staging()
            .map_err(|e| slot.raise::<A::Error>(e))?;
        let mut stats = ReplayStats::default();
        {
            let conn = staging
                .connection()
                .map_err(|e| slot.raise::<A::Error>(e))?;
            let tx = conn
                .transaction()
                .map_err(|e| slot.raise::<A::Error>(BackupError::from(e)))?;
            set_user_version(&tx, version).map_err(|e| slot.raise::<A::Error>(e))?;

            debug!("Copying database contents");
            map.next_value_seed(ContentSeed::new(&tx, &mut *slot, &mut stats))?;

            tx.commit().map_err(|e| slot.raise::<A::Error>(BackupError::from(e)))?;
        }
        debug!(tables = stats.tables, rows = stats.rows, "Staged database content");

        if let Some(key) = map.next_key::<String>()? {
            return Err(slot.raise(BackupError::structural(format!(
                "Unknown value '{}' in database section",
                key
            ))));
        }
        Ok((staging, version, stats))
    }
}

struct PreferenceSeed<'s, 'a> {
    schema: PreferenceSchema,
    editor: &'s mut PreferenceEditor<'a>,
    slot: &'s mut ErrorSlot,
}

impl<'de> DeserializeSeed<'de> for PreferenceSeed<'_, '_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for PreferenceSeed<'_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a flat preference object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        let PreferenceSeed {
            schema,
            editor,
            slot,
        } = self;

        while let Some(key) = map.next_key::<String>()? {
            // Unknown keys fail before their value is read
            schema.expected_type(&key).map_err(|e| slot.raise::<A::Error>(e))?;
            let raw: serde_json::Value = map.next_value()?;
            let value = schema
                .coerce(&key, raw)
                .map_err(|e| slot.raise::<A::Error>(e))?;

            debug!(set = schema.set_name(), key = %key, "Staged preference");
            editor.put(key, value);
        }
        Ok(())
    }
}
