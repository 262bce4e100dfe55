//! Preference stores
//!
//! A preference store is a named, flat key/value map persisted as one JSON
//! object in `<prefs_dir>/<name>.json`. Writes go through an editor that
//! collects puts in memory and applies them all at once on `commit`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::BackupError;

use super::file_io::{read_json, write_json_atomic};

/// Primitive type of a preference value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefType {
    Boolean,
    Integer,
    String,
}

impl fmt::Display for PrefType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrefType::Boolean => write!(f, "boolean"),
            PrefType::Integer => write!(f, "integer"),
            PrefType::String => write!(f, "string"),
        }
    }
}

/// A single preference value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrefValue {
    Boolean(bool),
    Integer(i64),
    String(String),
}

impl PrefValue {
    /// The primitive type of this value
    pub fn pref_type(&self) -> PrefType {
        match self {
            PrefValue::Boolean(_) => PrefType::Boolean,
            PrefValue::Integer(_) => PrefType::Integer,
            PrefValue::String(_) => PrefType::String,
        }
    }
}

/// A named preference store on disk
#[derive(Debug, Clone)]
pub struct PreferenceStore {
    name: String,
    path: PathBuf,
}

impl PreferenceStore {
    /// Create a handle for the store `name` inside `dir`
    pub fn new(dir: PathBuf, name: impl Into<String>) -> Self {
        let name = name.into();
        let path = dir.join(format!("{}.json", name));
        Self { name, path }
    }

    /// Store name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing file
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Read every stored entry, empty if the store was never written
    pub fn load(&self) -> Result<BTreeMap<String, PrefValue>, BackupError> {
        read_json(&self.path)
    }

    /// Start an edit session
    pub fn edit(&self) -> PreferenceEditor<'_> {
        PreferenceEditor {
            store: self,
            pending: BTreeMap::new(),
        }
    }
}

/// Pending changes to a [`PreferenceStore`]
///
/// Nothing reaches disk until [`commit`](Self::commit). Dropping the editor
/// discards the pending puts.
#[derive(Debug)]
pub struct PreferenceEditor<'a> {
    store: &'a PreferenceStore,
    pending: BTreeMap<String, PrefValue>,
}

impl<'a> PreferenceEditor<'a> {
    pub fn put_string(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.put(key, PrefValue::String(value.into()))
    }

    pub fn put_int(&mut self, key: impl Into<String>, value: i64) -> &mut Self {
        self.put(key, PrefValue::Integer(value))
    }

    pub fn put_boolean(&mut self, key: impl Into<String>, value: bool) -> &mut Self {
        self.put(key, PrefValue::Boolean(value))
    }

    /// Put an already typed value
    pub fn put(&mut self, key: impl Into<String>, value: PrefValue) -> &mut Self {
        self.pending.insert(key.into(), value);
        self
    }

    /// Number of pending puts
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Merge the pending puts onto the stored entries and write the store
    ///
    /// Keys not touched by this editor keep their stored value. An editor
    /// without puts writes nothing.
    pub fn commit(self) -> Result<usize, BackupError> {
        if self.is_empty() {
            return Ok(0);
        }

        let mut entries = self.store.load()?;
        let count = self.pending.len();
        entries.extend(self.pending);

        write_json_atomic(&self.store.path, &entries).map_err(|e| {
            BackupError::Storage(format!(
                "Failed to commit preference store '{}': {}",
                self.store.name, e
            ))
        })?;

        debug!(store = %self.store.name, keys = count, "Committed preference store");
        Ok(count)
    }
}
