//! Backup export and restore
//!
//! Serializes the whole persisted state (one SQLite relational store plus
//! the general and highscore preference stores) into a single JSON document
//! and restores it again.
//!
//! # Architecture
//!
//! - `Exporter`: streams the live state into a document
//! - `Importer`: reads a document, stages the relational store and swaps it
//!   into place only once the whole document is known to be good
//! - `PreferenceSchema`: closed key/type schemas of the preference sets
//!
//! # Document Format
//!
//! - `database.version`: `user_version` of the relational store
//! - `database.content`: one dump per table (`name`, `sql`, `columns`,
//!   `rows`, optional `seq` and `objects`); views follow the tables
//! - `preferences`: flat map of general preference keys
//! - `highscore`: flat map of highscore keys
//!
//! # Example
//!
//! ```rust,ignore
//! use reckon::backup::{Exporter, Importer};
//! use reckon::config::{AppPaths, Settings};
//! use reckon::storage::LiveState;
//!
//! let paths = AppPaths::new()?;
//! let settings = Settings::load_or_create(&paths)?;
//! let state = LiveState::new(&paths, &settings)?;
//!
//! Exporter::new(&state).export_to_file(&target)?;
//!
//! // Later, restore it; open handles must be re-opened afterwards
//! let outcome = Importer::new(&state).import_file(&target)?;
//! println!("{}", outcome.summary());
//! ```

mod document;
mod export;
mod restore;
mod schema;
mod snapshot;

pub use document::{DATABASE_SECTION, SECTIONS};
pub use export::{timestamped_file_name, ExportSummary, Exporter};
pub use restore::{Importer, RestoreOutcome};
pub use schema::{KeyRule, PreferenceSchema, HIGHSCORE_SECTION, PREFERENCES_SECTION};
pub use snapshot::{read_all, write_all, CellValue, RelationalSnapshot, TableDump};
