//! reckon - backup export and restore for a math trainer's persisted state
//!
//! The app keeps its state in one SQLite relational store and two key/value
//! preference stores. This library serializes all three into a single JSON
//! document and restores them from one, replacing the relational store
//! atomically.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - `config`: Configuration and path management
//! - `error`: Custom error types
//! - `logging`: `tracing` subscriber setup for the binary
//! - `storage`: Relational and preference stores
//! - `backup`: Document export, restore and preference schemas
//! - `cli`: Command handlers
//!
//! # Example
//!
//! ```rust,ignore
//! use reckon::config::{AppPaths, Settings};
//! use reckon::storage::LiveState;
//!
//! let paths = AppPaths::new()?;
//! let settings = Settings::load_or_create(&paths)?;
//! let state = LiveState::new(&paths, &settings)?;
//! ```

pub mod backup;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod storage;

pub use error::{BackupError, BackupResult};
