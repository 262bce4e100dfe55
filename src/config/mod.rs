//! Configuration module for reckon
//!
//! This module provides configuration management including:
//! - XDG-compliant path resolution
//! - Store names persisted in `config.json`

pub mod paths;
pub mod settings;

pub use paths::AppPaths;
pub use settings::Settings;
