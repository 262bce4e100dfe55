//! Custom error types for reckon
//!
//! This module defines the error hierarchy for backup and restore using
//! thiserror for ergonomic error definitions.

use thiserror::Error;

/// The main error type for backup and restore operations
#[derive(Error, Debug)]
pub enum BackupError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors outside the stores and the document stream
    #[error("I/O error: {0}")]
    Io(String),

    /// Unexpected, missing or duplicated key, or wrong token type
    #[error("Structural error: {0}")]
    Structural(String),

    /// Key not in the preference schema, or value of the wrong type
    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    /// Failure opening, reading, writing or swapping a store
    #[error("Storage error: {0}")]
    Storage(String),

    /// Malformed or truncated document
    #[error("Stream error: {0}")]
    Stream(String),
}

impl BackupError {
    /// Create a structural error
    pub fn structural(msg: impl Into<String>) -> Self {
        Self::Structural(msg.into())
    }

    /// Create a schema violation for a key outside the schema
    pub fn unknown_key(set: &str, key: &str) -> Self {
        Self::SchemaViolation(format!("Unknown {} key '{}'", set, key))
    }

    /// Check if this is a structural error
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Structural(_))
    }

    /// Check if this is a schema violation
    pub fn is_schema_violation(&self) -> bool {
        matches!(self, Self::SchemaViolation(_))
    }

    /// Check if this is a storage error
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Check if this is a stream error
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    /// Classify a serde_json error raised while reading a document.
    ///
    /// Syntax, EOF and I/O failures mean the stream itself is bad; data
    /// errors mean a well-formed token arrived where another was expected.
    pub fn from_document(err: serde_json::Error) -> Self {
        use serde_json::error::Category;

        match err.classify() {
            Category::Io | Category::Syntax | Category::Eof => Self::Stream(err.to_string()),
            Category::Data => Self::Structural(err.to_string()),
        }
    }
}

// Implement From traits for common error types

impl From<std::io::Error> for BackupError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for BackupError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Result type alias for backup operations
pub type BackupResult<T> = Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BackupError::Config("test error".into());
        assert_eq!(err.to_string(), "Configuration error: test error");
    }

    #[test]
    fn test_unknown_key_error() {
        let err = BackupError::unknown_key("preferences", "unexpected_key");
        assert_eq!(
            err.to_string(),
            "Schema violation: Unknown preferences key 'unexpected_key'"
        );
        assert!(err.is_schema_violation());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: BackupError = io_err.into();
        assert!(matches!(err, BackupError::Io(_)));
    }

    #[test]
    fn test_from_rusqlite_error() {
        let err: BackupError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(err.is_storage());
    }

    #[test]
    fn test_document_error_classification() {
        let syntax = serde_json::from_str::<serde_json::Value>("{\"a\":").unwrap_err();
        assert!(BackupError::from_document(syntax).is_stream());

        let data = serde_json::from_str::<i64>("\"seven\"").unwrap_err();
        assert!(BackupError::from_document(data).is_structural());
    }
}
