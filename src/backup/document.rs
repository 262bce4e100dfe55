//! Backup document layout
//!
//! A document is one compact JSON object with exactly three sections:
//!
//! ```json
//! {"database":{"version":7,"content":[...]},"preferences":{...},"highscore":{...}}
//! ```
//!
//! Sections are written in that order and accepted in any order.

use serde::de::{self, MapAccess};

use crate::error::BackupError;

pub const DATABASE_SECTION: &str = "database";
pub const VERSION_KEY: &str = "version";
pub const CONTENT_KEY: &str = "content";

pub use super::schema::{HIGHSCORE_SECTION, PREFERENCES_SECTION};

/// Top-level sections in write order
pub const SECTIONS: [&str; 3] = [DATABASE_SECTION, PREFERENCES_SECTION, HIGHSCORE_SECTION];

/// Holds the typed error behind a serde error raised while reading
///
/// serde visitors can only return the format's error type. Raising through
/// the slot keeps the [`BackupError`] so the caller can report the right
/// category once the error surfaces.
#[derive(Debug, Default)]
pub struct ErrorSlot(Option<BackupError>);

impl ErrorSlot {
    /// Remember `err` and turn it into a deserializer error
    pub fn raise<E: de::Error>(&mut self, err: BackupError) -> E {
        let message = err.to_string();
        self.0.get_or_insert(err);
        E::custom(message)
    }

    /// The typed error behind `err`, or a classification of `err` itself
    pub fn resolve(&mut self, err: serde_json::Error) -> BackupError {
        self.0
            .take()
            .unwrap_or_else(|| BackupError::from_document(err))
    }

    /// Require the next map key to be exactly `expected`
    pub fn expect_key<'de, A: MapAccess<'de>>(
        &mut self,
        map: &mut A,
        expected: &str,
    ) -> Result<(), A::Error> {
        match map.next_key::<String>()? {
            Some(key) if key == expected => Ok(()),
            Some(key) => Err(self.raise(BackupError::structural(format!(
                "Unknown value '{}', expected '{}'",
                key, expected
            )))),
            None => Err(self.raise(BackupError::structural(format!(
                "Missing key '{}'",
                expected
            )))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::de::Deserializer;

    #[test]
    fn test_raise_keeps_first_error() {
        let mut slot = ErrorSlot::default();
        let _: serde_json::Error = slot.raise(BackupError::unknown_key("preferences", "a"));
        let err: serde_json::Error = slot.raise(BackupError::structural("later"));

        assert!(slot.resolve(err).is_schema_violation());
    }

    #[test]
    fn test_resolve_without_raise_classifies() {
        let mut slot = ErrorSlot::default();
        let err = serde_json::from_str::<serde_json::Value>("[1,").unwrap_err();
        assert!(slot.resolve(err).is_stream());
    }

    struct KeySeed<'a>(&'a mut ErrorSlot);

    impl<'de> de::Visitor<'de> for KeySeed<'_> {
        type Value = ();

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a map")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
            let slot = self.0;
            slot.expect_key(&mut map, VERSION_KEY)?;
            map.next_value::<i64>()?;
            Ok(())
        }
    }

    #[test]
    fn test_expect_key() {
        let mut slot = ErrorSlot::default();
        let mut de = serde_json::Deserializer::from_str(r#"{"version":1}"#);
        assert!(de.deserialize_map(KeySeed(&mut slot)).is_ok());

        let mut de = serde_json::Deserializer::from_str(r#"{"content":1}"#);
        let err = de.deserialize_map(KeySeed(&mut slot)).unwrap_err();
        let err = slot.resolve(err);
        assert!(err.is_structural());
        assert!(err.to_string().contains("'content'"));
    }
}
