//! Preference key schemas
//!
//! Each preference set has a closed schema telling which keys are legal and
//! which primitive type each key holds. Two styles exist:
//!
//! - enumerated: an explicit key → type table (general preferences)
//! - pattern family: ordered `(regex, type)` rules, first match wins, plus
//!   literal keys (highscore)
//!
//! Lookups are pure; nothing here touches a store.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{BackupError, BackupResult};
use crate::storage::{PrefType, PrefValue};

/// Section key of the general preference set
pub const PREFERENCES_SECTION: &str = "preferences";

/// Section key of the highscore preference set
pub const HIGHSCORE_SECTION: &str = "highscore";

const GENERAL_KEYS: &[(&str, PrefType)] = &[
    ("pref_switch_answer", PrefType::Boolean),
    ("pref_switch_feedback", PrefType::Boolean),
    ("weight", PrefType::String),
];

static HIGHSCORE_RULES: LazyLock<Vec<KeyRule>> = LazyLock::new(|| {
    vec![
        KeyRule::new(r"^(hs|previous)", PrefType::String),
        KeyRule::new(r"^(right|wrong)", PrefType::Integer),
    ]
});

const HIGHSCORE_LITERALS: &[(&str, PrefType)] = &[("continue", PrefType::Boolean)];

/// A key pattern and the type its keys hold
#[derive(Debug, Clone)]
pub struct KeyRule {
    pattern: Regex,
    kind: PrefType,
}

impl KeyRule {
    fn new(pattern: &str, kind: PrefType) -> Self {
        Self {
            pattern: Regex::new(pattern).expect("static key pattern is valid"),
            kind,
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        self.pattern.is_match(key)
    }

    pub fn kind(&self) -> PrefType {
        self.kind
    }
}

/// Closed schema of one preference set
#[derive(Debug, Clone, Copy)]
pub enum PreferenceSchema {
    Enumerated {
        set: &'static str,
        keys: &'static [(&'static str, PrefType)],
    },
    PatternFamily {
        set: &'static str,
        rules: &'static [KeyRule],
        literals: &'static [(&'static str, PrefType)],
    },
}

impl PreferenceSchema {
    /// Schema of the general preference set
    pub fn general() -> Self {
        PreferenceSchema::Enumerated {
            set: PREFERENCES_SECTION,
            keys: GENERAL_KEYS,
        }
    }

    /// Schema of the highscore preference set
    pub fn highscore() -> Self {
        PreferenceSchema::PatternFamily {
            set: HIGHSCORE_SECTION,
            rules: HIGHSCORE_RULES.as_slice(),
            literals: HIGHSCORE_LITERALS,
        }
    }

    /// Section key this schema belongs to
    pub fn set_name(&self) -> &'static str {
        match self {
            PreferenceSchema::Enumerated { set, .. } => set,
            PreferenceSchema::PatternFamily { set, .. } => set,
        }
    }

    /// Expected type for `key`, or a schema violation if the key is unknown
    pub fn expected_type(&self, key: &str) -> BackupResult<PrefType> {
        let found = match self {
            PreferenceSchema::Enumerated { keys, .. } => lookup(keys, key),
            PreferenceSchema::PatternFamily {
                rules, literals, ..
            } => rules
                .iter()
                .find(|rule| rule.matches(key))
                .map(KeyRule::kind)
                .or_else(|| lookup(literals, key)),
        };

        found.ok_or_else(|| BackupError::unknown_key(self.set_name(), key))
    }

    /// Check that `value` has the type `key` requires
    pub fn check(&self, key: &str, value: &PrefValue) -> BackupResult<()> {
        let expected = self.expected_type(key)?;
        if value.pref_type() == expected {
            Ok(())
        } else {
            Err(BackupError::SchemaViolation(format!(
                "{} key '{}' expects {}, got {}",
                self.set_name(),
                key,
                expected,
                value.pref_type()
            )))
        }
    }

    /// Convert a raw document value into the type `key` requires
    pub fn coerce(&self, key: &str, value: serde_json::Value) -> BackupResult<PrefValue> {
        let expected = self.expected_type(key)?;
        let typed = match (expected, value) {
            (PrefType::Boolean, serde_json::Value::Bool(b)) => Some(PrefValue::Boolean(b)),
            (PrefType::String, serde_json::Value::String(s)) => Some(PrefValue::String(s)),
            (PrefType::Integer, serde_json::Value::Number(n)) => n.as_i64().map(PrefValue::Integer),
            _ => None,
        };

        typed.ok_or_else(|| {
            BackupError::SchemaViolation(format!(
                "{} key '{}' expects {}",
                self.set_name(),
                key,
                expected
            ))
        })
    }
}

fn lookup(table: &[(&str, PrefType)], key: &str) -> Option<PrefType> {
    table
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, kind)| *kind)
}
