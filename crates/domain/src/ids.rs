//! Typed identifiers: `SessionId`, `CallId`, `ReferenceId`.
//!
//! Each is a thin newtype over `String` with a fixed prefix, minted from a
//! UUID v4 suffix. Prefix checks (`is_session_id`, etc.) are pure and cheap —
//! they never parse the suffix, only check the format.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

macro_rules! typed_id {
    ($name:ident, $prefix:literal, $pattern:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mint a new identifier with a random UUID v4 suffix.
            pub fn generate() -> Self {
                Self(format!(concat!($prefix, "{}"), uuid::Uuid::new_v4()))
            }

            /// Wrap an existing string, validating its format.
            pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidIdError> {
                let raw = raw.into();
                if Self::is_valid(&raw) {
                    Ok(Self(raw))
                } else {
                    Err(InvalidIdError {
                        kind: stringify!($name),
                        value: raw,
                    })
                }
            }

            /// Pure prefix + charset check.
            pub fn is_valid(raw: &str) -> bool {
                static PATTERN: OnceLock<Regex> = OnceLock::new();
                PATTERN
                    .get_or_init(|| Regex::new($pattern).expect("id pattern is a valid regex"))
                    .is_match(raw)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }
    };
}

typed_id!(SessionId, "s_", r"^s_[A-Za-z0-9_-]+$", "A session identifier, `s_<suffix>`.");
typed_id!(CallId, "c_", r"^c_[A-Za-z0-9_-]+$", "A tool-call identifier, `c_<suffix>`.");
typed_id!(
    ReferenceId,
    "ref_",
    r"^ref_[0-9a-f-]+$",
    "An opaque reference identifier, `ref_<hex-with-dashes>`."
);

#[derive(Debug, thiserror::Error)]
#[error("invalid {kind}: {value:?}")]
pub struct InvalidIdError {
    kind: &'static str,
    value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_generate_round_trips() {
        let id = SessionId::generate();
        assert!(SessionId::is_valid(id.as_str()));
        assert!(id.as_str().starts_with("s_"));
    }

    #[test]
    fn call_id_rejects_wrong_prefix() {
        assert!(CallId::parse("s_abc123").is_err());
        assert!(CallId::parse("c_abc-123_XY").is_ok());
    }

    #[test]
    fn reference_id_only_allows_hex_and_dash() {
        assert!(ReferenceId::is_valid("ref_0f3a-1b2c"));
        assert!(!ReferenceId::is_valid("ref_ZZZZ"));
        assert!(!ReferenceId::is_valid("s_0f3a"));
    }

    #[test]
    fn rejects_empty_suffix() {
        assert!(!SessionId::is_valid("s_"));
    }
}
