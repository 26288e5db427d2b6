//! Opaque query cursors.

use crate::error::{DsError, DsResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// An opaque position within a query result stream.
///
/// The string form is URL-safe and stable across processes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Cursor(Vec<u8>);

impl Cursor {
    /// Wraps backend-specific cursor bytes.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The raw cursor bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns true for the empty cursor.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parses a cursor from its string form.
    ///
    /// # Errors
    ///
    /// Returns [`DsError::InvalidArgument`] if the string is not a cursor.
    pub fn decode(encoded: &str) -> DsResult<Self> {
        URL_SAFE_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .map(Self)
            .map_err(|_| DsError::invalid_argument(format!("invalid cursor {encoded:?}")))
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&URL_SAFE_NO_PAD.encode(&self.0))
    }
}

impl Serialize for Cursor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Cursor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Cursor::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_roundtrip() {
        let cursor = Cursor::from_bytes(vec![0, 1, 2, 250, 251, 252]);
        assert_eq!(Cursor::decode(&cursor.to_string()).unwrap(), cursor);
    }

    #[test]
    fn empty_cursor() {
        let cursor = Cursor::default();
        assert!(cursor.is_empty());
        assert_eq!(cursor.to_string(), "");
        assert_eq!(Cursor::decode("").unwrap(), cursor);
    }

    #[test]
    fn rejects_invalid() {
        assert!(Cursor::decode("@@@").is_err());
    }
}
