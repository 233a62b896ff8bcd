//! Stable content ids for songs and batches.
//!
//! An id is the BLAKE3 hash of the raw input bytes truncated to 128
//! bits. Hashing the bytes rather than any parsed form means
//! re-ingesting an identical file always lands on the same rows, while
//! a single changed byte yields a different song. Ids render as 32 hex
//! chars everywhere they leave the process (store keys, JSON, logs).

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const ID_LEN: usize = 16;

/// A 128-bit content id, stored as raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentId([u8; ID_LEN]);

#[derive(Debug, Error)]
pub enum IdError {
    #[error("expected 32 hex chars, got {0}")]
    InvalidLength(usize),

    #[error("invalid hex character in id")]
    InvalidHex,
}

impl ContentId {
    /// Hash raw bytes into an id.
    pub fn from_data(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        let mut bytes = [0u8; ID_LEN];
        bytes.copy_from_slice(&hash.as_bytes()[..ID_LEN]);
        Self(bytes)
    }

    /// Hex form used for store keys and wire formats.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Id of the nth child object under this one, e.g. a song's tracks:
    /// `"<hex>:<n>"`.
    pub fn child(&self, index: usize) -> String {
        format!("{self}:{index}")
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for ContentId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ID_LEN * 2 {
            return Err(IdError::InvalidLength(s.len()));
        }
        let decoded = hex::decode(s).map_err(|_| IdError::InvalidHex)?;
        let mut bytes = [0u8; ID_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }
}

impl Serialize for ContentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_data_is_deterministic() {
        let a = ContentId::from_data(b"same bytes");
        let b = ContentId::from_data(b"same bytes");
        assert_eq!(a, b);
        assert_ne!(a, ContentId::from_data(b"other bytes"));
    }

    #[test]
    fn hex_form_is_32_lowercase_chars() {
        let id = ContentId::from_data(b"MThd");
        let hex = id.to_hex();
        assert_eq!(hex.len(), 32);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
        assert_eq!(hex, id.to_string());
    }

    #[test]
    fn hex_round_trips_through_from_str() {
        let id = ContentId::from_data(b"round trip");
        let parsed: ContentId = id.to_hex().parse().unwrap();
        assert_eq!(parsed, id);
        // Uppercase input normalizes to the same id
        let upper: ContentId = id.to_hex().to_uppercase().parse().unwrap();
        assert_eq!(upper, id);
    }

    #[test]
    fn from_str_rejects_bad_input() {
        let short: Result<ContentId, _> = "abc123".parse();
        assert!(matches!(short, Err(IdError::InvalidLength(6))));

        let junk: Result<ContentId, _> = "zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz".parse();
        assert!(matches!(junk, Err(IdError::InvalidHex)));
    }

    #[test]
    fn child_ids_are_prefixed_by_the_parent() {
        let id = ContentId::from_data(b"song");
        let track = id.child(3);
        assert_eq!(track, format!("{}:3", id.to_hex()));
    }

    #[test]
    fn serde_uses_the_hex_form() {
        let id = ContentId::from_data(b"serde test");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let restored: ContentId = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, id);
    }
}
