use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, VaultError};

/// A 128-bit DRM key identifier (KID).
///
/// Parsed from 32 hex digits, with or without UUID-style dashes. Always
/// displayed as lowercase hex without dashes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId([u8; 16]);

impl KeyId {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; 16] = bytes.try_into().map_err(|_| {
            VaultError::invalid_key_id(
                hex::encode(bytes),
                format!("expected 16 bytes, got {}", bytes.len()),
            )
        })?;
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for KeyId {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        let compact: String = s.trim().chars().filter(|c| *c != '-').collect();
        if compact.len() != 32 {
            return Err(VaultError::invalid_key_id(
                s,
                format!("expected 32 hex digits, got {}", compact.len()),
            ));
        }
        let mut raw = [0u8; 16];
        hex::decode_to_slice(&compact, &mut raw)
            .map_err(|e| VaultError::invalid_key_id(s, e.to_string()))?;
        Ok(Self(raw))
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.to_hex())
    }
}

impl Serialize for KeyId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for KeyId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A resolved content key: the pair of a key id and its raw key bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct ContentKey {
    kid: KeyId,
    key: Vec<u8>,
}

impl ContentKey {
    pub fn new(kid: KeyId, key: impl Into<Vec<u8>>) -> Self {
        Self {
            kid,
            key: key.into(),
        }
    }

    pub fn from_hex(kid: &str, key: &str) -> Result<Self> {
        let kid = kid.parse()?;
        let key = hex::decode(key.trim()).map_err(|e| VaultError::invalid_key(e.to_string()))?;
        if key.is_empty() {
            return Err(VaultError::invalid_key("empty key"));
        }
        Ok(Self { kid, key })
    }

    /// Parses the conventional `KID:KEY` hex notation.
    pub fn parse_pair(pair: &str) -> Result<Self> {
        let (kid, key) = pair
            .split_once(':')
            .ok_or_else(|| VaultError::invalid_key(format!("expected KID:KEY, got `{pair}`")))?;
        Self::from_hex(kid, key)
    }

    pub fn kid(&self) -> &KeyId {
        &self.kid
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn key_hex(&self) -> String {
        hex::encode(&self.key)
    }

    /// All-zero keys are placeholders some license servers emit for key ids the
    /// client is not entitled to; they are never stored.
    pub fn is_zero(&self) -> bool {
        self.key.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentKey")
            .field("kid", &self.kid)
            .field("key", &format_args!("<{} bytes>", self.key.len()))
            .finish()
    }
}
