//! Track and segment model.

use std::fmt;

use bytes::Bytes;
use keyvault::KeyId;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Audio,
    Subtitle,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Subtitle => "subtitle",
        })
    }
}

/// `length` bytes starting at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    /// Value for an HTTP `Range` header. `None` for an empty range, which
    /// cannot be expressed.
    pub fn header_value(&self) -> Option<String> {
        let last = self.offset.checked_add(self.length.checked_sub(1)?)?;
        Some(format!("bytes={}-{last}", self.offset))
    }
}

/// One independently fetchable piece of a track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Position in the track. Assigned from list order when tracks are built.
    #[serde(default)]
    pub index: u64,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<ByteRange>,
    /// Advertised body length, if known.
    #[serde(default, rename = "size", skip_serializing_if = "Option::is_none")]
    pub expected_size: Option<u64>,
    /// Overrides the track's default key id for this segment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<KeyId>,
}

impl Segment {
    pub fn new(index: u64, url: impl Into<String>) -> Self {
        Self {
            index,
            url: url.into(),
            range: None,
            expected_size: None,
            key_id: None,
        }
    }

    pub fn with_range(mut self, offset: u64, length: u64) -> Self {
        self.range = Some(ByteRange { offset, length });
        self
    }

    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn with_key_id(mut self, kid: KeyId) -> Self {
        self.key_id = Some(kid);
        self
    }

    /// The body length this segment must have, from the advertised size or
    /// else the byte range.
    pub fn expected_len(&self) -> Option<u64> {
        self.expected_size.or(self.range.map(|r| r.length))
    }
}

/// A DRM system name, normalised to lowercase. Well-known system ids are
/// mapped to their short names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct DrmSystem(String);

impl DrmSystem {
    pub const CLEARKEY: &'static str = "clearkey";
    pub const WIDEVINE: &'static str = "widevine";
    pub const PLAYREADY: &'static str = "playready";

    pub fn new(name: &str) -> Self {
        let lower = name.trim().to_ascii_lowercase();
        let canonical = match lower.as_str() {
            "e2719d58-a985-b3c9-781a-b030af78d30e" | "org.w3.clearkey" => Self::CLEARKEY,
            "edef8ba9-79d6-4ace-a3c8-27dcd51d21ed" | "com.widevine.alpha" => Self::WIDEVINE,
            "9a04f079-9840-4286-ab92-e65be0885f95" | "com.microsoft.playready" => Self::PLAYREADY,
            _ => return Self(lower),
        };
        Self(canonical.to_string())
    }

    pub fn clearkey() -> Self {
        Self(Self::CLEARKEY.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for DrmSystem {
    fn from(value: String) -> Self {
        Self::new(&value)
    }
}

impl From<DrmSystem> for String {
    fn from(value: DrmSystem) -> Self {
        value.0
    }
}

impl fmt::Display for DrmSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Block cipher mode used for the segment payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherScheme {
    /// AES-128-CBC with PKCS#7 padding.
    #[default]
    Cbc,
    /// AES-128-CTR, no padding.
    Ctr,
}

/// How a track is protected. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionDescriptor {
    system: DrmSystem,
    key_ids: Vec<KeyId>,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Bytes::is_empty")]
    init_data: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    license_url: Option<String>,
    #[serde(default)]
    scheme: CipherScheme,
    #[serde(default, with = "hex_iv", skip_serializing_if = "Option::is_none")]
    iv: Option<[u8; 16]>,
}

impl ProtectionDescriptor {
    pub fn new(system: DrmSystem, key_ids: Vec<KeyId>) -> Self {
        Self {
            system,
            key_ids,
            init_data: Bytes::new(),
            license_url: None,
            scheme: CipherScheme::default(),
            iv: None,
        }
    }

    pub fn with_init_data(mut self, init_data: impl Into<Bytes>) -> Self {
        self.init_data = init_data.into();
        self
    }

    pub fn with_license_url(mut self, url: impl Into<String>) -> Self {
        self.license_url = Some(url.into());
        self
    }

    pub fn with_scheme(mut self, scheme: CipherScheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_iv(mut self, iv: [u8; 16]) -> Self {
        self.iv = Some(iv);
        self
    }

    pub fn system(&self) -> &DrmSystem {
        &self.system
    }

    pub fn key_ids(&self) -> &[KeyId] {
        &self.key_ids
    }

    /// Key used by segments that do not name their own.
    pub fn default_key_id(&self) -> Option<&KeyId> {
        self.key_ids.first()
    }

    pub fn init_data(&self) -> &Bytes {
        &self.init_data
    }

    pub fn license_url(&self) -> Option<&str> {
        self.license_url.as_deref()
    }

    pub fn scheme(&self) -> CipherScheme {
        self.scheme
    }

    pub fn iv(&self) -> Option<&[u8; 16]> {
        self.iv.as_ref()
    }

    /// IV for the segment at `index`.
    pub fn segment_iv(&self, index: u64) -> [u8; 16] {
        crate::decrypt::cipher::derive_iv(self.scheme, self.iv, index)
    }
}

/// A single media rendition: metadata, optional protection and its ordered
/// segments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub kind: MediaType,
    #[serde(default)]
    pub codec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protection: Option<ProtectionDescriptor>,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

impl Track {
    pub fn new(id: impl Into<String>, kind: MediaType) -> Self {
        Self {
            id: id.into(),
            kind,
            codec: String::new(),
            bitrate: None,
            language: None,
            protection: None,
            segments: Vec::new(),
        }
    }

    pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = codec.into();
        self
    }

    pub fn with_protection(mut self, protection: ProtectionDescriptor) -> Self {
        self.protection = Some(protection);
        self
    }

    /// Replaces the segment list, numbering segments by position.
    pub fn with_segments(mut self, segments: impl IntoIterator<Item = Segment>) -> Self {
        self.segments = segments.into_iter().collect();
        self.renumber_segments();
        self
    }

    pub fn push_segment(&mut self, url: impl Into<String>) -> &mut Segment {
        let index = self.segments.len() as u64;
        self.segments.push(Segment::new(index, url));
        let last = self.segments.len() - 1;
        &mut self.segments[last]
    }

    pub fn renumber_segments(&mut self) {
        for (index, segment) in self.segments.iter_mut().enumerate() {
            segment.index = index as u64;
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.protection.is_some()
    }

    pub fn segment_count(&self) -> u64 {
        self.segments.len() as u64
    }

    /// Checks the structural rules a track must satisfy before it runs.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |reason: String| PipelineError::invalid_track(&self.id, reason);

        if self.id.trim().is_empty() {
            return Err(invalid("track id is empty".into()));
        }
        if self.segments.is_empty() {
            return Err(invalid("track has no segments".into()));
        }
        for (position, segment) in self.segments.iter().enumerate() {
            if segment.index != position as u64 {
                return Err(invalid(format!(
                    "segment at position {position} carries index {}",
                    segment.index
                )));
            }
            if segment.url.trim().is_empty() {
                return Err(invalid(format!("segment {position} has no URL")));
            }
            if matches!(segment.range, Some(ByteRange { length: 0, .. })) {
                return Err(invalid(format!("segment {position} has an empty byte range")));
            }
        }

        match &self.protection {
            Some(protection) => {
                if protection.key_ids.is_empty() {
                    return Err(invalid("protected track lists no key ids".into()));
                }
                if let Some(segment) = self.segments.iter().find(|s| {
                    s.key_id
                        .as_ref()
                        .is_some_and(|kid| !protection.key_ids.contains(kid))
                }) {
                    return Err(invalid(format!(
                        "segment {} uses a key id the protection descriptor does not list",
                        segment.index
                    )));
                }
            }
            None => {
                if let Some(segment) = self.segments.iter().find(|s| s.key_id.is_some()) {
                    return Err(invalid(format!(
                        "segment {} names a key id but the track is unprotected",
                        segment.index
                    )));
                }
            }
        }
        Ok(())
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD
            .decode(raw.trim())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

mod hex_iv {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<[u8; 16]>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(iv) => serializer.serialize_str(&hex::encode(iv)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<[u8; 16]>, D::Error> {
        let Some(raw) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        let digits = raw.trim().trim_start_matches("0x").trim_start_matches("0X");
        let mut iv = [0u8; 16];
        hex::decode_to_slice(digits, &mut iv).map_err(serde::de::Error::custom)?;
        Ok(Some(iv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kid(byte: u8) -> KeyId {
        KeyId::from_bytes([byte; 16])
    }

    fn segments(n: usize) -> Vec<Segment> {
        (0..n)
            .map(|i| Segment::new(0, format!("https://cdn.test/seg{i}.m4s")))
            .collect()
    }

    #[test]
    fn segments_are_numbered_by_position() {
        let track = Track::new("v1", MediaType::Video).with_segments(segments(3));
        let indices: Vec<u64> = track.segments.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(track.validate().is_ok());
    }

    #[test]
    fn gaps_in_indices_are_rejected() {
        let mut track = Track::new("v1", MediaType::Video).with_segments(segments(3));
        track.segments[2].index = 5;
        assert!(matches!(
            track.validate(),
            Err(PipelineError::InvalidTrack { .. })
        ));
    }

    #[test]
    fn protected_track_needs_key_ids() {
        let track = Track::new("a1", MediaType::Audio)
            .with_segments(segments(1))
            .with_protection(ProtectionDescriptor::new(DrmSystem::clearkey(), vec![]));
        assert!(track.validate().is_err());
    }

    #[test]
    fn segment_key_must_be_listed() {
        let mut track = Track::new("a1", MediaType::Audio)
            .with_segments(segments(2))
            .with_protection(ProtectionDescriptor::new(DrmSystem::clearkey(), vec![kid(1)]));
        track.segments[1].key_id = Some(kid(2));
        assert!(track.validate().is_err());
        track.segments[1].key_id = Some(kid(1));
        assert!(track.validate().is_ok());
    }

    #[test]
    fn system_ids_normalise_to_names() {
        assert_eq!(
            DrmSystem::new("EDEF8BA9-79D6-4ACE-A3C8-27DCD51D21ED").as_str(),
            DrmSystem::WIDEVINE
        );
        assert_eq!(DrmSystem::new("org.w3.clearkey"), DrmSystem::clearkey());
        assert_eq!(DrmSystem::new("Custom").as_str(), "custom");
    }

    #[test]
    fn range_header_is_inclusive() {
        let range = ByteRange { offset: 100, length: 50 };
        assert_eq!(range.header_value().as_deref(), Some("bytes=100-149"));
        assert_eq!(ByteRange { offset: 0, length: 0 }.header_value(), None);
    }

    #[test]
    fn descriptor_parses_from_json() {
        let json = r#"{
            "system": "clearkey",
            "key_ids": ["0102030405060708090a0b0c0d0e0f10"],
            "init_data": "AAECAw==",
            "license_url": "https://license.test/ck",
            "scheme": "ctr",
            "iv": "000102030405060708090a0b0c0d0e0f"
        }"#;
        let descriptor: ProtectionDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(descriptor.scheme(), CipherScheme::Ctr);
        assert_eq!(descriptor.init_data().as_ref(), &[0, 1, 2, 3]);
        assert_eq!(descriptor.iv().unwrap()[15], 0x0f);
        assert_eq!(descriptor.key_ids().len(), 1);
    }
}
