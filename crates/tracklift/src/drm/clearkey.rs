//! W3C ClearKey CDM.
//!
//! Challenge: `{"kids":["<b64url>"],"type":"temporary"}`.
//! License: `{"keys":[{"kty":"oct","kid":"<b64url>","k":"<b64url>"}]}`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use keyvault::{ContentKey, KeyId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::cdm::{Cdm, CdmSessionId};
use crate::error::CdmError;
use crate::track::{DrmSystem, ProtectionDescriptor};

#[derive(Serialize)]
struct LicenseRequest<'a> {
    kids: Vec<String>,
    #[serde(rename = "type")]
    session_type: &'a str,
}

#[derive(Deserialize)]
struct LicenseResponse {
    #[serde(default)]
    keys: Vec<JsonWebKey>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct JsonWebKey {
    kty: String,
    kid: String,
    k: String,
}

pub struct ClearKeyCdm {
    system: DrmSystem,
    next_session: AtomicU64,
    /// Key ids requested per open session; `None` until challenged.
    sessions: Mutex<HashMap<CdmSessionId, Option<Vec<KeyId>>>>,
}

impl Default for ClearKeyCdm {
    fn default() -> Self {
        Self::new()
    }
}

impl ClearKeyCdm {
    pub fn new() -> Self {
        Self {
            system: DrmSystem::clearkey(),
            next_session: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().len()
    }
}

fn decode_b64url(field: &str, value: &str) -> Result<Vec<u8>, CdmError> {
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| CdmError::Parse(format!("invalid base64 in `{field}`: {e}")))
}

impl Cdm for ClearKeyCdm {
    fn system(&self) -> &DrmSystem {
        &self.system
    }

    fn open(&self) -> Result<CdmSessionId, CdmError> {
        let id = CdmSessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        self.sessions.lock().insert(id, None);
        Ok(id)
    }

    fn challenge(
        &self,
        session: CdmSessionId,
        descriptor: &ProtectionDescriptor,
    ) -> Result<Bytes, CdmError> {
        let mut sessions = self.sessions.lock();
        let slot = sessions
            .get_mut(&session)
            .ok_or(CdmError::UnknownSession(session.0))?;

        let request = LicenseRequest {
            kids: descriptor
                .key_ids()
                .iter()
                .map(|kid| URL_SAFE_NO_PAD.encode(kid.as_bytes()))
                .collect(),
            session_type: "temporary",
        };
        let body = serde_json::to_vec(&request)
            .map_err(|e| CdmError::Device(format!("failed to encode challenge: {e}")))?;
        *slot = Some(descriptor.key_ids().to_vec());
        Ok(Bytes::from(body))
    }

    fn parse_license(
        &self,
        session: CdmSessionId,
        license: &[u8],
    ) -> Result<Vec<ContentKey>, CdmError> {
        let requested = self
            .sessions
            .lock()
            .get(&session)
            .cloned()
            .ok_or(CdmError::UnknownSession(session.0))?
            .ok_or_else(|| CdmError::Device("license received before a challenge".into()))?;

        let response: LicenseResponse = serde_json::from_slice(license)
            .map_err(|e| CdmError::Parse(format!("license is not valid JSON: {e}")))?;
        if let Some(error) = response.error {
            return Err(CdmError::Denied(error));
        }

        let mut keys = Vec::with_capacity(response.keys.len());
        for jwk in response.keys {
            if jwk.kty != "oct" {
                debug!(kty = %jwk.kty, "Ignoring non-symmetric key in license");
                continue;
            }
            let kid = KeyId::from_slice(&decode_b64url("kid", &jwk.kid)?)
                .map_err(|e| CdmError::Parse(e.to_string()))?;
            let key = decode_b64url("k", &jwk.k)?;
            keys.push(ContentKey::new(kid, key));
        }

        if !requested.iter().any(|kid| keys.iter().any(|k| k.kid() == kid)) {
            return Err(CdmError::Denied(
                "license contains none of the requested key ids".into(),
            ));
        }
        Ok(keys)
    }

    fn close(&self, session: CdmSessionId) {
        self.sessions.lock().remove(&session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KID: KeyId = KeyId::from_bytes([0xab; 16]);

    fn descriptor() -> ProtectionDescriptor {
        ProtectionDescriptor::new(DrmSystem::clearkey(), vec![KID])
    }

    fn license(kid: &KeyId, key: &[u8]) -> Vec<u8> {
        serde_json::json!({
            "keys": [{
                "kty": "oct",
                "kid": URL_SAFE_NO_PAD.encode(kid.as_bytes()),
                "k": URL_SAFE_NO_PAD.encode(key),
            }],
            "type": "temporary"
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn challenge_lists_requested_kids() {
        let cdm = ClearKeyCdm::new();
        let session = cdm.open().unwrap();
        let challenge = cdm.challenge(session, &descriptor()).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&challenge).unwrap();
        assert_eq!(json["type"], "temporary");
        assert_eq!(json["kids"][0], URL_SAFE_NO_PAD.encode([0xab; 16]));
    }

    #[test]
    fn license_yields_keys() {
        let cdm = ClearKeyCdm::new();
        let session = cdm.open().unwrap();
        cdm.challenge(session, &descriptor()).unwrap();
        let keys = cdm.parse_license(session, &license(&KID, &[1; 16])).unwrap();
        assert_eq!(keys, vec![ContentKey::new(KID, vec![1; 16])]);
        cdm.close(session);
        assert_eq!(cdm.open_sessions(), 0);
    }

    #[test]
    fn license_for_other_kids_is_denied() {
        let cdm = ClearKeyCdm::new();
        let session = cdm.open().unwrap();
        cdm.challenge(session, &descriptor()).unwrap();
        let other = KeyId::from_bytes([1; 16]);
        assert!(matches!(
            cdm.parse_license(session, &license(&other, &[1; 16])),
            Err(CdmError::Denied(_))
        ));
        assert!(matches!(
            cdm.parse_license(session, br#"{"error":"forbidden"}"#),
            Err(CdmError::Denied(_))
        ));
    }

    #[test]
    fn malformed_license_is_parse_error() {
        let cdm = ClearKeyCdm::new();
        let session = cdm.open().unwrap();
        cdm.challenge(session, &descriptor()).unwrap();
        assert!(matches!(
            cdm.parse_license(session, b"<html>"),
            Err(CdmError::Parse(_))
        ));
        assert!(matches!(
            cdm.parse_license(session, br#"{"keys":[{"kty":"oct","kid":"!!","k":"AA"}]}"#),
            Err(CdmError::Parse(_))
        ));
    }

    #[test]
    fn unknown_session_is_rejected() {
        let cdm = ClearKeyCdm::new();
        assert!(matches!(
            cdm.challenge(CdmSessionId(99), &descriptor()),
            Err(CdmError::UnknownSession(99))
        ));
    }
}
