use std::sync::Arc;

use bytes::Bytes;
use keyvault::{ContentKey, Vaults};
use tracing::{debug, warn};

use super::cdm::{Cdm, CdmRegistry, CdmSessionId};
use crate::error::PipelineError;
use crate::track::ProtectionDescriptor;

/// One open CDM session. Closed exactly once, explicitly via
/// [`DrmSession::close`] or on drop.
pub struct DrmSession {
    cdm: Arc<dyn Cdm>,
    id: CdmSessionId,
    descriptor: ProtectionDescriptor,
    challenged: bool,
    closed: bool,
}

impl DrmSession {
    pub fn open(registry: &CdmRegistry, descriptor: &ProtectionDescriptor) -> Result<Self, PipelineError> {
        let system = descriptor.system();
        let cdm = registry.get(system).ok_or_else(|| PipelineError::UnsupportedSystem {
            system: system.to_string(),
        })?;
        let id = cdm.open()?;
        debug!(%system, session = %id, "Opened CDM session");
        Ok(Self {
            cdm,
            id,
            descriptor: descriptor.clone(),
            challenged: false,
            closed: false,
        })
    }

    pub fn id(&self) -> CdmSessionId {
        self.id
    }

    /// Produces the license challenge. Allowed once per session.
    pub fn challenge(&mut self) -> Result<Bytes, PipelineError> {
        if self.challenged {
            return Err(PipelineError::DeviceError {
                reason: format!("challenge already generated for session {}", self.id),
            });
        }
        let challenge = self.cdm.challenge(self.id, &self.descriptor)?;
        self.challenged = true;
        Ok(challenge)
    }

    /// Parses `license`, drops all-zero keys and stores the rest in every
    /// writable vault under the DRM system's scope.
    pub async fn resolve(
        &mut self,
        license: &[u8],
        vaults: &Vaults,
    ) -> Result<Vec<ContentKey>, PipelineError> {
        let keys: Vec<ContentKey> = self
            .cdm
            .parse_license(self.id, license)?
            .into_iter()
            .filter(|key| {
                let zero = key.is_zero();
                if zero {
                    warn!(kid = %key.kid(), "License returned an all-zero key, ignoring it");
                }
                !zero
            })
            .collect();

        let scope = self.descriptor.system().as_str();
        for key in &keys {
            vaults.add_key(scope, key).await?;
        }
        debug!(session = %self.id, keys = keys.len(), "License resolved");
        Ok(keys)
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.cdm.close(self.id);
            debug!(session = %self.id, "Closed CDM session");
        }
    }
}

impl Drop for DrmSession {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::clearkey::ClearKeyCdm;
    use crate::track::DrmSystem;
    use keyvault::{KeyId, MemoryVault};

    fn setup() -> (Arc<ClearKeyCdm>, CdmRegistry, ProtectionDescriptor) {
        let cdm = Arc::new(ClearKeyCdm::new());
        let mut registry = CdmRegistry::new();
        registry.register(cdm.clone());
        let descriptor =
            ProtectionDescriptor::new(DrmSystem::clearkey(), vec![KeyId::from_bytes([3; 16])]);
        (cdm, registry, descriptor)
    }

    #[test]
    fn unknown_system_is_unsupported() {
        let (_, registry, _) = setup();
        let descriptor =
            ProtectionDescriptor::new(DrmSystem::new("widevine"), vec![KeyId::from_bytes([3; 16])]);
        assert!(matches!(
            DrmSession::open(&registry, &descriptor),
            Err(PipelineError::UnsupportedSystem { .. })
        ));
    }

    #[test]
    fn second_challenge_is_rejected() {
        let (_, registry, descriptor) = setup();
        let mut session = DrmSession::open(&registry, &descriptor).unwrap();
        session.challenge().unwrap();
        assert!(matches!(
            session.challenge(),
            Err(PipelineError::DeviceError { .. })
        ));
    }

    #[test]
    fn drop_closes_session() {
        let (cdm, registry, descriptor) = setup();
        {
            let _session = DrmSession::open(&registry, &descriptor).unwrap();
            assert_eq!(cdm.open_sessions(), 1);
        }
        assert_eq!(cdm.open_sessions(), 0);
    }

    #[tokio::test]
    async fn resolve_skips_zero_keys_and_stores_the_rest() {
        let (cdm, registry, _) = setup();
        let good = KeyId::from_bytes([3; 16]);
        let zero = KeyId::from_bytes([4; 16]);
        let descriptor = ProtectionDescriptor::new(DrmSystem::clearkey(), vec![good, zero]);
        let vault = Arc::new(MemoryVault::default());
        let vaults = Vaults::new().with(vault.clone());

        let mut session = DrmSession::open(&registry, &descriptor).unwrap();
        session.challenge().unwrap();
        use base64::Engine;
        let b64 = |b: &[u8]| base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b);
        let license = serde_json::json!({"keys": [
            {"kty": "oct", "kid": b64(good.as_bytes()), "k": b64(&[7; 16])},
            {"kty": "oct", "kid": b64(zero.as_bytes()), "k": b64(&[0; 16])},
        ]})
        .to_string();

        let keys = session.resolve(license.as_bytes(), &vaults).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(vault.len(), 1);
        session.close();
        assert_eq!(cdm.open_sessions(), 0);
    }
}
