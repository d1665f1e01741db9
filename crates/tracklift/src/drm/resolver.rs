//! Key acquisition for protected tracks: vault lookup first, license
//! exchange for whatever is missing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use keyvault::{ContentKey, KeyId, Vaults};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::cdm::CdmRegistry;
use super::license::LicenseTransport;
use super::session::DrmSession;
use crate::config::KeyPolicy;
use crate::download::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use crate::error::{PipelineError, TransportError};
use crate::events::KeySource;
use crate::track::ProtectionDescriptor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    pub key: ContentKey,
    pub source: KeySource,
}

/// Shared by all tracks of a job. License exchanges are serialized; a track
/// waiting for the lock re-checks the vaults first, so keys fetched for one
/// track are reused by the next.
pub struct KeyResolver {
    vaults: Vaults,
    cdms: CdmRegistry,
    transport: Arc<dyn LicenseTransport>,
    policy: KeyPolicy,
    license_retry: RetryPolicy,
    license_lock: tokio::sync::Mutex<()>,
    license_exchanges: AtomicU64,
}

impl KeyResolver {
    pub fn new(
        vaults: Vaults,
        cdms: CdmRegistry,
        transport: Arc<dyn LicenseTransport>,
        policy: KeyPolicy,
        license_retry: RetryPolicy,
    ) -> Self {
        Self {
            vaults,
            cdms,
            transport,
            policy,
            license_retry,
            license_lock: tokio::sync::Mutex::new(()),
            license_exchanges: AtomicU64::new(0),
        }
    }

    pub fn vaults(&self) -> &Vaults {
        &self.vaults
    }

    /// License exchanges attempted so far.
    pub fn license_exchanges(&self) -> u64 {
        self.license_exchanges.load(Ordering::Relaxed)
    }

    /// Makes sure every key id of `descriptor` has a key in the vaults.
    pub async fn ensure_keys(
        &self,
        descriptor: &ProtectionDescriptor,
        token: &CancellationToken,
    ) -> Result<Vec<ResolvedKey>, PipelineError> {
        if self.policy != KeyPolicy::CdmOnly {
            match self.lookup_all(descriptor).await? {
                Ok(keys) => {
                    debug!(system = %descriptor.system(), "All keys found in vaults, skipping license");
                    return Ok(keys);
                }
                Err(missing) if self.policy == KeyPolicy::VaultsOnly => {
                    return Err(PipelineError::MissingKey { kid: missing });
                }
                Err(_) => {}
            }
        }

        let _guard = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(PipelineError::Cancelled),
            guard = self.license_lock.lock() => guard,
        };

        if self.policy != KeyPolicy::CdmOnly {
            if let Ok(keys) = self.lookup_all(descriptor).await? {
                debug!(system = %descriptor.system(), "Keys arrived while waiting for license lock");
                return Ok(keys);
            }
        }

        let licensed = self.license_exchange(descriptor, token).await?;
        let mut resolved = Vec::with_capacity(descriptor.key_ids().len());
        for kid in descriptor.key_ids() {
            if let Some(key) = licensed.iter().find(|k| k.kid() == kid) {
                resolved.push(ResolvedKey {
                    key: key.clone(),
                    source: KeySource::License,
                });
                continue;
            }
            if self.policy == KeyPolicy::CdmOnly {
                return Err(PipelineError::MissingKey { kid: *kid });
            }
            match self.vaults.get_key(descriptor.system().as_str(), kid).await? {
                Some(found) => resolved.push(ResolvedKey {
                    key: found.key,
                    source: KeySource::Vault(found.vault),
                }),
                None => return Err(PipelineError::MissingKey { kid: *kid }),
            }
        }
        Ok(resolved)
    }

    /// `Ok(Ok(keys))` when every key id is stored, `Ok(Err(kid))` naming the
    /// first missing one otherwise.
    async fn lookup_all(
        &self,
        descriptor: &ProtectionDescriptor,
    ) -> Result<Result<Vec<ResolvedKey>, KeyId>, PipelineError> {
        let scope = descriptor.system().as_str();
        let mut keys = Vec::with_capacity(descriptor.key_ids().len());
        for kid in descriptor.key_ids() {
            match self.vaults.get_key(scope, kid).await? {
                Some(found) => keys.push(ResolvedKey {
                    key: found.key,
                    source: KeySource::Vault(found.vault),
                }),
                None => return Ok(Err(*kid)),
            }
        }
        Ok(Ok(keys))
    }

    async fn license_exchange(
        &self,
        descriptor: &ProtectionDescriptor,
        token: &CancellationToken,
    ) -> Result<Vec<ContentKey>, PipelineError> {
        self.license_exchanges.fetch_add(1, Ordering::Relaxed);
        let mut session = DrmSession::open(&self.cdms, descriptor)?;
        let challenge = session.challenge()?;
        info!(system = %descriptor.system(), session = %session.id(), "Requesting license");

        let transport = self.transport.as_ref();
        let challenge = &challenge;
        let response = retry_with_backoff(&self.license_retry, token, |_| async move {
            match transport.acquire(descriptor, Bytes::clone(challenge), token).await {
                Ok(body) => RetryAction::Success(body),
                Err(err) if err.is_retryable() => RetryAction::Retry(err),
                Err(err) => RetryAction::Fail(err),
            }
        })
        .await
        .map_err(license_error)?;

        let keys = session.resolve(&response, &self.vaults).await?;
        session.close();
        Ok(keys)
    }
}

fn license_error(err: TransportError) -> PipelineError {
    match err {
        TransportError::Cancelled => PipelineError::Cancelled,
        err if err.is_client_rejection() => PipelineError::LicenseDenied {
            reason: err.to_string(),
        },
        source => PipelineError::LicenseTransport { source },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::cdm::{Cdm, CdmSessionId};
    use crate::error::CdmError;
    use crate::track::DrmSystem;
    use async_trait::async_trait;
    use keyvault::MemoryVault;
    use reqwest::StatusCode;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const KID: KeyId = KeyId::from_bytes([5; 16]);

    /// Issues `[KID => 0x11..]` for any challenge and counts sessions.
    #[derive(Default)]
    struct CountingCdm {
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    impl Cdm for CountingCdm {
        fn system(&self) -> &DrmSystem {
            static SYSTEM: std::sync::OnceLock<DrmSystem> = std::sync::OnceLock::new();
            SYSTEM.get_or_init(DrmSystem::clearkey)
        }
        fn open(&self) -> Result<CdmSessionId, CdmError> {
            Ok(CdmSessionId(self.opened.fetch_add(1, Ordering::SeqCst) as u64))
        }
        fn challenge(&self, _: CdmSessionId, _: &ProtectionDescriptor) -> Result<Bytes, CdmError> {
            Ok(Bytes::from_static(b"challenge"))
        }
        fn parse_license(&self, _: CdmSessionId, license: &[u8]) -> Result<Vec<ContentKey>, CdmError> {
            match license {
                b"ok" => Ok(vec![ContentKey::new(KID, vec![0x11; 16])]),
                _ => Err(CdmError::Parse("unexpected license".into())),
            }
        }
        fn close(&self, _: CdmSessionId) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedTransport {
        responses: parking_lot::Mutex<Vec<Result<Bytes, TransportError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<Bytes, TransportError>>) -> Self {
            Self {
                responses: parking_lot::Mutex::new(responses),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LicenseTransport for ScriptedTransport {
        async fn acquire(
            &self,
            _: &ProtectionDescriptor,
            _: Bytes,
            _: &CancellationToken,
        ) -> Result<Bytes, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock();
            if responses.len() > 1 {
                responses.remove(0)
            } else {
                match &responses[0] {
                    Ok(body) => Ok(body.clone()),
                    Err(_) => Err(TransportError::http_status(StatusCode::BAD_GATEWAY, "lic")),
                }
            }
        }
    }

    fn resolver(
        policy: KeyPolicy,
        transport: Arc<ScriptedTransport>,
    ) -> (KeyResolver, Arc<CountingCdm>, Arc<MemoryVault>) {
        let cdm = Arc::new(CountingCdm::default());
        let mut cdms = CdmRegistry::new();
        cdms.register(cdm.clone());
        let vault = Arc::new(MemoryVault::default());
        let retry = RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::once()
        };
        let resolver = KeyResolver::new(
            Vaults::new().with(vault.clone()),
            cdms,
            transport,
            policy,
            retry,
        );
        (resolver, cdm, vault)
    }

    fn descriptor() -> ProtectionDescriptor {
        ProtectionDescriptor::new(DrmSystem::clearkey(), vec![KID])
    }

    #[tokio::test]
    async fn vault_hit_skips_license() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(Bytes::from_static(b"ok"))]));
        let (resolver, cdm, vault) = resolver(KeyPolicy::Any, transport.clone());
        use keyvault::Vault;
        vault
            .put("clearkey", &ContentKey::new(KID, vec![0x22; 16]))
            .await
            .unwrap();

        let keys = resolver
            .ensure_keys(&descriptor(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(keys[0].source, KeySource::Vault("memory".into()));
        assert_eq!(cdm.opened.load(Ordering::SeqCst), 0);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn license_fills_vault_and_closes_session() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(Bytes::from_static(b"ok"))]));
        let (resolver, cdm, vault) = resolver(KeyPolicy::Any, transport);

        let keys = resolver
            .ensure_keys(&descriptor(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(keys[0].source, KeySource::License);
        assert_eq!(vault.len(), 1);
        assert_eq!(cdm.closed.load(Ordering::SeqCst), 1);

        // Second track with the same key id reuses the stored key.
        resolver
            .ensure_keys(&descriptor(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(cdm.opened.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.license_exchanges(), 1);
    }

    #[tokio::test]
    async fn transient_license_failure_is_retried_once() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::http_status(StatusCode::SERVICE_UNAVAILABLE, "lic")),
            Ok(Bytes::from_static(b"ok")),
        ]));
        let (resolver, _, _) = resolver(KeyPolicy::Any, transport.clone());
        resolver
            .ensure_keys(&descriptor(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistent_license_failure_closes_session() {
        let transport = Arc::new(ScriptedTransport::new(vec![Err(TransportError::http_status(
            StatusCode::BAD_GATEWAY,
            "lic",
        ))]));
        let (resolver, cdm, _) = resolver(KeyPolicy::Any, transport.clone());
        let err = resolver
            .ensure_keys(&descriptor(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::LicenseTransport { .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cdm.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn forbidden_is_license_denied() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::http_status(StatusCode::FORBIDDEN, "lic")),
            Ok(Bytes::from_static(b"ok")),
        ]));
        let (resolver, cdm, _) = resolver(KeyPolicy::Any, transport.clone());
        let err = resolver
            .ensure_keys(&descriptor(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::LicenseDenied { .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cdm.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_license_is_parse_error() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(Bytes::from_static(b"junk"))]));
        let (resolver, _, _) = resolver(KeyPolicy::Any, transport);
        let err = resolver
            .ensure_keys(&descriptor(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ParseError { .. }));
    }

    #[tokio::test]
    async fn vaults_only_never_contacts_server() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(Bytes::from_static(b"ok"))]));
        let (resolver, cdm, _) = resolver(KeyPolicy::VaultsOnly, transport.clone());
        let err = resolver
            .ensure_keys(&descriptor(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingKey { kid } if kid == KID));
        assert_eq!(cdm.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cdm_only_ignores_vault_but_detects_conflict() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(Bytes::from_static(b"ok"))]));
        let (resolver, cdm, vault) = resolver(KeyPolicy::CdmOnly, transport);
        use keyvault::Vault;
        vault
            .put("clearkey", &ContentKey::new(KID, vec![0x22; 16]))
            .await
            .unwrap();

        let err = resolver
            .ensure_keys(&descriptor(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::KeyConflict { .. }));
        assert_eq!(cdm.opened.load(Ordering::SeqCst), 1);
        assert_eq!(cdm.closed.load(Ordering::SeqCst), 1);
    }
}
