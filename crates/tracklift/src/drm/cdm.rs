use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use keyvault::ContentKey;

use crate::error::CdmError;
use crate::track::{DrmSystem, ProtectionDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CdmSessionId(pub u64);

impl fmt::Display for CdmSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A content decryption module for one DRM system.
///
/// Implementations are shared across tracks and must tolerate concurrent
/// sessions.
pub trait Cdm: Send + Sync {
    fn system(&self) -> &DrmSystem;

    fn open(&self) -> Result<CdmSessionId, CdmError>;

    /// Builds the license request body for `descriptor`.
    fn challenge(
        &self,
        session: CdmSessionId,
        descriptor: &ProtectionDescriptor,
    ) -> Result<Bytes, CdmError>;

    /// Extracts content keys from a license server response.
    fn parse_license(
        &self,
        session: CdmSessionId,
        license: &[u8],
    ) -> Result<Vec<ContentKey>, CdmError>;

    fn close(&self, session: CdmSessionId);
}

/// CDMs available to a job, keyed by DRM system.
#[derive(Clone, Default)]
pub struct CdmRegistry {
    cdms: HashMap<DrmSystem, Arc<dyn Cdm>>,
}

impl fmt::Debug for CdmRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.cdms.keys()).finish()
    }
}

impl CdmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in ClearKey CDM.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(super::clearkey::ClearKeyCdm::new()));
        registry
    }

    /// Binds `cdm` to its system, replacing any previous binding.
    pub fn register(&mut self, cdm: Arc<dyn Cdm>) {
        self.cdms.insert(cdm.system().clone(), cdm);
    }

    pub fn get(&self, system: &DrmSystem) -> Option<Arc<dyn Cdm>> {
        self.cdms.get(system).cloned()
    }

    pub fn systems(&self) -> impl Iterator<Item = &DrmSystem> {
        self.cdms.keys()
    }
}
