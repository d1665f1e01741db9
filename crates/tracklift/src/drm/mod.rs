//! DRM: CDM sessions, license exchange and key resolution.

pub mod cdm;
pub mod clearkey;
pub mod license;
pub mod resolver;
pub mod session;

pub use cdm::{Cdm, CdmRegistry, CdmSessionId};
pub use clearkey::ClearKeyCdm;
pub use license::{HttpLicenseClient, LicenseTransport};
pub use resolver::{KeyResolver, ResolvedKey};
pub use session::DrmSession;
