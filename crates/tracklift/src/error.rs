use keyvault::{KeyId, VaultError};
use reqwest::StatusCode;

/// Network-level failure of a segment or license transfer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transfer cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("proxy configuration error: {reason}")]
    ProxyConfiguration { reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("size mismatch: expected {expected} bytes, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("operation timed out: {reason}")]
    Timeout { reason: String },
}

impl TransportError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    /// Transient faults: timeouts, connection failures, 5xx, 408 and 429.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled | Self::InvalidUrl { .. } | Self::ProxyConfiguration { .. } => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            Self::Network { source } => crate::download::retry::is_retryable_reqwest_error(source),
            Self::SizeMismatch { .. } | Self::Timeout { .. } => true,
        }
    }

    /// A 4xx answer other than 408/429: the server understood and refused.
    pub fn is_client_rejection(&self) -> bool {
        matches!(self, Self::HttpStatus { status, .. } if status.is_client_error()) && !self.is_retryable()
    }
}

/// Failure reported by a CDM collaborator.
#[derive(Debug, thiserror::Error)]
pub enum CdmError {
    #[error("CDM device error: {0}")]
    Device(String),

    #[error("license denied: {0}")]
    Denied(String),

    #[error("malformed license: {0}")]
    Parse(String),

    #[error("unknown CDM session {0}")]
    UnknownSession(u64),
}

/// Everything that can move a track to `Failed`.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no CDM bound for DRM system `{system}`")]
    UnsupportedSystem { system: String },

    #[error("CDM device error: {reason}")]
    DeviceError { reason: String },

    #[error("license denied: {reason}")]
    LicenseDenied { reason: String },

    #[error("malformed license response: {reason}")]
    ParseError { reason: String },

    #[error("license request failed: {source}")]
    LicenseTransport {
        #[source]
        source: TransportError,
    },

    #[error("content key conflict for {kid} in vault `{vault}`")]
    KeyConflict { kid: KeyId, vault: String },

    #[error("no content key available for {kid}")]
    MissingKey { kid: KeyId },

    #[error("segment {index} unavailable: {reason}")]
    SegmentUnavailable { index: u64, reason: String },

    #[error("segment {index} is corrupt: {reason}")]
    CorruptSegment { index: u64, reason: String },

    #[error("decryption of segment {index} failed: {reason}")]
    Decryption { index: u64, reason: String },

    #[error("pipeline cancelled")]
    Cancelled,

    #[error("invalid track `{track}`: {reason}")]
    InvalidTrack { track: String, reason: String },

    #[error("vault error: {0}")]
    Vault(#[source] VaultError),

    #[error("output error: {0}")]
    Output(#[from] std::io::Error),

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl PipelineError {
    pub fn invalid_track(track: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTrack {
            track: track.into(),
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Structural faults point at a logic or data-integrity problem and are
    /// never worth another attempt.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedSystem { .. }
                | Self::ParseError { .. }
                | Self::KeyConflict { .. }
                | Self::MissingKey { .. }
                | Self::InvalidTrack { .. }
        )
    }
}

impl From<VaultError> for PipelineError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::KeyConflict { kid, vault } => Self::KeyConflict { kid, vault },
            other => Self::Vault(other),
        }
    }
}

impl From<CdmError> for PipelineError {
    fn from(err: CdmError) -> Self {
        match err {
            CdmError::Device(reason) => Self::DeviceError { reason },
            CdmError::Denied(reason) => Self::LicenseDenied { reason },
            CdmError::Parse(reason) => Self::ParseError { reason },
            CdmError::UnknownSession(id) => Self::DeviceError {
                reason: format!("unknown CDM session {id}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_statuses_are_retryable() {
        let err = TransportError::http_status(StatusCode::SERVICE_UNAVAILABLE, "http://x/seg");
        assert!(err.is_retryable());
        let err = TransportError::http_status(StatusCode::TOO_MANY_REQUESTS, "http://x/seg");
        assert!(err.is_retryable());
        assert!(!err.is_client_rejection());
    }

    #[test]
    fn client_errors_are_final() {
        let err = TransportError::http_status(StatusCode::FORBIDDEN, "http://x/license");
        assert!(!err.is_retryable());
        assert!(err.is_client_rejection());
        assert!(!TransportError::Cancelled.is_retryable());
    }

    #[test]
    fn vault_conflict_maps_to_key_conflict() {
        let kid = KeyId::from_bytes([1; 16]);
        let err: PipelineError = VaultError::KeyConflict {
            kid,
            vault: "memory".into(),
        }
        .into();
        assert!(matches!(err, PipelineError::KeyConflict { .. }));
        assert!(err.is_structural());
    }

    #[test]
    fn cdm_errors_map_to_taxonomy() {
        assert!(matches!(
            PipelineError::from(CdmError::Denied("nope".into())),
            PipelineError::LicenseDenied { .. }
        ));
        assert!(matches!(
            PipelineError::from(CdmError::Parse("bad json".into())),
            PipelineError::ParseError { .. }
        ));
        assert!(matches!(
            PipelineError::from(CdmError::UnknownSession(3)),
            PipelineError::DeviceError { .. }
        ));
    }
}
