use std::fmt;

use keyvault::KeyId;

use crate::error::PipelineError;

/// Why a track ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    UnsupportedSystem(String),
    DeviceError(String),
    LicenseDenied(String),
    ParseError(String),
    KeyConflict(KeyId),
    MissingKey(KeyId),
    SegmentUnavailable(u64),
    CorruptSegment(u64),
    Cancelled,
    Other(String),
}

impl From<&PipelineError> for FailureReason {
    fn from(err: &PipelineError) -> Self {
        match err {
            PipelineError::UnsupportedSystem { system } => Self::UnsupportedSystem(system.clone()),
            PipelineError::DeviceError { reason } => Self::DeviceError(reason.clone()),
            PipelineError::LicenseDenied { reason } => Self::LicenseDenied(reason.clone()),
            PipelineError::ParseError { reason } => Self::ParseError(reason.clone()),
            PipelineError::KeyConflict { kid, .. } => Self::KeyConflict(*kid),
            PipelineError::MissingKey { kid } => Self::MissingKey(*kid),
            PipelineError::SegmentUnavailable { index, .. } => Self::SegmentUnavailable(*index),
            PipelineError::CorruptSegment { index, .. } => Self::CorruptSegment(*index),
            PipelineError::Cancelled => Self::Cancelled,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedSystem(system) => write!(f, "UnsupportedSystem({system})"),
            Self::DeviceError(reason) => write!(f, "DeviceError({reason})"),
            Self::LicenseDenied(reason) => write!(f, "LicenseDenied({reason})"),
            Self::ParseError(reason) => write!(f, "ParseError({reason})"),
            Self::KeyConflict(kid) => write!(f, "KeyConflict({kid})"),
            Self::MissingKey(kid) => write!(f, "MissingKey({kid})"),
            Self::SegmentUnavailable(index) => write!(f, "SegmentUnavailable({index})"),
            Self::CorruptSegment(index) => write!(f, "CorruptSegment({index})"),
            Self::Cancelled => f.write_str("Cancelled"),
            Self::Other(reason) => write!(f, "Other({reason})"),
        }
    }
}

/// Lifecycle of one track.
///
/// `Pending -> [AwaitingLicense] -> Downloading -> Decrypting -> Completed`,
/// with `Failed` reachable from every non-terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DownloadState {
    #[default]
    Pending,
    AwaitingLicense,
    Downloading,
    Decrypting,
    Completed,
    Failed(FailureReason),
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }

    pub fn can_transition_to(&self, next: &DownloadState) -> bool {
        use DownloadState::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Failed(_)) => true,
            (Pending, AwaitingLicense) | (Pending, Downloading) => true,
            (AwaitingLicense, Downloading) => true,
            (Downloading, Decrypting) => true,
            (Decrypting, Completed) => true,
            _ => false,
        }
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            Self::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("Pending"),
            Self::AwaitingLicense => f.write_str("AwaitingLicense"),
            Self::Downloading => f.write_str("Downloading"),
            Self::Decrypting => f.write_str("Decrypting"),
            Self::Completed => f.write_str("Completed"),
            Self::Failed(reason) => write!(f, "Failed({reason})"),
        }
    }
}
