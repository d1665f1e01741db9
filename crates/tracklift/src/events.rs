use std::fmt;
use std::sync::Arc;

use keyvault::KeyId;
use tokio::sync::broadcast;

use crate::state::DownloadState;

/// Where a content key came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Found in the named vault.
    Vault(String),
    /// Returned by a license exchange.
    License,
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vault(name) => write!(f, "vault {name}"),
            Self::License => f.write_str("license"),
        }
    }
}

/// Progress notifications published while a job runs.
#[derive(Debug, Clone)]
pub enum TrackEvent {
    StateChanged {
        track_id: Arc<str>,
        state: DownloadState,
    },
    KeyResolved {
        track_id: Arc<str>,
        kid: KeyId,
        source: KeySource,
    },
    SegmentDownloaded {
        track_id: Arc<str>,
        index: u64,
        bytes: usize,
    },
    SegmentDecrypted {
        track_id: Arc<str>,
        index: u64,
        bytes: usize,
    },
}

impl TrackEvent {
    pub fn track_id(&self) -> &str {
        match self {
            Self::StateChanged { track_id, .. }
            | Self::KeyResolved { track_id, .. }
            | Self::SegmentDownloaded { track_id, .. }
            | Self::SegmentDecrypted { track_id, .. } => track_id,
        }
    }
}

/// Sender half shared by every pipeline of a job. Events with no
/// subscribers are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TrackEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: TrackEvent) {
        let _ = self.sender.send(event);
    }
}
