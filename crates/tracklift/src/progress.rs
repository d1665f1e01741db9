use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::state::DownloadState;

/// Live counters for one track, shared between the pipeline and observers.
#[derive(Debug)]
pub struct TrackProgress {
    total: u64,
    downloaded: AtomicU64,
    decrypted: AtomicU64,
    bytes_downloaded: AtomicU64,
    bytes_written: AtomicU64,
    state: RwLock<DownloadState>,
}

/// Point-in-time copy of [`TrackProgress`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total: u64,
    pub downloaded: u64,
    pub decrypted: u64,
    pub bytes_downloaded: u64,
    pub bytes_written: u64,
    pub state: DownloadState,
}

impl TrackProgress {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            downloaded: AtomicU64::new(0),
            decrypted: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            state: RwLock::new(DownloadState::Pending),
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Acquire)
    }

    pub fn decrypted(&self) -> u64 {
        self.decrypted.load(Ordering::Acquire)
    }

    pub fn state(&self) -> DownloadState {
        self.state.read().clone()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total,
            downloaded: self.downloaded(),
            decrypted: self.decrypted(),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            state: self.state(),
        }
    }

    pub(crate) fn record_downloaded(&self, bytes: usize) {
        self.bytes_downloaded.fetch_add(bytes as u64, Ordering::Relaxed);
        self.downloaded.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_decrypted(&self, bytes: usize) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
        self.decrypted.fetch_add(1, Ordering::AcqRel);
    }

    /// Applies `next` if the lifecycle allows it; returns whether it did.
    pub(crate) fn transition(&self, next: DownloadState) -> bool {
        let mut state = self.state.write();
        if !state.can_transition_to(&next) {
            return false;
        }
        *state = next;
        true
    }
}
