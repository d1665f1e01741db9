//! Bounded reorder buffer: accepts segment bytes in arrival order and
//! releases them strictly by index.
//!
//! Bytes of the segment owed next pass straight through; later segments are
//! held until every segment before them has ended.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tracing::{debug, warn};

/// One ordered unit of scheduler output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentPiece {
    /// The next bytes of segment `index`.
    Data { index: u64, data: Bytes },
    /// Segment `index` is complete; `size` bytes were released for it.
    End { index: u64, size: u64 },
}

impl SegmentPiece {
    pub fn index(&self) -> u64 {
        match self {
            Self::Data { index, .. } | Self::End { index, .. } => *index,
        }
    }
}

/// Counters describing how much reordering a track needed.
#[derive(Debug, Default)]
pub struct ReorderMetrics {
    pub segments_received: AtomicU64,
    pub segments_emitted: AtomicU64,
    pub segments_rejected: AtomicU64,
    pub max_buffer_depth: AtomicU64,
    pub max_buffer_bytes: AtomicU64,
}

impl ReorderMetrics {
    fn observe_depth(&self, depth: usize, bytes: usize) {
        self.max_buffer_depth.fetch_max(depth as u64, Ordering::Relaxed);
        self.max_buffer_bytes.fetch_max(bytes as u64, Ordering::Relaxed);
    }

    pub fn log_summary(&self, track_id: &str) {
        debug!(
            track = track_id,
            received = self.segments_received.load(Ordering::Relaxed),
            emitted = self.segments_emitted.load(Ordering::Relaxed),
            rejected = self.segments_rejected.load(Ordering::Relaxed),
            max_depth = self.max_buffer_depth.load(Ordering::Relaxed),
            max_bytes = self.max_buffer_bytes.load(Ordering::Relaxed),
            "Reorder buffer statistics"
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferStats {
    pub segment_count: usize,
    pub byte_size: usize,
    pub oldest_index: Option<u64>,
    pub newest_index: Option<u64>,
}

#[derive(Default)]
struct PendingSegment {
    chunks: VecDeque<Bytes>,
    released: u64,
    ended: bool,
}

pub struct ReorderBuffer {
    next_index: u64,
    capacity: usize,
    pending: BTreeMap<u64, PendingSegment>,
    pending_bytes: usize,
    metrics: ReorderMetrics,
}

impl ReorderBuffer {
    /// `capacity` bounds how far past the next owed index a segment may be.
    pub fn new(capacity: usize) -> Self {
        Self {
            next_index: 0,
            capacity: capacity.max(1),
            pending: BTreeMap::new(),
            pending_bytes: 0,
            metrics: ReorderMetrics::default(),
        }
    }

    /// Index of the next segment owed downstream.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Whether `index` falls inside the current window.
    pub fn can_accept(&self, index: u64) -> bool {
        index >= self.next_index && index < self.next_index + self.capacity as u64
    }

    fn entry(&mut self, index: u64) -> Option<&mut PendingSegment> {
        if index < self.next_index || self.pending.get(&index).is_some_and(|p| p.ended) {
            warn!(index, next = self.next_index, "Dropping data for a finished segment");
            self.metrics.segments_rejected.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        Some(self.pending.entry(index).or_default())
    }

    /// Queues the next bytes of `index`. Bytes for a segment that already
    /// ended are dropped and return `false`.
    pub fn push_data(&mut self, index: u64, data: Bytes) -> bool {
        let len = data.len();
        let Some(segment) = self.entry(index) else {
            return false;
        };
        segment.chunks.push_back(data);
        self.pending_bytes += len;
        self.metrics
            .observe_depth(self.pending.len(), self.pending_bytes);
        true
    }

    /// Marks `index` complete. Returns `false` if it had already ended.
    pub fn push_end(&mut self, index: u64) -> bool {
        let Some(segment) = self.entry(index) else {
            return false;
        };
        segment.ended = true;
        self.metrics.segments_received.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Releases the next piece owed downstream, if it has arrived.
    pub fn pop_ready(&mut self) -> Option<SegmentPiece> {
        let index = self.next_index;
        let mut entry = self.pending.first_entry()?;
        if *entry.key() != index {
            return None;
        }

        let segment = entry.get_mut();
        if let Some(data) = segment.chunks.pop_front() {
            segment.released += data.len() as u64;
            self.pending_bytes -= data.len();
            return Some(SegmentPiece::Data { index, data });
        }
        if !segment.ended {
            return None;
        }

        let size = entry.remove().released;
        self.next_index += 1;
        self.metrics.segments_emitted.fetch_add(1, Ordering::Relaxed);
        Some(SegmentPiece::End { index, size })
    }

    /// Segments with buffered bytes or an unreleased end.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            segment_count: self.pending.len(),
            byte_size: self.pending_bytes,
            oldest_index: self.pending.keys().next().copied(),
            newest_index: self.pending.keys().next_back().copied(),
        }
    }

    pub fn metrics(&self) -> &ReorderMetrics {
        &self.metrics
    }
}
