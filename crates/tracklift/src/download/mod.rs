//! Segment acquisition: fetching, retrying, scheduling and reordering.

pub mod fetcher;
pub mod reorder;
pub mod retry;
pub mod scheduler;

pub use fetcher::{HttpSegmentFetcher, SegmentBody, SegmentSource};
pub use reorder::{BufferStats, ReorderBuffer, ReorderMetrics, SegmentPiece};
pub use retry::{RetryAction, RetryPolicy, retry_with_backoff};
pub use scheduler::{SchedulerOutput, SegmentScheduler};
