//! Per-track download scheduler.
//!
//! Keeps up to `download_concurrency` fetches in flight, never more than
//! `reorder_capacity` segments ahead of the next one owed downstream, and
//! forwards segment bytes to the decryptor strictly in index order. Bytes of
//! the segment owed next are forwarded as they arrive.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::config::{FetcherConfig, SchedulerConfig};
use crate::download::fetcher::SegmentSource;
use crate::download::reorder::{ReorderBuffer, SegmentPiece};
use crate::download::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use crate::error::{PipelineError, TransportError};
use crate::events::{EventBus, TrackEvent};
use crate::progress::TrackProgress;
use crate::track::Segment;

/// Items sent to the decryptor. An `Err` is always the last item.
pub type SchedulerOutput = Result<SegmentPiece, PipelineError>;

/// What a running fetch reports back to the scheduler loop. `Done` is always
/// the last event of a fetch.
enum FetchEvent {
    Data { index: u64, data: Bytes },
    Done {
        index: u64,
        result: Result<u64, PipelineError>,
    },
}

pub struct SegmentScheduler {
    track_id: Arc<str>,
    segments: Arc<[Segment]>,
    source: Arc<dyn SegmentSource>,
    config: SchedulerConfig,
    retry: RetryPolicy,
    verify_size: bool,
    connection_limit: Option<Arc<Semaphore>>,
    progress: Arc<TrackProgress>,
    events: EventBus,
    output_tx: mpsc::Sender<SchedulerOutput>,
    token: CancellationToken,
}

impl SegmentScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        track_id: Arc<str>,
        segments: Arc<[Segment]>,
        source: Arc<dyn SegmentSource>,
        config: SchedulerConfig,
        fetcher: &FetcherConfig,
        progress: Arc<TrackProgress>,
        events: EventBus,
        output_tx: mpsc::Sender<SchedulerOutput>,
        token: CancellationToken,
    ) -> Self {
        Self {
            track_id,
            segments,
            source,
            config,
            retry: fetcher.retry.clone(),
            verify_size: fetcher.verify_size,
            connection_limit: None,
            progress,
            events,
            output_tx,
            token,
        }
    }

    /// Shares a connection budget with other schedulers of the same job.
    pub fn with_connection_limit(mut self, limit: Option<Arc<Semaphore>>) -> Self {
        self.connection_limit = limit;
        self
    }

    pub async fn run(self) {
        let total = self.segments.len();
        info!(track = %self.track_id, segments = total, "Segment scheduler started");

        let concurrency = self.config.download_concurrency.max(1);
        let mut reorder = ReorderBuffer::new(self.config.reorder_capacity.max(concurrency));
        let (fetch_tx, mut fetch_rx) = mpsc::channel(concurrency * 4);
        let mut in_flight = FuturesUnordered::new();
        // Fetches that have not reported `Done` yet.
        let mut outstanding = 0usize;
        let mut next_dispatch = 0usize;
        let fetch_token = self.token.child_token();
        let mut failure: Option<PipelineError> = None;

        loop {
            while failure.is_none()
                && next_dispatch < total
                && outstanding < concurrency
                && reorder.can_accept(next_dispatch as u64)
            {
                let segment = self.segments[next_dispatch].clone();
                trace!(track = %self.track_id, index = segment.index, "Dispatching segment");
                in_flight.push(fetch_segment(
                    Arc::clone(&self.source),
                    segment,
                    self.retry.clone(),
                    self.verify_size,
                    self.connection_limit.clone(),
                    fetch_token.clone(),
                    fetch_tx.clone(),
                ));
                outstanding += 1;
                next_dispatch += 1;
            }

            if outstanding == 0 {
                break;
            }

            let event = tokio::select! {
                biased;

                _ = self.token.cancelled(), if failure.is_none() => {
                    info!(track = %self.track_id, "Cancellation received, draining in-flight fetches");
                    failure = Some(PipelineError::Cancelled);
                    fetch_token.cancel();
                    continue;
                }

                Some(event) = fetch_rx.recv() => event,

                Some(()) = in_flight.next() => continue,
            };

            match event {
                FetchEvent::Data { index, data } => {
                    if failure.is_none() {
                        reorder.push_data(index, data);
                    }
                }
                FetchEvent::Done { index, result } => {
                    outstanding -= 1;
                    if failure.is_some() {
                        trace!(track = %self.track_id, index, "Discarding result while draining");
                        continue;
                    }
                    match result {
                        Ok(size) => {
                            self.progress.record_downloaded(size as usize);
                            self.events.emit(TrackEvent::SegmentDownloaded {
                                track_id: Arc::clone(&self.track_id),
                                index,
                                bytes: size as usize,
                            });
                            reorder.push_end(index);
                        }
                        Err(err) => {
                            error!(track = %self.track_id, index, error = %err, "Segment failed, cancelling track downloads");
                            failure = Some(err);
                            fetch_token.cancel();
                        }
                    }
                }
            }

            if failure.is_none() {
                while let Some(piece) = reorder.pop_ready() {
                    if self.output_tx.send(Ok(piece)).await.is_err() {
                        debug!(track = %self.track_id, "Decryptor gone, stopping downloads");
                        failure = Some(PipelineError::Cancelled);
                        fetch_token.cancel();
                        break;
                    }
                }
            }
        }

        reorder.metrics().log_summary(&self.track_id);
        match failure {
            Some(err) => {
                let _ = self.output_tx.send(Err(err)).await;
            }
            None => debug!(track = %self.track_id, "All segments forwarded"),
        }
    }
}

/// One segment, retried per `policy`, reported through `events`. Always ends
/// with a `Done` event.
async fn fetch_segment(
    source: Arc<dyn SegmentSource>,
    segment: Segment,
    policy: RetryPolicy,
    verify_size: bool,
    connection_limit: Option<Arc<Semaphore>>,
    token: CancellationToken,
    events: mpsc::Sender<FetchEvent>,
) {
    let index = segment.index;
    let expected = segment.expected_len().filter(|_| verify_size);
    let delivered = AtomicU64::new(0);
    let mismatch_retried = AtomicBool::new(false);

    let attempt = Attempt {
        source: source.as_ref(),
        segment: &segment,
        expected,
        limit: connection_limit.as_deref(),
        delivered: &delivered,
        events: &events,
        token: &token,
    };
    let (attempt, mismatch_retried) = (&attempt, &mismatch_retried);

    // A size mismatch gets one immediate extra attempt that does not count
    // against the transient retry budget.
    let result = retry_with_backoff(&policy, &token, |_| async move {
        loop {
            match attempt.run().await {
                Ok(()) => return RetryAction::Success(attempt.delivered.load(Ordering::Relaxed)),
                Err(err @ TransportError::SizeMismatch { .. }) => {
                    if mismatch_retried.swap(true, Ordering::Relaxed) {
                        return RetryAction::Fail(err);
                    }
                    debug!(index, error = %err, "Size mismatch, fetching segment once more");
                }
                Err(err) if err.is_retryable() => return RetryAction::Retry(err),
                Err(err) => return RetryAction::Fail(err),
            }
        }
    })
    .await;

    let result = result.map_err(|err| match err {
        TransportError::Cancelled => PipelineError::Cancelled,
        TransportError::SizeMismatch { .. } => PipelineError::CorruptSegment {
            index,
            reason: err.to_string(),
        },
        other => PipelineError::SegmentUnavailable {
            index,
            reason: other.to_string(),
        },
    });
    let _ = events.send(FetchEvent::Done { index, result }).await;
}

/// State shared by every attempt at one segment.
struct Attempt<'a> {
    source: &'a dyn SegmentSource,
    segment: &'a Segment,
    expected: Option<u64>,
    limit: Option<&'a Semaphore>,
    /// Bytes already forwarded. A later attempt skips this prefix of its
    /// body, so the segment is never sent twice.
    delivered: &'a AtomicU64,
    events: &'a mpsc::Sender<FetchEvent>,
    token: &'a CancellationToken,
}

impl Attempt<'_> {
    async fn run(&self) -> Result<(), TransportError> {
        let token = self.token;
        let _permit = match self.limit {
            Some(semaphore) => tokio::select! {
                _ = token.cancelled() => return Err(TransportError::Cancelled),
                permit = semaphore.acquire() => {
                    Some(permit.map_err(|_| TransportError::Cancelled)?)
                }
            },
            None => None,
        };

        let mut body = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(TransportError::Cancelled),
            opened = self.source.open(self.segment, token) => opened?,
        };

        let mut received = 0u64;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(TransportError::Cancelled),
                chunk = body.next() => match chunk {
                    Some(chunk) => chunk?,
                    None => break,
                },
            };
            let start = received;
            received += chunk.len() as u64;
            self.forward(chunk, start, received).await?;

            if let Some(expected) = self.expected {
                if received > expected {
                    return Err(TransportError::SizeMismatch {
                        expected,
                        actual: received,
                    });
                }
            }
        }

        let delivered = self.delivered.load(Ordering::Relaxed);
        match self.expected {
            Some(expected) if received != expected => Err(TransportError::SizeMismatch {
                expected,
                actual: received,
            }),
            // Shorter than what an earlier attempt already sent.
            None if received < delivered => Err(TransportError::SizeMismatch {
                expected: delivered,
                actual: received,
            }),
            _ => Ok(()),
        }
    }

    /// Sends the part of `chunk` (body bytes `start..end`) not yet delivered,
    /// stopping at the expected size.
    async fn forward(&self, chunk: Bytes, start: u64, end: u64) -> Result<(), TransportError> {
        let delivered = self.delivered.load(Ordering::Relaxed);
        let end = self.expected.map_or(end, |expected| end.min(expected));
        let from = delivered.max(start);
        if end <= from {
            return Ok(());
        }

        let data = chunk.slice((from - start) as usize..(end - start) as usize);
        let index = self.segment.index;
        if self.events.send(FetchEvent::Data { index, data }).await.is_err() {
            return Err(TransportError::Cancelled);
        }
        self.delivered.store(end, Ordering::Relaxed);
        Ok(())
    }
}
