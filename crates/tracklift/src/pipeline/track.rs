//! Per-track orchestration: keys, download, decrypt, write.

use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::decrypt::{SegmentStream, TrackDecryptor};
use crate::download::fetcher::SegmentSource;
use crate::download::reorder::SegmentPiece;
use crate::download::scheduler::SegmentScheduler;
use crate::drm::resolver::{KeyResolver, ResolvedKey};
use crate::error::PipelineError;
use crate::events::{EventBus, TrackEvent};
use crate::progress::{ProgressSnapshot, TrackProgress};
use crate::sink::OutputSink;
use crate::state::{DownloadState, FailureReason};
use crate::track::{MediaType, Segment, Track};

/// Collaborators shared by every track of a job.
pub struct PipelineContext {
    pub config: EngineConfig,
    pub resolver: Arc<KeyResolver>,
    pub source: Arc<dyn SegmentSource>,
    pub connection_limit: Option<Arc<Semaphore>>,
    pub events: EventBus,
}

/// Outcome of one track.
#[derive(Debug, Clone)]
pub struct TrackReport {
    pub track_id: String,
    pub kind: MediaType,
    pub state: DownloadState,
    pub progress: ProgressSnapshot,
    /// Error detail behind a `Failed` state.
    pub error: Option<String>,
    pub keys: Vec<ResolvedKey>,
}

impl TrackReport {
    pub fn is_completed(&self) -> bool {
        self.state == DownloadState::Completed
    }
}

pub struct TrackPipeline {
    track: Track,
    track_id: Arc<str>,
    progress: Arc<TrackProgress>,
    context: Arc<PipelineContext>,
    token: CancellationToken,
}

impl TrackPipeline {
    pub fn new(track: Track, context: Arc<PipelineContext>, token: CancellationToken) -> Self {
        let progress = Arc::new(TrackProgress::new(track.segment_count()));
        Self {
            track_id: Arc::from(track.id.as_str()),
            track,
            progress,
            context,
            token,
        }
    }

    pub fn track(&self) -> &Track {
        &self.track
    }

    /// Live progress, valid before, during and after [`run`](Self::run).
    pub fn progress(&self) -> Arc<TrackProgress> {
        Arc::clone(&self.progress)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    fn set_state(&self, state: DownloadState) {
        if self.progress.transition(state.clone()) {
            debug!(track = %self.track_id, %state, "Track state changed");
            self.context.events.emit(TrackEvent::StateChanged {
                track_id: Arc::clone(&self.track_id),
                state,
            });
        } else {
            warn!(track = %self.track_id, from = %self.progress.state(), to = %state, "Ignoring invalid state transition");
        }
    }

    /// Drives the track to `Completed` or `Failed`. On failure the sink is
    /// aborted so no partial output survives.
    #[instrument(name = "track", skip_all, fields(id = %self.track_id, kind = %self.track.kind))]
    pub async fn run(self, mut sink: Box<dyn OutputSink>) -> TrackReport {
        let mut keys = Vec::new();
        let result = self.drive(sink.as_mut(), &mut keys).await;

        let error = match result {
            Ok(()) => {
                info!(segments = self.progress.total(), "Track completed");
                self.set_state(DownloadState::Completed);
                None
            }
            Err(err) => {
                if matches!(err, PipelineError::Cancelled) {
                    info!("Track cancelled");
                } else {
                    error!(error = %err, "Track failed");
                }
                if let Err(e) = sink.abort().await {
                    warn!(error = %e, "Could not discard partial output");
                }
                self.set_state(DownloadState::Failed(FailureReason::from(&err)));
                Some(err.to_string())
            }
        };

        TrackReport {
            track_id: self.track.id.clone(),
            kind: self.track.kind,
            state: self.progress.state(),
            progress: self.progress.snapshot(),
            error,
            keys,
        }
    }

    /// Only resolves keys, leaving segments untouched.
    pub async fn resolve_keys(&self) -> Result<Vec<ResolvedKey>, PipelineError> {
        self.track.validate()?;
        match &self.track.protection {
            Some(protection) => {
                self.context
                    .resolver
                    .ensure_keys(protection, &self.token)
                    .await
            }
            None => Ok(Vec::new()),
        }
    }

    async fn drive(
        &self,
        sink: &mut dyn OutputSink,
        keys: &mut Vec<ResolvedKey>,
    ) -> Result<(), PipelineError> {
        self.track.validate()?;

        if let Some(protection) = &self.track.protection {
            self.set_state(DownloadState::AwaitingLicense);
            *keys = self
                .context
                .resolver
                .ensure_keys(protection, &self.token)
                .await?;
            for resolved in keys.iter() {
                self.context.events.emit(TrackEvent::KeyResolved {
                    track_id: Arc::clone(&self.track_id),
                    kid: *resolved.key.kid(),
                    source: resolved.source.clone(),
                });
            }
        }

        self.set_state(DownloadState::Downloading);

        let config = &self.context.config;
        let segments: Arc<[_]> = self.track.segments.clone().into();
        let total = segments.len() as u64;
        let (tx, mut rx) = mpsc::channel(config.scheduler.output_channel_capacity);
        let download_token = self.token.child_token();

        let scheduler = SegmentScheduler::new(
            Arc::clone(&self.track_id),
            Arc::clone(&segments),
            Arc::clone(&self.context.source),
            config.scheduler.clone(),
            &config.fetcher,
            Arc::clone(&self.progress),
            self.context.events.clone(),
            tx,
            download_token.clone(),
        )
        .with_connection_limit(self.context.connection_limit.clone());
        let downloader = tokio::spawn(scheduler.run());

        let mut decryptor = TrackDecryptor::new(
            self.track.protection.clone(),
            self.context.resolver.vaults().clone(),
            &config.decryption,
        );

        let outcome: Result<(), PipelineError> = async {
            let mut current: Option<SegmentStream> = None;
            let mut written = 0usize;
            while let Some(item) = rx.recv().await {
                match item? {
                    SegmentPiece::Data { index, data } => {
                        let mut stream = match current.take() {
                            Some(stream) => stream,
                            None => decryptor.open_segment(segment_at(&segments, index)?).await?,
                        };
                        if stream.index() != index {
                            return Err(PipelineError::internal(format!(
                                "segment {index} arrived while segment {} was open",
                                stream.index()
                            )));
                        }
                        for chunk in stream.update(data).await? {
                            sink.write(&chunk).await?;
                            written += chunk.len();
                        }
                        current = Some(stream);
                    }
                    SegmentPiece::End { index, .. } => {
                        if index + 1 == total {
                            self.set_state(DownloadState::Decrypting);
                        }
                        let stream = match current.take() {
                            Some(stream) => stream,
                            None => decryptor.open_segment(segment_at(&segments, index)?).await?,
                        };
                        let tail = stream.finish()?;
                        if !tail.is_empty() {
                            sink.write(&tail).await?;
                            written += tail.len();
                        }
                        self.progress.record_decrypted(written);
                        self.context.events.emit(TrackEvent::SegmentDecrypted {
                            track_id: Arc::clone(&self.track_id),
                            index,
                            bytes: written,
                        });
                        written = 0;
                    }
                }
            }

            if self.progress.decrypted() != total {
                return Err(PipelineError::internal(format!(
                    "downloader stopped after {} of {total} segments",
                    self.progress.decrypted()
                )));
            }
            sink.finish().await?;
            Ok(())
        }
        .await;

        if outcome.is_err() {
            download_token.cancel();
        }
        drop(rx);
        if let Err(e) = downloader.await {
            warn!(error = %e, "Segment scheduler task ended abnormally");
        }
        outcome
    }
}

fn segment_at(segments: &[Segment], index: u64) -> Result<&Segment, PipelineError> {
    usize::try_from(index)
        .ok()
        .and_then(|i| segments.get(i))
        .ok_or_else(|| PipelineError::internal(format!("unknown segment index {index}")))
}
