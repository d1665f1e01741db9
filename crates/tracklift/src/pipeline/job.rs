//! Multi-track jobs.

use std::sync::Arc;

use futures::StreamExt;
use keyvault::{MemoryVault, Vaults};
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::track::{PipelineContext, TrackPipeline, TrackReport};
use crate::config::EngineConfig;
use crate::download::fetcher::{HttpSegmentFetcher, SegmentSource};
use crate::drm::cdm::CdmRegistry;
use crate::drm::license::{HttpLicenseClient, LicenseTransport};
use crate::drm::resolver::{KeyResolver, ResolvedKey};
use crate::error::{PipelineError, TransportError};
use crate::events::{EventBus, TrackEvent};
use crate::sink::OutputSink;
use crate::state::DownloadState;
use crate::track::Track;

/// Name of the in-memory vault every job appends to its vault list.
pub const SESSION_VAULT: &str = "session";

/// Reports for every track of a job, in input order.
#[derive(Debug, Clone, Default)]
pub struct JobReport {
    pub tracks: Vec<TrackReport>,
}

impl JobReport {
    pub fn all_completed(&self) -> bool {
        self.tracks.iter().all(TrackReport::is_completed)
    }

    pub fn failed(&self) -> impl Iterator<Item = &TrackReport> {
        self.tracks
            .iter()
            .filter(|r| matches!(r.state, DownloadState::Failed(_)))
    }
}

/// Keys resolved for one track in license-only mode.
#[derive(Debug)]
pub struct KeyReport {
    pub track_id: String,
    pub result: Result<Vec<ResolvedKey>, PipelineError>,
}

/// Runs tracks with at most `max_concurrent_tracks` in parallel. Each track
/// gets its own cancellation scope under the job token, so one failing
/// track never stops the others.
pub struct JobRunner {
    context: Arc<PipelineContext>,
    token: CancellationToken,
}

impl JobRunner {
    pub fn new(
        config: EngineConfig,
        mut vaults: Vaults,
        cdms: CdmRegistry,
        transport: Arc<dyn LicenseTransport>,
        source: Arc<dyn SegmentSource>,
    ) -> Self {
        let config = config.normalized();
        // Licensed keys always have a writable home, even when every
        // configured vault is read-only.
        vaults.push(Arc::new(MemoryVault::new(SESSION_VAULT)));

        let resolver = Arc::new(KeyResolver::new(
            vaults,
            cdms,
            transport,
            config.drm.key_policy,
            config.drm.license_retry.clone(),
        ));
        let connection_limit = config
            .scheduler
            .max_total_connections
            .map(|n| Arc::new(Semaphore::new(n)));
        let events = EventBus::new(config.job.event_capacity);

        Self {
            context: Arc::new(PipelineContext {
                config,
                resolver,
                source,
                connection_limit,
                events,
            }),
            token: CancellationToken::new(),
        }
    }

    /// A runner wired to the HTTP segment fetcher and license client.
    pub fn with_http(
        config: EngineConfig,
        vaults: Vaults,
        cdms: CdmRegistry,
    ) -> Result<Self, TransportError> {
        let client = config.http.build_client()?;
        let source = Arc::new(HttpSegmentFetcher::new(
            client.clone(),
            config.fetcher.segment_timeout,
        ));
        let transport = Arc::new(
            HttpLicenseClient::new(client, config.drm.license_timeout)
                .with_default_url(config.drm.default_license_url.clone())
                .with_headers(config.drm.license_headers.clone()),
        );
        Ok(Self::new(config, vaults, cdms, transport, source))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackEvent> {
        self.context.events.subscribe()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn resolver(&self) -> &KeyResolver {
        &self.context.resolver
    }

    /// Builds the pipeline for `track` so callers can grab its progress
    /// handle before running it.
    pub fn prepare(&self, track: Track) -> TrackPipeline {
        TrackPipeline::new(track, Arc::clone(&self.context), self.token.child_token())
    }

    pub async fn run(&self, tasks: Vec<(TrackPipeline, Box<dyn OutputSink>)>) -> JobReport {
        let total = tasks.len();
        let limit = self.context.config.job.max_concurrent_tracks;
        info!(tracks = total, concurrent = limit, "Starting job");

        let mut reports: Vec<(usize, TrackReport)> =
            futures::stream::iter(tasks.into_iter().enumerate().map(
                |(position, (pipeline, sink))| async move { (position, pipeline.run(sink).await) },
            ))
            .buffer_unordered(limit)
            .collect()
            .await;
        reports.sort_by_key(|(position, _)| *position);

        let report = JobReport {
            tracks: reports.into_iter().map(|(_, r)| r).collect(),
        };
        let failed = report.failed().count();
        if failed > 0 {
            warn!(failed, total, "Job finished with failed tracks");
        } else {
            info!(total, "Job finished");
        }
        report
    }

    /// Resolves keys for every protected track without downloading anything.
    pub async fn resolve_keys(&self, tracks: Vec<Track>) -> Vec<KeyReport> {
        let limit = self.context.config.job.max_concurrent_tracks;
        let mut reports: Vec<(usize, KeyReport)> =
            futures::stream::iter(tracks.into_iter().enumerate().map(|(position, track)| {
                let pipeline = self.prepare(track);
                async move {
                    let result = pipeline.resolve_keys().await;
                    let track_id = pipeline.track().id.clone();
                    (position, KeyReport { track_id, result })
                }
            }))
            .buffer_unordered(limit)
            .collect()
            .await;
        reports.sort_by_key(|(position, _)| *position);
        reports.into_iter().map(|(_, r)| r).collect()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}
