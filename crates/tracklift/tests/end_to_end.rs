//! Whole-pipeline behaviour with in-memory segment sources and license
//! servers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use futures::{StreamExt, stream};
use keyvault::{ContentKey, KeyId, MemoryVault, Vault, Vaults};
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracklift_engine::decrypt::encrypt_segment;
use tracklift_engine::drm::CdmSessionId;
use tracklift_engine::{
    Cdm, CdmError, CdmRegistry, CipherScheme, ClearKeyCdm, DownloadState, DrmSystem, EngineConfig,
    FailureReason, FileSink, JobRunner, LicenseTransport, MediaType, MemorySink, OutputSink,
    ProtectionDescriptor, RetryPolicy, Segment, SegmentBody, SegmentSource, Track, TrackEvent,
    TransportError,
};

const KID: KeyId = KeyId::from_bytes([0x10; 16]);
const KEY: [u8; 16] = [0x3c; 16];

/// Serves bodies by URL with optional per-URL delay and failure script.
#[derive(Default)]
struct MemorySource {
    bodies: HashMap<String, Bytes>,
    delays: HashMap<String, Duration>,
    always_fail: HashMap<String, StatusCode>,
    /// Streams bodies in chunks of this size, pausing between chunks.
    piece_size: Option<usize>,
    calls: AtomicUsize,
}

impl MemorySource {
    fn serve(&mut self, url: &str, body: impl Into<Bytes>) {
        self.bodies.insert(url.to_string(), body.into());
    }
}

#[async_trait]
impl SegmentSource for MemorySource {
    async fn open(
        &self,
        segment: &Segment,
        _token: &CancellationToken,
    ) -> Result<SegmentBody, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(&segment.url) {
            tokio::time::sleep(*delay).await;
        }
        if let Some(status) = self.always_fail.get(&segment.url) {
            return Err(TransportError::http_status(*status, &segment.url));
        }
        let body = self
            .bodies
            .get(&segment.url)
            .cloned()
            .ok_or_else(|| TransportError::http_status(StatusCode::NOT_FOUND, &segment.url))?;

        let Some(size) = self.piece_size else {
            return Ok(stream::once(async move { Ok(body) }).boxed());
        };
        let pieces: Vec<Bytes> = (0..body.len())
            .step_by(size)
            .map(|at| body.slice(at..(at + size).min(body.len())))
            .collect();
        Ok(stream::iter(pieces)
            .then(|piece| async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Ok(piece)
            })
            .boxed())
    }
}

/// Answers every ClearKey challenge with a fixed key set.
struct StaticLicenseServer {
    keys: Vec<(KeyId, Vec<u8>)>,
    calls: AtomicUsize,
}

impl StaticLicenseServer {
    fn new(keys: Vec<(KeyId, Vec<u8>)>) -> Self {
        Self {
            keys,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LicenseTransport for StaticLicenseServer {
    async fn acquire(
        &self,
        _descriptor: &ProtectionDescriptor,
        _challenge: Bytes,
        _token: &CancellationToken,
    ) -> Result<Bytes, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let keys: Vec<_> = self
            .keys
            .iter()
            .map(|(kid, key)| {
                serde_json::json!({
                    "kty": "oct",
                    "kid": URL_SAFE_NO_PAD.encode(kid.as_bytes()),
                    "k": URL_SAFE_NO_PAD.encode(key),
                })
            })
            .collect();
        Ok(Bytes::from(serde_json::json!({ "keys": keys }).to_string()))
    }
}

/// ClearKey with a session counter.
struct CountingClearKey {
    inner: ClearKeyCdm,
    opened: AtomicUsize,
}

impl Cdm for CountingClearKey {
    fn system(&self) -> &DrmSystem {
        self.inner.system()
    }
    fn open(&self) -> Result<CdmSessionId, CdmError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.inner.open()
    }
    fn challenge(
        &self,
        session: CdmSessionId,
        descriptor: &ProtectionDescriptor,
    ) -> Result<Bytes, CdmError> {
        self.inner.challenge(session, descriptor)
    }
    fn parse_license(&self, session: CdmSessionId, license: &[u8]) -> Result<Vec<ContentKey>, CdmError> {
        self.inner.parse_license(session, license)
    }
    fn close(&self, session: CdmSessionId) {
        self.inner.close(session)
    }
}

fn boxed(sink: &MemorySink) -> Box<dyn OutputSink> {
    Box::new(sink.clone())
}

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.fetcher.retry = RetryPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: false,
    };
    config.drm.license_retry.base_delay = Duration::from_millis(1);
    config
}

fn clear_track(id: &str, n: usize) -> Track {
    Track::new(id, MediaType::Video).with_segments(
        (0..n).map(|i| Segment::new(0, format!("mem://{id}/{i}"))),
    )
}

fn payload(track: &str, index: usize) -> Vec<u8> {
    format!("{track}:{index}:").repeat(7).into_bytes()
}

fn protected_track(id: &str, n: usize) -> (Track, MemorySource, Vec<u8>) {
    let descriptor = ProtectionDescriptor::new(DrmSystem::clearkey(), vec![KID])
        .with_scheme(CipherScheme::Cbc)
        .with_iv([0x55; 16]);
    let track = clear_track(id, n).with_protection(descriptor.clone());
    let mut source = MemorySource::default();
    let mut plaintext = Vec::new();
    for i in 0..n {
        let plain = payload(id, i);
        let encrypted =
            encrypt_segment(CipherScheme::Cbc, &KEY, &descriptor.segment_iv(i as u64), &plain)
                .unwrap();
        source.serve(&format!("mem://{id}/{i}"), encrypted);
        plaintext.extend_from_slice(&plain);
    }
    (track, source, plaintext)
}

fn runner_with(
    config: EngineConfig,
    vaults: Vaults,
    cdm: Arc<dyn Cdm>,
    license: Arc<dyn LicenseTransport>,
    source: Arc<dyn SegmentSource>,
) -> JobRunner {
    let mut cdms = CdmRegistry::new();
    cdms.register(cdm);
    JobRunner::new(config, vaults, cdms, license, source)
}

#[tokio::test]
async fn out_of_order_arrival_yields_ordered_output() {
    let mut source = MemorySource::default();
    // Segments 1..=4 complete in the order 2, 1, 4, 3.
    let delays = [20u64, 5, 40, 30];
    let mut expected = Vec::new();
    for (i, delay) in delays.iter().enumerate() {
        let url = format!("mem://v/{i}");
        source.serve(&url, payload("v", i));
        source.delays.insert(url, Duration::from_millis(*delay));
        expected.extend(payload("v", i));
    }

    let runner = runner_with(
        fast_config(),
        Vaults::new(),
        Arc::new(ClearKeyCdm::new()),
        Arc::new(StaticLicenseServer::new(vec![])),
        Arc::new(source),
    );
    let pipeline = runner.prepare(clear_track("v", 4));
    let progress = pipeline.progress();
    let sink = MemorySink::new();

    let report = runner.run(vec![(pipeline, boxed(&sink))]).await;

    let snapshot = progress.snapshot();
    assert_eq!(
        (snapshot.total, snapshot.downloaded, snapshot.decrypted),
        (4, 4, 4)
    );
    assert_eq!(snapshot.state, DownloadState::Completed);
    assert!(report.all_completed());
    assert_eq!(sink.contents(), expected);
}

#[tokio::test]
async fn encrypted_track_round_trips_through_license() {
    let (track, source, plaintext) = protected_track("enc", 6);
    let license = Arc::new(StaticLicenseServer::new(vec![(KID, KEY.to_vec())]));
    let vault = Arc::new(MemoryVault::new("persistent"));

    let runner = runner_with(
        fast_config(),
        Vaults::new().with(vault.clone()),
        Arc::new(ClearKeyCdm::new()),
        license.clone(),
        Arc::new(source),
    );
    let sink = MemorySink::new();
    let pipeline = runner.prepare(track);
    let report = runner.run(vec![(pipeline, boxed(&sink))]).await;

    assert!(report.all_completed(), "{:?}", report.tracks[0].error);
    assert_eq!(sink.contents(), plaintext);
    assert_eq!(license.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        vault.get("clearkey", &KID).await.unwrap(),
        Some(ContentKey::new(KID, KEY.to_vec()))
    );
    assert_eq!(report.tracks[0].keys.len(), 1);
}

#[tokio::test]
async fn encrypted_segments_streamed_in_pieces_decrypt_correctly() {
    let (track, mut source, plaintext) = protected_track("pieces", 4);
    // Not a multiple of the block size, so pieces straddle cipher blocks.
    source.piece_size = Some(5);
    let vault = Arc::new(MemoryVault::new("persistent"));
    vault
        .put("clearkey", &ContentKey::new(KID, KEY.to_vec()))
        .await
        .unwrap();

    let runner = runner_with(
        fast_config(),
        Vaults::new().with(vault),
        Arc::new(ClearKeyCdm::new()),
        Arc::new(StaticLicenseServer::new(vec![])),
        Arc::new(source),
    );
    let mut events = runner.subscribe();
    let sink = MemorySink::new();
    let pipeline = runner.prepare(track);
    let report = runner.run(vec![(pipeline, boxed(&sink))]).await;

    assert!(report.all_completed(), "{:?}", report.tracks[0].error);
    assert_eq!(sink.contents(), plaintext);

    let mut decrypted = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let TrackEvent::SegmentDecrypted { index, bytes, .. } = event {
            decrypted.push((index, bytes));
        }
    }
    let expected: Vec<(u64, usize)> = (0..4).map(|i| (i as u64, payload("pieces", i).len())).collect();
    assert_eq!(decrypted, expected);
}

#[tokio::test]
async fn stored_key_skips_license_exchange() {
    let (track, source, plaintext) = protected_track("cached", 3);
    let vault = Arc::new(MemoryVault::new("persistent"));
    vault
        .put("clearkey", &ContentKey::new(KID, KEY.to_vec()))
        .await
        .unwrap();
    let cdm = Arc::new(CountingClearKey {
        inner: ClearKeyCdm::new(),
        opened: AtomicUsize::new(0),
    });
    let license = Arc::new(StaticLicenseServer::new(vec![(KID, KEY.to_vec())]));

    let runner = runner_with(
        fast_config(),
        Vaults::new().with(vault),
        cdm.clone(),
        license.clone(),
        Arc::new(source),
    );
    let sink = MemorySink::new();
    let pipeline = runner.prepare(track);
    let report = runner.run(vec![(pipeline, boxed(&sink))]).await;

    assert!(report.all_completed());
    assert_eq!(sink.contents(), plaintext);
    assert_eq!(cdm.opened.load(Ordering::SeqCst), 0);
    assert_eq!(license.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn exhausted_retries_fail_track_and_remove_output() {
    let mut source = MemorySource::default();
    for i in 0..4 {
        source.serve(&format!("mem://bad/{i}"), payload("bad", i));
    }
    source
        .always_fail
        .insert("mem://bad/2".into(), StatusCode::SERVICE_UNAVAILABLE);
    let source = Arc::new(source);

    let runner = runner_with(
        fast_config(),
        Vaults::new(),
        Arc::new(ClearKeyCdm::new()),
        Arc::new(StaticLicenseServer::new(vec![])),
        source.clone(),
    );

    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("bad.mp4");
    let sink = FileSink::create(&target).await.unwrap();
    let pipeline = runner.prepare(clear_track("bad", 4));
    let report = runner.run(vec![(pipeline, Box::new(sink) as Box<dyn OutputSink>)]).await;

    assert_eq!(
        report.tracks[0].state,
        DownloadState::Failed(FailureReason::SegmentUnavailable(2))
    );
    assert!(!target.exists());
    assert!(!dir.path().join("bad.mp4.part").exists());
}

#[tokio::test]
async fn failing_track_does_not_affect_siblings() {
    let mut source = MemorySource::default();
    for i in 0..3 {
        source.serve(&format!("mem://good/{i}"), payload("good", i));
    }
    // "broken" segments are never served: 404 is final.
    let mut config = fast_config();
    config.job.max_concurrent_tracks = 2;

    let runner = runner_with(
        config,
        Vaults::new(),
        Arc::new(ClearKeyCdm::new()),
        Arc::new(StaticLicenseServer::new(vec![])),
        Arc::new(source),
    );
    let good_sink = MemorySink::new();
    let broken_sink = MemorySink::new();
    let tasks = vec![
        (runner.prepare(clear_track("broken", 3)), boxed(&broken_sink)),
        (runner.prepare(clear_track("good", 3)), boxed(&good_sink)),
    ];
    let report = runner.run(tasks).await;

    assert_eq!(report.tracks[0].track_id, "broken");
    assert!(matches!(
        report.tracks[0].state,
        DownloadState::Failed(FailureReason::SegmentUnavailable(_))
    ));
    assert_eq!(report.tracks[1].state, DownloadState::Completed);
    assert_eq!(good_sink.contents().len(), (0..3).map(|i| payload("good", i).len()).sum::<usize>());
    assert!(broken_sink.contents().is_empty());
    assert_eq!(report.failed().count(), 1);
}

#[tokio::test]
async fn unsupported_system_fails_before_download() {
    let descriptor = ProtectionDescriptor::new(DrmSystem::new("playready"), vec![KID]);
    let track = clear_track("pr", 2).with_protection(descriptor);
    let source = Arc::new(MemorySource::default());

    let runner = runner_with(
        fast_config(),
        Vaults::new(),
        Arc::new(ClearKeyCdm::new()),
        Arc::new(StaticLicenseServer::new(vec![])),
        source.clone(),
    );
    let pipeline = runner.prepare(track);
    let report = runner.run(vec![(pipeline, boxed(&MemorySink::new()))]).await;

    assert!(matches!(
        report.tracks[0].state,
        DownloadState::Failed(FailureReason::UnsupportedSystem(_))
    ));
    assert_eq!(source.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn shared_key_is_licensed_once_across_tracks() {
    let (video, mut source, video_plain) = protected_track("video", 2);
    let (audio, audio_source, audio_plain) = protected_track("audio", 2);
    source.bodies.extend(audio_source.bodies);
    let license = Arc::new(StaticLicenseServer::new(vec![(KID, KEY.to_vec())]));

    let mut config = fast_config();
    config.job.max_concurrent_tracks = 2;
    let runner = runner_with(
        config,
        Vaults::new(),
        Arc::new(ClearKeyCdm::new()),
        license.clone(),
        Arc::new(source),
    );
    let video_sink = MemorySink::new();
    let audio_sink = MemorySink::new();
    let tasks = vec![
        (runner.prepare(video), boxed(&video_sink)),
        (runner.prepare(audio), boxed(&audio_sink)),
    ];
    let report = runner.run(tasks).await;

    assert!(report.all_completed());
    assert_eq!(video_sink.contents(), video_plain);
    assert_eq!(audio_sink.contents(), audio_plain);
    assert_eq!(license.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancelled_job_fails_tracks_as_cancelled() {
    let mut source = MemorySource::default();
    for i in 0..3 {
        let url = format!("mem://slow/{i}");
        source.serve(&url, payload("slow", i));
        source.delays.insert(url, Duration::from_secs(30));
    }
    let runner = runner_with(
        fast_config(),
        Vaults::new(),
        Arc::new(ClearKeyCdm::new()),
        Arc::new(StaticLicenseServer::new(vec![])),
        Arc::new(source),
    );
    let sink = MemorySink::new();
    let pipeline = runner.prepare(clear_track("slow", 3));
    let token = runner.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        runner.run(vec![(pipeline, boxed(&sink))]),
    )
    .await
    .unwrap();
    assert_eq!(
        report.tracks[0].state,
        DownloadState::Failed(FailureReason::Cancelled)
    );
    assert!(sink.contents().is_empty());
}

#[tokio::test]
async fn license_only_mode_resolves_without_downloading() {
    let (track, source, _) = protected_track("keys", 2);
    let source = Arc::new(source);
    let license = Arc::new(StaticLicenseServer::new(vec![(KID, KEY.to_vec())]));
    let runner = runner_with(
        fast_config(),
        Vaults::new(),
        Arc::new(ClearKeyCdm::new()),
        license,
        source.clone(),
    );

    let reports = runner.resolve_keys(vec![track, clear_track("plain", 1)]).await;
    assert_eq!(reports.len(), 2);
    let keys = reports[0].result.as_ref().unwrap();
    assert_eq!(keys[0].key, ContentKey::new(KID, KEY.to_vec()));
    assert!(reports[1].result.as_ref().unwrap().is_empty());
    assert_eq!(source.calls.load(Ordering::SeqCst), 0);
}
