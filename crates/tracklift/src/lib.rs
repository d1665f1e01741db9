//! # Tracklift engine
//!
//! Acquires segmented media tracks, resolves their DRM content keys and
//! writes decrypted, correctly ordered output.
//!
//! For every track a [`TrackPipeline`] runs
//! `Pending -> AwaitingLicense -> Downloading -> Decrypting -> Completed`:
//!
//! 1. content keys are looked up in the [`keyvault::Vaults`]; anything
//!    missing is fetched through a CDM session and a license exchange and
//!    written back to the vaults
//! 2. a [`SegmentScheduler`] fetches segments concurrently, retrying
//!    transient faults, and streams their bytes downstream strictly by index
//! 3. each segment is decrypted as its bytes arrive and appended to an
//!    [`OutputSink`]
//!
//! A [`JobRunner`] runs several tracks with bounded parallelism and isolated
//! failures.

pub mod config;
pub mod decrypt;
pub mod download;
pub mod drm;
pub mod error;
pub mod events;
pub mod export;
pub mod pipeline;
pub mod progress;
pub mod proxy;
pub mod sink;
pub mod state;
pub mod track;

pub use config::{
    DecryptionConfig, DrmConfig, EngineConfig, FetcherConfig, HttpConfig, JobConfig, KeyPolicy,
    SchedulerConfig,
};
pub use download::{
    HttpSegmentFetcher, RetryPolicy, SegmentBody, SegmentPiece, SegmentScheduler, SegmentSource,
};
pub use drm::{Cdm, CdmRegistry, ClearKeyCdm, HttpLicenseClient, KeyResolver, LicenseTransport, ResolvedKey};
pub use error::{CdmError, PipelineError, TransportError};
pub use events::{KeySource, TrackEvent};
pub use export::KeyExport;
pub use pipeline::{JobReport, JobRunner, KeyReport, TrackPipeline, TrackReport};
pub use progress::{ProgressSnapshot, TrackProgress};
pub use proxy::{ProxyConfig, ProxyType};
pub use sink::{FileSink, MemorySink, OutputSink};
pub use state::{DownloadState, FailureReason};
pub use track::{ByteRange, CipherScheme, DrmSystem, MediaType, ProtectionDescriptor, Segment, Track};
