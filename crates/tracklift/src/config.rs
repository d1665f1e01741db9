use std::time::Duration;

use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::{debug, info};

use crate::download::retry::RetryPolicy;
use crate::error::TransportError;
use crate::proxy::{ProxyConfig, build_proxy_from_config};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Settings for the shared HTTP client.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Overall request timeout; zero disables it.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Maximum silence between body chunks; zero disables it.
    pub read_timeout: Duration,
    pub follow_redirects: bool,
    pub user_agent: String,
    pub headers: HeaderMap,
    pub proxy: Option<ProxyConfig>,
    pub use_system_proxy: bool,
    pub danger_accept_invalid_certs: bool,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: Self::get_default_headers(),
            proxy: None,
            use_system_proxy: true,
            danger_accept_invalid_certs: false,
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl HttpConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate"),
        );
        headers.insert(reqwest::header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
        headers
    }

    /// Adds `headers` on top of the defaults; later values win.
    pub fn merge_headers(&mut self, headers: &HeaderMap) {
        for (name, value) in headers {
            self.headers.insert(name.clone(), value.clone());
        }
    }

    pub fn build_client(&self) -> Result<Client, TransportError> {
        let mut builder = Client::builder()
            .user_agent(&self.user_agent)
            .default_headers(self.headers.clone())
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .pool_idle_timeout(self.pool_idle_timeout)
            .danger_accept_invalid_certs(self.danger_accept_invalid_certs)
            .redirect(if self.follow_redirects {
                reqwest::redirect::Policy::limited(10)
            } else {
                reqwest::redirect::Policy::none()
            });

        if !self.timeout.is_zero() {
            builder = builder.timeout(self.timeout);
        }
        if !self.connect_timeout.is_zero() {
            builder = builder.connect_timeout(self.connect_timeout);
        }
        if !self.read_timeout.is_zero() {
            builder = builder.read_timeout(self.read_timeout);
        }

        if let Some(proxy) = &self.proxy {
            builder = builder.proxy(build_proxy_from_config(proxy)?);
            info!(proxy_url = %proxy.url, "Using explicitly configured proxy");
        } else if !self.use_system_proxy {
            builder = builder.no_proxy();
            debug!("Proxy disabled");
        }

        builder.build().map_err(TransportError::from)
    }
}

/// Segment fetch behaviour.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Budget for a single segment request, body included.
    pub segment_timeout: Duration,
    pub retry: RetryPolicy,
    /// Reject segments whose length differs from the advertised size.
    pub verify_size: bool,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            segment_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            verify_size: true,
        }
    }
}

/// Per-track download scheduling.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Segment fetches in flight per track.
    pub download_concurrency: usize,
    /// Segments that may be fetched or buffered ahead of the next one owed to
    /// the decryptor.
    pub reorder_capacity: usize,
    /// Ordered segments queued between downloader and decryptor.
    pub output_channel_capacity: usize,
    /// Cap on segment connections across all tracks of a job.
    pub max_total_connections: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            download_concurrency: 4,
            reorder_capacity: 16,
            output_channel_capacity: 2,
            max_total_connections: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecryptionConfig {
    /// Bytes handed to the cipher per step.
    pub chunk_size: usize,
    /// Run block decryption on the blocking pool.
    pub offload_to_blocking_pool: bool,
}

impl Default for DecryptionConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            offload_to_blocking_pool: true,
        }
    }
}

/// Where content keys may come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum KeyPolicy {
    /// Vaults first, license server for whatever is missing.
    #[default]
    Any,
    /// Never contact a license server.
    VaultsOnly,
    /// Always run a license exchange, ignoring vault contents.
    CdmOnly,
}

#[derive(Debug, Clone)]
pub struct DrmConfig {
    pub key_policy: KeyPolicy,
    pub license_retry: RetryPolicy,
    pub license_timeout: Duration,
    /// Extra headers sent with every license request.
    pub license_headers: HeaderMap,
    /// Used when a protection descriptor carries no license URL.
    pub default_license_url: Option<String>,
}

impl Default for DrmConfig {
    fn default() -> Self {
        Self {
            key_policy: KeyPolicy::Any,
            license_retry: RetryPolicy::once(),
            license_timeout: Duration::from_secs(30),
            license_headers: HeaderMap::new(),
            default_license_url: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Tracks processed at the same time.
    pub max_concurrent_tracks: usize,
    /// Buffered progress events per subscriber.
    pub event_capacity: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tracks: 1,
            event_capacity: 256,
        }
    }
}

/// Everything a [`JobRunner`](crate::JobRunner) needs to know.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub http: HttpConfig,
    pub fetcher: FetcherConfig,
    pub scheduler: SchedulerConfig,
    pub decryption: DecryptionConfig,
    pub drm: DrmConfig,
    pub job: JobConfig,
}

impl EngineConfig {
    /// Clamps zero-valued knobs that would stall the pipeline.
    pub(crate) fn normalized(mut self) -> Self {
        self.scheduler.download_concurrency = self.scheduler.download_concurrency.max(1);
        self.scheduler.reorder_capacity = self
            .scheduler
            .reorder_capacity
            .max(self.scheduler.download_concurrency);
        self.scheduler.output_channel_capacity = self.scheduler.output_channel_capacity.max(1);
        self.scheduler.max_total_connections =
            self.scheduler.max_total_connections.map(|n| n.max(1));
        self.decryption.chunk_size = self.decryption.chunk_size.max(16);
        self.job.max_concurrent_tracks = self.job.max_concurrent_tracks.max(1);
        self.job.event_capacity = self.job.event_capacity.max(1);
        self
    }
}
