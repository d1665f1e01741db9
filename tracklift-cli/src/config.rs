use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::debug;
use tracklift_engine::{EngineConfig, KeyPolicy, ProxyConfig};

use crate::cli::DownloadArgs;
use crate::error::{AppError, Result};

const CONFIG_FILE: &str = "config.toml";

/// Settings read from `config.toml`. Every field is optional in the file;
/// command line flags override whatever is loaded here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub output_dir: PathBuf,
    pub vault_file: Option<PathBuf>,
    pub vault_db: Option<PathBuf>,

    pub download_concurrency: usize,
    pub reorder_capacity: usize,
    pub max_concurrent_tracks: usize,
    pub max_total_connections: Option<usize>,
    pub max_retries: u32,
    pub segment_timeout_secs: u64,
    pub chunk_size: usize,

    /// `any`, `vaults-only` or `cdm-only`.
    pub key_policy: String,
    pub license_url: Option<String>,
    pub license_timeout_secs: u64,
    pub license_headers: BTreeMap<String, String>,

    pub user_agent: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub proxy: Option<String>,
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,
    pub use_system_proxy: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            output_dir: PathBuf::from("."),
            vault_file: None,
            vault_db: None,
            download_concurrency: engine.scheduler.download_concurrency,
            reorder_capacity: engine.scheduler.reorder_capacity,
            max_concurrent_tracks: engine.job.max_concurrent_tracks,
            max_total_connections: None,
            max_retries: engine.fetcher.retry.max_retries,
            segment_timeout_secs: engine.fetcher.segment_timeout.as_secs(),
            chunk_size: engine.decryption.chunk_size,
            key_policy: "any".to_string(),
            license_url: None,
            license_timeout_secs: engine.drm.license_timeout.as_secs(),
            license_headers: BTreeMap::new(),
            user_agent: None,
            headers: BTreeMap::new(),
            proxy: None,
            proxy_username: None,
            proxy_password: None,
            use_system_proxy: true,
        }
    }
}

impl AppConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tracklift").join(CONFIG_FILE))
    }

    /// Loads `path` if given (it must exist), otherwise the default location
    /// if present, otherwise defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };
        let content = std::fs::read_to_string(&path)
            .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config = Self::parse(&content)?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Command line flags win over file values.
    pub fn apply_download_args(&mut self, args: &DownloadArgs) {
        if let Some(dir) = &args.output_dir {
            self.output_dir = dir.clone();
        }
        if let Some(path) = &args.store.vault_file {
            self.vault_file = Some(path.clone());
        }
        if let Some(path) = &args.store.vault_db {
            self.vault_db = Some(path.clone());
        }
        if let Some(n) = args.concurrency {
            self.download_concurrency = n;
        }
        if let Some(n) = args.tracks {
            self.max_concurrent_tracks = n;
        }
        if let Some(n) = args.retries {
            self.max_retries = n;
        }
        if args.cdm_only {
            self.key_policy = "cdm-only".to_string();
        } else if args.vaults_only {
            self.key_policy = "vaults-only".to_string();
        }
        if let Some(url) = &args.license_url {
            self.license_url = Some(url.clone());
        }
        if let Some(proxy) = &args.proxy {
            self.proxy = Some(proxy.clone());
            self.proxy_username = args.proxy_username.clone();
            self.proxy_password = args.proxy_password.clone();
        }
    }

    pub fn key_policy(&self) -> Result<KeyPolicy> {
        KeyPolicy::from_str(&self.key_policy, true)
            .map_err(|e| AppError::Config(format!("key_policy `{}`: {e}", self.key_policy)))
    }

    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut engine = EngineConfig::default();

        if let Some(user_agent) = &self.user_agent {
            engine.http.user_agent = user_agent.clone();
        }
        engine.http.merge_headers(&header_map(&self.headers)?);
        engine.http.use_system_proxy = self.use_system_proxy;
        if let Some(url) = &self.proxy {
            let mut proxy = ProxyConfig::from_url(url)?;
            if let Some(username) = &self.proxy_username {
                proxy = proxy.with_auth(
                    username.clone(),
                    self.proxy_password.clone().unwrap_or_default(),
                );
            }
            engine.http.proxy = Some(proxy);
        }

        engine.fetcher.segment_timeout = Duration::from_secs(self.segment_timeout_secs);
        engine.fetcher.retry = engine.fetcher.retry.with_max_retries(self.max_retries);

        engine.scheduler.download_concurrency = self.download_concurrency;
        engine.scheduler.reorder_capacity = self.reorder_capacity;
        engine.scheduler.max_total_connections = self.max_total_connections;

        engine.decryption.chunk_size = self.chunk_size;

        engine.drm.key_policy = self.key_policy()?;
        engine.drm.default_license_url = self.license_url.clone();
        engine.drm.license_timeout = Duration::from_secs(self.license_timeout_secs);
        engine.drm.license_headers = header_map(&self.license_headers)?;

        engine.job.max_concurrent_tracks = self.max_concurrent_tracks;
        Ok(engine)
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| AppError::Config(format!("header name `{name}`: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| AppError::Config(format!("header value for `{name}`: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}
