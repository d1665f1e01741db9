use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::error::TransportError;
use crate::track::{DrmSystem, ProtectionDescriptor};

/// Delivers a challenge to a license server and returns its raw answer.
/// One attempt per call.
#[async_trait]
pub trait LicenseTransport: Send + Sync {
    async fn acquire(
        &self,
        descriptor: &ProtectionDescriptor,
        challenge: Bytes,
        token: &CancellationToken,
    ) -> Result<Bytes, TransportError>;
}

/// POSTs challenges over HTTP.
pub struct HttpLicenseClient {
    http_client: Client,
    default_url: Option<String>,
    headers: HeaderMap,
    timeout: Duration,
}

impl HttpLicenseClient {
    pub fn new(http_client: Client, timeout: Duration) -> Self {
        Self {
            http_client,
            default_url: None,
            headers: HeaderMap::new(),
            timeout,
        }
    }

    pub fn with_default_url(mut self, url: Option<String>) -> Self {
        self.default_url = url;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    fn content_type(system: &DrmSystem) -> HeaderValue {
        if system.as_str() == DrmSystem::CLEARKEY {
            HeaderValue::from_static("application/json")
        } else {
            HeaderValue::from_static("application/octet-stream")
        }
    }

    async fn post(&self, url: Url, content_type: HeaderValue, challenge: Bytes) -> Result<Bytes, TransportError> {
        let response = self
            .http_client
            .post(url.clone())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, content_type)
            .body(challenge)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::http_status(status, url.as_str()));
        }
        let body = response.bytes().await?;
        debug!(url = %url, bytes = body.len(), "License response received");
        Ok(body)
    }
}

#[async_trait]
impl LicenseTransport for HttpLicenseClient {
    async fn acquire(
        &self,
        descriptor: &ProtectionDescriptor,
        challenge: Bytes,
        token: &CancellationToken,
    ) -> Result<Bytes, TransportError> {
        let raw = descriptor
            .license_url()
            .or(self.default_url.as_deref())
            .ok_or_else(|| TransportError::invalid_url("", "no license server URL configured"))?;
        let url = Url::parse(raw).map_err(|e| TransportError::invalid_url(raw, e.to_string()))?;
        let content_type = Self::content_type(descriptor.system());

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(TransportError::Cancelled),
            result = tokio::time::timeout(self.timeout, self.post(url, content_type, challenge)) => {
                result.unwrap_or_else(|_| Err(TransportError::Timeout {
                    reason: format!("license server did not answer within {:?}", self.timeout),
                }))
            }
        }
    }
}
