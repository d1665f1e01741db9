use reqwest::Proxy;

use crate::error::TransportError;

/// Kind of upstream proxy.
#[derive(Debug, Clone, PartialEq, Eq, Copy)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ProxyType {
    Http,
    Https,
    Socks5,
}

#[derive(Debug, Clone)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// Proxy used for both segment and license traffic.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Proxy server URL, e.g. `http://proxy.local:8080`.
    pub url: String,
    pub proxy_type: ProxyType,
    pub auth: Option<ProxyAuth>,
}

impl ProxyConfig {
    /// Infers the proxy type from the URL scheme; credentials embedded in the
    /// URL are passed through to reqwest as-is.
    pub fn from_url(url: &str) -> Result<Self, TransportError> {
        let parsed =
            url::Url::parse(url).map_err(|e| TransportError::invalid_url(url, e.to_string()))?;
        let proxy_type = match parsed.scheme() {
            "http" => ProxyType::Http,
            "https" => ProxyType::Https,
            "socks5" | "socks5h" => ProxyType::Socks5,
            other => {
                return Err(TransportError::ProxyConfiguration {
                    reason: format!("unsupported proxy scheme `{other}`"),
                });
            }
        };
        Ok(Self {
            url: url.to_string(),
            proxy_type,
            auth: None,
        })
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(ProxyAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }
}

/// Converts a [`ProxyConfig`] into a reqwest proxy matching all traffic of its kind.
pub fn build_proxy_from_config(config: &ProxyConfig) -> Result<Proxy, TransportError> {
    let invalid = |kind: &str, e: reqwest::Error| TransportError::ProxyConfiguration {
        reason: format!("invalid {kind} proxy URL `{}`: {e}", config.url),
    };

    let proxy = match config.proxy_type {
        ProxyType::Http => Proxy::http(&config.url).map_err(|e| invalid("HTTP", e))?,
        ProxyType::Https => Proxy::https(&config.url).map_err(|e| invalid("HTTPS", e))?,
        ProxyType::Socks5 => {
            let url = if config.url.starts_with("socks5://") || config.url.starts_with("socks5h://")
            {
                config.url.clone()
            } else {
                format!("socks5://{}", config.url)
            };
            Proxy::all(&url).map_err(|e| invalid("SOCKS5", e))?
        }
    };

    Ok(match &config.auth {
        Some(auth) => proxy.basic_auth(&auth.username, &auth.password),
        None => proxy,
    })
}
