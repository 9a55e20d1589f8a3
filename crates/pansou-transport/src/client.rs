//! Tuned HTTP client construction.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};

use crate::error::{TransportError, TransportResult};

/// Browser User-Agent sent by default on every upstream call.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Configuration for a plugin's shared HTTP client.
///
/// Defaults match the tuning the scraping adapters settled on: keep-alive
/// pooling with bounded idle connections per host and a per-attempt timeout
/// in the 8–15 s band.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Per-attempt timeout applied to every request.
    pub timeout: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Upper bound on pooled idle connections per host.
    pub max_idle_per_host: usize,
    /// How long an idle pooled connection is kept.
    pub idle_timeout: Duration,
    /// User-Agent header; defaults to [`DEFAULT_USER_AGENT`].
    pub user_agent: String,
    /// Enable the in-memory cookie store (sub-services and challenge flows).
    pub cookie_store: bool,
    /// Accept invalid upstream TLS certificates. Some of the proxied
    /// upstreams serve mismatched certificates on their CDN hosts.
    pub accept_invalid_certs: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            max_idle_per_host: 20,
            idle_timeout: Duration::from_secs(90),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            cookie_store: false,
            accept_invalid_certs: false,
        }
    }
}

impl HttpClientConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cookie_store(mut self, enabled: bool) -> Self {
        self.cookie_store = enabled;
        self
    }

    pub fn with_accept_invalid_certs(mut self, enabled: bool) -> Self {
        self.accept_invalid_certs = enabled;
        self
    }

    /// Builds the client. Call once per plugin and keep the handle; the
    /// client is fully reentrant and pooled.
    pub fn build(&self) -> TransportResult<reqwest::Client> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,application/json,*/*;q=0.8",
            ),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"),
        );

        reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .pool_max_idle_per_host(self.max_idle_per_host)
            .pool_idle_timeout(self.idle_timeout)
            .user_agent(self.user_agent.clone())
            .default_headers(headers)
            .cookie_store(self.cookie_store)
            .danger_accept_invalid_certs(self.accept_invalid_certs)
            .gzip(true)
            .build()
            .map_err(|e| TransportError::Build(e.to_string()))
    }
}
