//! Client for upstreams behind an anti-bot challenge page.
//!
//! Some upstreams sit behind Cloudflare-style interstitials: the first
//! request gets a challenge page, a clearance cookie is issued, and the
//! repeat request goes through. [`ChallengeClient`] owns a cookie-jar
//! client, detects the interstitial and re-requests after the challenge
//! window with the accumulated cookies. JavaScript proof-of-work solving is
//! out of scope here — a solver service can be layered on via
//! [`ChallengeClient::with_client`] without changing any adapter code.

use std::time::Duration;

use tracing::debug;

use crate::client::HttpClientConfig;
use crate::error::{TransportError, TransportResult};

/// Markers identifying a challenge interstitial body.
const CHALLENGE_MARKERS: [&str; 3] = [
    "Just a moment",
    "cf-browser-verification",
    "_cf_chl_opt",
];

/// HTTP client that transparently waits out anti-bot challenges.
pub struct ChallengeClient {
    client: reqwest::Client,
    /// How often a challenged request is re-sent before giving up.
    max_attempts: u32,
    /// Pause before re-sending a challenged request.
    challenge_delay: Duration,
}

impl ChallengeClient {
    /// Client with a cookie jar and browser headers, ready for
    /// challenge-fronted upstreams.
    pub fn new() -> TransportResult<Self> {
        let client = HttpClientConfig::default()
            .with_cookie_store(true)
            .with_timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self::with_client(client))
    }

    /// Wraps an externally built client (e.g. one routed through a solver
    /// service).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            max_attempts: 3,
            challenge_delay: Duration::from_secs(2),
        }
    }

    /// GETs `url`, waiting out challenge interstitials.
    ///
    /// Returns the body text of the first non-challenge answer; fails with
    /// [`TransportError::ChallengeFailed`] when every attempt was
    /// challenged.
    pub async fn get_text(&self, url: &str) -> TransportResult<String> {
        for attempt in 1..=self.max_attempts {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| TransportError::Request {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;

            let status = response.status();
            let body = response.text().await.map_err(|e| TransportError::Request {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

            if Self::is_challenge(status.as_u16(), &body) {
                debug!(url, attempt, "challenge interstitial, waiting");
                tokio::time::sleep(self.challenge_delay).await;
                continue;
            }
            if !status.is_success() {
                return Err(TransportError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }
            return Ok(body);
        }

        Err(TransportError::ChallengeFailed {
            url: url.to_string(),
            attempts: self.max_attempts,
        })
    }

    fn is_challenge(status: u16, body: &str) -> bool {
        (status == 403 || status == 503)
            && CHALLENGE_MARKERS.iter().any(|marker| body.contains(marker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_challenge_bodies() {
        assert!(ChallengeClient::is_challenge(
            503,
            "<title>Just a moment...</title>"
        ));
        assert!(ChallengeClient::is_challenge(
            403,
            "window._cf_chl_opt = {}"
        ));
        // Plain 403s and successful pages are not challenges.
        assert!(!ChallengeClient::is_challenge(403, "Forbidden"));
        assert!(!ChallengeClient::is_challenge(
            200,
            "Just a moment of your time"
        ));
    }
}
