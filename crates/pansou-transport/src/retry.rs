//! Retry policy for upstream requests.

use std::time::Duration;

use tracing::debug;

use crate::error::{TransportError, TransportResult};

/// Bounded retry with exponential backoff.
///
/// An attempt is retried on network failure or a 5xx status; 4xx answers are
/// returned to the caller as-is (they are upstream-permanent, not
/// transient). Each attempt sends a fresh clone of the request so bodies and
/// cookies are never reused. Dropping the returned future — e.g. when the
/// caller's deadline fires — aborts the in-flight attempt and the backoff
/// sleep alike.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first try included.
    pub max_attempts: u32,
    /// First backoff delay; doubles after every failed attempt.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// A single-attempt policy for rate-limited upstreams.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    /// Sends `request`, retrying per the policy. The builder is cloned for
    /// every attempt; a non-clonable (streaming-body) builder fails fast.
    pub async fn send(&self, request: reqwest::RequestBuilder) -> TransportResult<reqwest::Response> {
        let mut delay = self.base_delay;
        let mut last_error = None;

        for attempt in 1..=self.max_attempts.max(1) {
            let Some(cloned) = request.try_clone() else {
                return Err(TransportError::NotClonable);
            };

            match cloned.send().await {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_server_error() {
                        return Ok(response);
                    }
                    debug!(url = %response.url(), status = status.as_u16(), attempt, "retrying on 5xx");
                    last_error = Some(TransportError::Status {
                        url: response.url().to_string(),
                        status: status.as_u16(),
                    });
                }
                Err(e) => {
                    let url = e
                        .url()
                        .map(|u| u.to_string())
                        .unwrap_or_else(|| "<unknown>".to_string());
                    debug!(url = %url, attempt, error = %e, "retrying on network error");
                    last_error = Some(TransportError::Request {
                        url,
                        reason: e.to_string(),
                    });
                }
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        Err(last_error.unwrap_or(TransportError::NotClonable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_bounded() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(200));
    }

    #[tokio::test]
    async fn unreachable_host_exhausts_attempts() {
        let client = reqwest::Client::new();
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        // Reserved TEST-NET-1 address; connection fails without touching the
        // network proper.
        let err = policy
            .send(client.get("http://192.0.2.1:9/").timeout(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Request { .. }));
    }
}
