//! Ranged HTTP download of a single chunk.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};

use super::ChunkRequest;
use crate::drive::{DriveClient, TokenSource};
use crate::error::{Error, Result};

/// Response body markers of a rate-limited or transiently failing request.
const THROTTLE_REASONS: [&str; 5] = [
    "dailyLimitExceeded",
    "userRateLimitExceeded",
    "rateLimitExceeded",
    "backendError",
    "internalError",
];

/// Whether a failed response should be retried after a backoff.
pub fn is_throttled(status: StatusCode, body: &str) -> bool {
    matches!(
        status,
        StatusCode::FORBIDDEN | StatusCode::INTERNAL_SERVER_ERROR
    ) && THROTTLE_REASONS.iter().any(|reason| body.contains(reason))
}

/// Exponential backoff schedule for throttled downloads.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// First sleep; each following sleep doubles
    pub base_delay: Duration,
    /// Sleeps before giving up with `QuotaExceeded`
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_retries: 4,
        }
    }
}

impl RetryPolicy {
    /// Sleep before retry number `attempt` (0-based), or `None` once the
    /// schedule is exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_retries).then(|| self.base_delay * 2u32.pow(attempt))
    }
}

/// Fetches the bytes of one chunk from the remote side.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    /// Exactly `request.len()` bytes starting at `request.offset_start`.
    async fn fetch(&self, request: &ChunkRequest) -> Result<Bytes>;
}

/// `Fetcher` issuing `Range` GETs against the object's download URL.
#[derive(Clone)]
pub struct Downloader {
    http: Client,
    tokens: Arc<dyn TokenSource>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("policy", &self.policy)
            .finish()
    }
}

impl Downloader {
    pub fn new(http: Client, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            http,
            tokens,
            policy: RetryPolicy::default(),
        }
    }

    /// Share the connection pool and token source of a metadata client.
    pub fn from_client(client: &DriveClient) -> Self {
        Self::new(client.http_client().clone(), client.token_source())
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Single ranged GET of the inclusive byte range `[start, end]`.
    pub async fn download(&self, url: &str, start: u64, end: u64) -> Result<Bytes> {
        let expected = match end.checked_sub(start) {
            Some(len) => (len + 1) as usize,
            None => return Err(Error::InvalidRange { start, end }),
        };
        let mut attempt = 0;

        loop {
            let token = self.tokens.access_token().await?;
            let response = self
                .http
                .get(url)
                .bearer_auth(token)
                .header(RANGE, format!("bytes={}-{}", start, end))
                .send()
                .await?;

            let status = response.status();
            if status == StatusCode::PARTIAL_CONTENT {
                let body = response.bytes().await?;
                if body.len() != expected {
                    return Err(Error::Integrity(format!(
                        "expected {} bytes for range {}-{}, got {}",
                        expected,
                        start,
                        end,
                        body.len()
                    )));
                }
                return Ok(body);
            }

            let body = response.text().await.unwrap_or_default();
            if !is_throttled(status, &body) {
                tracing::warn!(url, status = status.as_u16(), "download failed");
                return Err(Error::Protocol {
                    status: status.as_u16(),
                });
            }

            let Some(delay) = self.policy.delay(attempt) else {
                tracing::warn!(url, attempt, "download throttled, giving up");
                return Err(Error::QuotaExceeded);
            };
            tracing::debug!(
                url,
                attempt,
                status = status.as_u16(),
                delay_ms = delay.as_millis() as u64,
                "download throttled, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait::async_trait]
impl Fetcher for Downloader {
    async fn fetch(&self, request: &ChunkRequest) -> Result<Bytes> {
        if request.is_empty() {
            return Ok(Bytes::new());
        }
        self.download(
            &request.object.download_url,
            request.offset_start,
            request.last_byte(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_predicate() {
        let body = r#"{"error":{"errors":[{"reason":"userRateLimitExceeded"}]}}"#;
        assert!(is_throttled(StatusCode::FORBIDDEN, body));
        assert!(is_throttled(StatusCode::INTERNAL_SERVER_ERROR, "backendError"));
        assert!(is_throttled(StatusCode::FORBIDDEN, "dailyLimitExceeded"));

        // right reason, wrong status
        assert!(!is_throttled(StatusCode::TOO_MANY_REQUESTS, body));
        // right status, no reason
        assert!(!is_throttled(StatusCode::FORBIDDEN, "insufficientPermissions"));
        assert!(!is_throttled(StatusCode::NOT_FOUND, "internalError"));
    }

    #[test]
    fn test_default_schedule() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (0..)
            .map_while(|attempt| policy.delay(attempt))
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8]);
    }

    #[test]
    fn test_scaled_schedule() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(5),
            max_retries: 2,
        };
        assert_eq!(policy.delay(0), Some(Duration::from_millis(5)));
        assert_eq!(policy.delay(1), Some(Duration::from_millis(10)));
        assert_eq!(policy.delay(2), None);
    }
}
