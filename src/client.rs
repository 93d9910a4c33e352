use std::time::Duration;

use reqwest::{RequestBuilder, Response};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// HTTP statuses retried with backoff; everything else fails fast.
pub const DEFAULT_RETRYABLE_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

const BASE_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Throttled, retrying HTTP client. One instance per upstream: the
/// "time of last request" slot is shared by every caller of the same
/// instance, so concurrent callers contend on the slot (extra waiting,
/// never a rate-limit violation) while the requests themselves may still
/// overlap once scheduled.
pub struct RateLimitedClient {
    http: reqwest::Client,
    min_interval: Duration,
    max_attempts: u32,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimitedClient {
    pub fn new(
        min_interval: Duration,
        max_attempts: u32,
        request_timeout: Duration,
    ) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| eyre::eyre!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            http,
            min_interval,
            max_attempts: max_attempts.max(1),
            last_request: Mutex::new(None),
        })
    }

    /// Issue a request, waiting for the shared interval slot first and
    /// retrying retryable statuses and transient network errors with
    /// backoff. A server-supplied Retry-After hint overrides the computed
    /// backoff. Exhausting the attempt cap surfaces the last error.
    pub async fn execute<F>(
        &self,
        build: F,
        description: &str,
        retryable: &[u16],
    ) -> eyre::Result<Response>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            self.acquire_slot().await;

            match build(&self.http).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    if !retryable.contains(&status.as_u16()) {
                        return Err(eyre::eyre!(
                            "{} failed with non-retryable status {}",
                            description,
                            status
                        ));
                    }

                    let delay = retry_after_hint(&response)
                        .unwrap_or_else(|| backoff_delay(attempt));
                    tracing::warn!(
                        request = description,
                        status = status.as_u16(),
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Retryable status, backing off"
                    );
                    last_error = Some(eyre::eyre!(
                        "{} failed with status {} after {} attempts",
                        description,
                        status,
                        attempt
                    ));
                    if attempt < self.max_attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => {
                    let delay = backoff_delay(attempt);
                    tracing::warn!(
                        request = description,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Request failed, backing off"
                    );
                    last_error = Some(eyre::eyre!(
                        "{} failed after {} attempts: {}",
                        description,
                        attempt,
                        e
                    ));
                    if attempt < self.max_attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| eyre::eyre!("{} failed", description)))
    }

    /// Wait until at least `min_interval` has elapsed since the previous
    /// caller's departure, then stamp the slot. Sleeping happens under the
    /// lock: that is what serializes permission to proceed.
    async fn acquire_slot(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Exponential backoff for the given 1-based attempt, capped.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BASE_BACKOFF.saturating_mul(1u32 << (attempt - 1).min(16));
    exp.min(MAX_BACKOFF)
}

/// Parse a Retry-After header carrying whole seconds, when present.
fn retry_after_hint(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_requests_spaced_by_min_interval() {
        let client = RateLimitedClient::new(
            Duration::from_millis(500),
            3,
            Duration::from_secs(30),
        )
        .unwrap();

        let mut stamps = Vec::new();
        for _ in 0..4 {
            client.acquire_slot().await;
            stamps.push(Instant::now());
        }

        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_the_slot() {
        use std::sync::Arc;

        let client = Arc::new(
            RateLimitedClient::new(Duration::from_millis(500), 3, Duration::from_secs(30))
                .unwrap(),
        );

        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client.acquire_slot().await;
                Instant::now()
            }));
        }

        let mut stamps = Vec::new();
        for handle in handles {
            stamps.push(handle.await.unwrap());
        }
        stamps.sort();

        // Three callers through one instance: the last cannot depart
        // before two full intervals have passed.
        assert!(stamps[2] - start >= Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(500));
        assert_eq!(backoff_delay(2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(3), Duration::from_millis(2000));
        assert_eq!(backoff_delay(10), MAX_BACKOFF);
    }

    #[test]
    fn test_default_retryable_statuses() {
        for status in [429u16, 500, 502, 503, 504] {
            assert!(DEFAULT_RETRYABLE_STATUSES.contains(&status));
        }
        assert!(!DEFAULT_RETRYABLE_STATUSES.contains(&400));
        assert!(!DEFAULT_RETRYABLE_STATUSES.contains(&404));
    }
}
