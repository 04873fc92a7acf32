use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// A server-provided `Retry-After` wins over the computed delay, still capped at `max_delay`.
    pub fn delay_with_hint(&self, attempt_index: usize, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) => hint.min(self.max_delay),
            None => self.delay_for_attempt(attempt_index),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

/// Request budget: `capacity` requests up front, one more every `refill_every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Roughly `requests` per second, allowing a burst of the same size.
    pub fn per_second(requests: u32) -> Self {
        let requests = requests.max(1);
        Self {
            capacity: requests,
            refill_every: Duration::from_secs(1) / requests,
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    config: TokenBucketConfig,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            config,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
                self.config
                    .refill_every
                    .saturating_sub(state.last_refill.elapsed())
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Credits whole elapsed intervals; the partial interval carries over.
    fn refill(&self, state: &mut TokenBucketState) {
        let every = self.config.refill_every;
        if every.is_zero() {
            state.tokens = self.config.capacity;
            return;
        }
        let intervals = state.last_refill.elapsed().as_nanos() / every.as_nanos();
        if intervals == 0 {
            return;
        }
        let credited = u32::try_from(intervals).unwrap_or(u32::MAX);
        state.tokens = state.tokens.saturating_add(credited).min(self.config.capacity);
        state.last_refill += every.saturating_mul(credited);
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("request limiter closed")]
    LimiterClosed,
}

/// JSON GET client with bounded concurrency, optional token bucket, and retrying backoff.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(FetchError::Client)?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c)));

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            token_bucket,
            backoff: config.backoff,
        })
    }

    pub async fn get_json(
        &self,
        url: &str,
        bearer_token: Option<&str>,
    ) -> Result<JsonValue, FetchError> {
        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        self.get_json_with_retry(url, bearer_token)
            .instrument(info_span!("http_fetch", url))
            .await
    }

    async fn get_json_with_retry(
        &self,
        url: &str,
        bearer_token: Option<&str>,
    ) -> Result<JsonValue, FetchError> {
        let mut attempt = 0usize;
        loop {
            let mut request = self.client.get(url);
            if let Some(token) = bearer_token {
                request = request.bearer_auth(token);
            }

            let retries_left = attempt < self.backoff.max_retries;
            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?;
                        return serde_json::from_slice(&body).map_err(|source| {
                            FetchError::Decode {
                                url: final_url,
                                source,
                            }
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && retries_left {
                        let delay = self
                            .backoff
                            .delay_with_hint(attempt, retry_after(resp.headers()));
                        debug!(%status, attempt, delay_ms = delay.as_millis() as u64, "retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && retries_left {
                        debug!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

/// Parses the delta-seconds form of `Retry-After`; HTTP-date values are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn retry_after_hint_overrides_backoff_but_respects_cap() {
        let policy = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        };
        assert_eq!(
            policy.delay_with_hint(0, Some(Duration::from_secs(3))),
            Duration::from_secs(3)
        );
        assert_eq!(
            policy.delay_with_hint(0, Some(Duration::from_secs(120))),
            Duration::from_secs(10)
        );
        assert_eq!(policy.delay_with_hint(1, None), Duration::from_millis(200));
    }

    #[test]
    fn retry_after_parses_seconds_only() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static(" 7 "));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn per_second_budget_spreads_refills_over_a_second() {
        assert_eq!(
            TokenBucketConfig::per_second(4),
            TokenBucketConfig {
                capacity: 4,
                refill_every: Duration::from_millis(250),
            }
        );
        assert_eq!(TokenBucketConfig::per_second(0).capacity, 1);
    }

    #[tokio::test]
    async fn token_bucket_hands_out_initial_capacity_without_waiting() {
        let bucket = SimpleTokenBucket::new(TokenBucketConfig {
            capacity: 3,
            refill_every: Duration::from_secs(60),
        });
        let started = Instant::now();
        for _ in 0..3 {
            bucket.take().await;
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn empty_token_bucket_waits_for_a_refill() {
        let bucket = SimpleTokenBucket::new(TokenBucketConfig {
            capacity: 1,
            refill_every: Duration::from_millis(40),
        });
        bucket.take().await;
        let started = Instant::now();
        bucket.take().await;
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn fetcher_builds_a_bucket_only_when_configured() {
        let plain = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        assert!(plain.token_bucket.is_none());

        let limited = HttpFetcher::new(HttpClientConfig {
            token_bucket: Some(TokenBucketConfig::per_second(10)),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            limited.token_bucket.as_ref().map(|b| b.config),
            Some(TokenBucketConfig::per_second(10))
        );
    }
}
