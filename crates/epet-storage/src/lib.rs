//! HTTP transport and durable local files (staging artifacts, watermarks).

use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

mod staging;
mod watermark;

pub use staging::{
    list_staged_artifacts, read_staged_batch, staged_artifact_name, StagedArtifact, StagedRow,
    StagingWriter,
};
pub use watermark::{FileWatermarkStore, WatermarkStore};

pub const CRATE_NAME: &str = "epet-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Timeouts and refused connections are transient; everything else is surfaced.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// `None` retries transient failures forever.
    pub max_retries: Option<usize>,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: None,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let shift = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn allows_retry(&self, attempt_index: usize) -> bool {
        self.max_retries.map_or(true, |max| attempt_index < max)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub burst: u32,
    pub refill_every: Duration,
}

impl RateLimitConfig {
    pub fn per_second(requests: u32) -> Self {
        let requests = requests.max(1);
        Self {
            burst: requests,
            refill_every: Duration::from_secs(1) / requests,
        }
    }
}

/// Token bucket shared by every request of one fetcher.
#[derive(Debug)]
pub struct RateLimiter {
    burst: u32,
    refill_every: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            burst: config.burst.max(1),
            refill_every: config.refill_every,
            state: Mutex::new(BucketState {
                tokens: config.burst.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let mut state = self.state.lock().await;
            if !self.refill_every.is_zero() {
                let elapsed = state.last_refill.elapsed();
                let refills = (elapsed.as_nanos() / self.refill_every.as_nanos()) as u32;
                if refills > 0 {
                    state.tokens = state.tokens.saturating_add(refills).min(self.burst);
                    state.last_refill += self.refill_every * refills;
                }
            } else {
                state.tokens = self.burst;
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let wait = self.refill_every;
            drop(state);
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    rate_limiter: Option<RateLimiter>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            rate_limiter: config.rate_limit.map(RateLimiter::new),
            backoff: config.backoff,
        })
    }

    /// GET `url` with `query`, retrying transient transport failures per the
    /// backoff policy. Non-2xx statuses are returned as [`FetchError::HttpStatus`]
    /// without retrying.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url, ?query);
        self.fetch_with_retry(url, query).instrument(span).await
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let response = self.fetch_bytes(url, query).await?;
        serde_json::from_slice(&response.body).map_err(|err| FetchError::Decode {
            url: response.final_url,
            message: err.to_string(),
        })
    }

    async fn fetch_with_retry(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire().await;
            }

            let err = match self.send_once(url, query).await {
                Ok(response) => return Ok(response),
                Err(FetchError::Request(err))
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable =>
                {
                    err
                }
                Err(other) => return Err(other),
            };

            if !self.backoff.allows_retry(attempt) {
                return Err(FetchError::Request(err));
            }
            let delay = self.backoff.delay_for_attempt(attempt);
            debug!(attempt, ?delay, error = %err, "transient request failure, retrying");
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }

    async fn send_once(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).query(query).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}
