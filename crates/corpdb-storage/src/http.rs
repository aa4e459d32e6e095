//! Polite page fetching for profile enrichment.
//!
//! One [`HttpFetcher`] is shared by every enrichment task of a run. It caps
//! in-flight requests with a semaphore, spaces request starts with a
//! [`RequestPacer`] and retries transient failures. A throttled response
//! (429, or 503 carrying `Retry-After`) waits for the server's hint instead
//! of the computed backoff.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{info_span, warn, Instrument};

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Wait the policy's backoff for this attempt.
    Backoff,
    /// The site asked us to slow down; honour its hint when it gave one.
    Throttled(Option<Duration>),
    GiveUp,
}

impl Retry {
    fn delay(self, policy: &BackoffPolicy, attempt_index: usize) -> Option<Duration> {
        match self {
            Retry::Backoff => Some(policy.delay_for_attempt(attempt_index)),
            Retry::Throttled(hint) => Some(policy.delay_with_hint(attempt_index, hint)),
            Retry::GiveUp => None,
        }
    }
}

/// Classifies a non-success response. Profile pages answering 4xx other than
/// 408/429 are gone or forbidden and are not retried.
pub fn classify_response(status: StatusCode, headers: &HeaderMap, now: DateTime<Utc>) -> Retry {
    let hint = headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_retry_after(v, now));
    match status {
        StatusCode::TOO_MANY_REQUESTS => Retry::Throttled(hint),
        StatusCode::SERVICE_UNAVAILABLE if hint.is_some() => Retry::Throttled(hint),
        StatusCode::REQUEST_TIMEOUT => Retry::Backoff,
        s if s.is_server_error() => Retry::Backoff,
        _ => Retry::GiveUp,
    }
}

/// Transport failures worth another attempt: the page never arrived.
pub fn classify_transport_error(err: &reqwest::Error) -> Retry {
    if err.is_timeout() || err.is_connect() {
        Retry::Backoff
    } else {
        Retry::GiveUp
    }
}

/// Bounded retry with a delay proportional to the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = u32::try_from(attempt_index + 1).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// A server-supplied `Retry-After` wins over the computed delay, still capped.
    pub fn delay_with_hint(&self, attempt_index: usize, retry_after: Option<Duration>) -> Duration {
        retry_after
            .map(|hint| hint.min(self.max_delay))
            .unwrap_or_else(|| self.delay_for_attempt(attempt_index))
    }
}

/// `Retry-After` is either delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    /// Minimum spacing between request starts.
    pub request_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            concurrency: 1,
            request_interval: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Spaces out request starts so a third-party site sees a fixed pace.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut next_slot = self.next_slot.lock().await;
        let now = Instant::now();
        let start = match *next_slot {
            Some(slot) if slot > now => slot,
            _ => now,
        };
        *next_slot = Some(start + self.interval);
        drop(next_slot);
        tokio::time::sleep_until(start).await;
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    pacer: RequestPacer,
    backoff: BackoffPolicy,
}

fn build_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let user_agent = config
        .user_agent
        .clone()
        .unwrap_or_else(|| concat!("corpdb/", env!("CARGO_PKG_VERSION")).to_string());
    reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout)
        .user_agent(user_agent)
        .build()
        .context("building http client for profile pages")
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = build_client(&config)?;
        let HttpClientConfig {
            concurrency,
            request_interval,
            backoff,
            ..
        } = config;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(concurrency.max(1))),
            pacer: RequestPacer::new(request_interval),
            backoff,
        })
    }

    pub async fn fetch_page(&self, source_id: &str, url: &str) -> Result<FetchedPage, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedPage, FetchError> {
        // The semaphore is never closed, so acquire only fails on a closed one.
        let _permit = self.limit.acquire().await.ok();
        let mut attempt = 0;

        loop {
            self.pacer.wait().await;
            let (retry, failure) = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let bytes = resp.bytes().await?;
                    return Ok(FetchedPage {
                        status,
                        final_url,
                        body: String::from_utf8_lossy(&bytes).into_owned(),
                        fetched_at: Utc::now(),
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let retry = classify_response(status, resp.headers(), Utc::now());
                    let failure = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    (retry, failure)
                }
                Err(err) => (classify_transport_error(&err), FetchError::Request(err)),
            };

            let delay = match retry.delay(&self.backoff, attempt) {
                Some(delay) if attempt < self.backoff.max_retries => delay,
                _ => return Err(failure),
            };
            warn!(error = %failure, attempt, ?delay, ?retry, "retrying fetch");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
