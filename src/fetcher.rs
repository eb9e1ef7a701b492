//! Rate-limit-aware HTTP fetcher shared by every outbound API client.
//!
//! Watches the remaining-quota headers from each response and sleeps
//! proactively before the next call when quota runs low, instead of only
//! reacting to 429s. Retries are bounded and centrally configured so the
//! behavior is testable in one place.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Outcome taxonomy for outbound calls. Retryable errors have already
/// exhausted their retry budget by the time the caller sees them; the caller
/// decides whether to skip-and-continue or abort the batch.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Retryable(_))
    }
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Bounded retry schedule shared by all call sites.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for quota errors: base * 2^attempt, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1 << attempt.min(8));
        exp.min(self.max_delay)
    }

    /// Linear backoff for transient 5xx errors: 1s * (attempt + 1), capped.
    pub fn linear_backoff(&self, attempt: u32) -> Duration {
        Duration::from_secs((attempt as u64) + 1).min(self.max_delay)
    }
}

/// Remaining-quota threshold below which we pace proactively.
const QUOTA_FLOOR: u64 = 3;

/// Safety margin added after a quota reset timestamp.
const RESET_MARGIN_SECS: u64 = 2;

fn now_epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Optional wall-clock budget for a run. Checked between coarse units of
/// work (page, partition, enrichment wave); expiry means "flush and return",
/// never an abrupt abort.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires: Option<std::time::Instant>,
}

impl Deadline {
    pub fn none() -> Self {
        Self { expires: None }
    }

    pub fn after_secs(secs: u64) -> Self {
        Self {
            expires: Some(std::time::Instant::now() + Duration::from_secs(secs)),
        }
    }

    pub fn from_budget(budget_secs: Option<u64>) -> Self {
        match budget_secs {
            Some(s) => Self::after_secs(s),
            None => Self::none(),
        }
    }

    pub fn expired(&self) -> bool {
        self.expires
            .map(|t| std::time::Instant::now() >= t)
            .unwrap_or(false)
    }

    /// Seconds left on the budget, if one is set. Expired budgets read 0.
    pub fn remaining_secs(&self) -> Option<u64> {
        self.expires
            .map(|t| t.saturating_duration_since(std::time::Instant::now()).as_secs())
    }
}

/// Quota state scraped from the most recent response headers.
/// Shared between clones so concurrent workers pace off one view.
#[derive(Clone, Default)]
struct QuotaState {
    remaining: Arc<AtomicU64>,
    reset_epoch: Arc<AtomicU64>,
}

impl QuotaState {
    fn new() -> Self {
        Self {
            remaining: Arc::new(AtomicU64::new(u64::MAX)),
            reset_epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    fn record(&self, remaining: Option<u64>, reset: Option<u64>) {
        if let Some(r) = remaining {
            self.remaining.store(r, Ordering::SeqCst);
        }
        if let Some(r) = reset {
            self.reset_epoch.store(r, Ordering::SeqCst);
        }
    }

    /// Seconds to sleep before the next call, if quota is nearly exhausted.
    fn pacing_wait(&self) -> Option<u64> {
        let remaining = self.remaining.load(Ordering::SeqCst);
        if remaining > QUOTA_FLOOR {
            return None;
        }
        let reset = self.reset_epoch.load(Ordering::SeqCst);
        let now = now_epoch();
        if reset > now {
            Some((reset - now + RESET_MARGIN_SECS).min(120))
        } else {
            Some(RESET_MARGIN_SECS)
        }
    }
}

/// HTTP fetcher with quota pacing and bounded retry/backoff.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    policy: RetryPolicy,
    quota: QuotaState,
    debug: bool,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::with_policy(RetryPolicy::default())
    }

    pub fn with_policy(policy: RetryPolicy) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("vibedex/0.1.0")
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to create HTTP client");
        Self {
            client,
            policy,
            quota: QuotaState::new(),
            debug: std::env::var("VIBEDEX_DEBUG").is_ok(),
        }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// GET a URL expecting JSON. Empty bodies and `null` come back as
    /// `Value::Null`, which callers treat as "no data this page".
    pub async fn get_json(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> FetchResult<serde_json::Value> {
        let text = self.get_text(url, headers).await?;
        if text.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| FetchError::Retryable(format!("invalid JSON from {}: {}", url, e)))
    }

    /// GET a URL expecting text, with quota pacing and the full retry ladder.
    pub async fn get_text(&self, url: &str, headers: &[(&str, &str)]) -> FetchResult<String> {
        let response = self
            .send_with_retries(|| {
                let mut req = self.client.get(url);
                for (k, v) in headers {
                    req = req.header(*k, *v);
                }
                req
            })
            .await?;
        response
            .text()
            .await
            .map_err(|e| FetchError::Retryable(format!("body read failed: {}", e)))
    }

    /// POST JSON and parse a JSON response through the same retry ladder.
    pub async fn post_json(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &serde_json::Value,
    ) -> FetchResult<serde_json::Value> {
        let response = self
            .send_with_retries(|| {
                let mut req = self.client.post(url).json(body);
                for (k, v) in headers {
                    req = req.header(*k, *v);
                }
                req
            })
            .await?;
        let text = response
            .text()
            .await
            .map_err(|e| FetchError::Retryable(format!("body read failed: {}", e)))?;
        if text.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| FetchError::Retryable(format!("invalid JSON: {}", e)))
    }

    /// Core send loop: proactive pacing, then per-status retry handling.
    async fn send_with_retries<F>(&self, build: F) -> FetchResult<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_error = String::new();

        for attempt in 0..self.policy.max_attempts {
            // Proactive pacing: if the previous response said quota is nearly
            // gone, sleep until the reset plus a margin before calling again.
            if let Some(wait) = self.quota.pacing_wait() {
                if self.debug {
                    eprintln!(
                        "\x1b[33m[quota]\x1b[0m \u{23f8} quota low, pacing {}s before next call",
                        wait
                    );
                }
                tokio::time::sleep(Duration::from_secs(wait)).await;
            }

            let start = std::time::Instant::now();
            let response = match build().send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = format!("request failed: {}", e);
                    tokio::time::sleep(self.policy.linear_backoff(attempt)).await;
                    continue;
                }
            };

            let status = response.status();
            self.record_quota_headers(&response);

            if self.debug {
                let now = chrono::Local::now().format("%H:%M:%S%.3f");
                eprintln!(
                    "\x1b[90m[{}] {} {} ... {}ms\x1b[0m",
                    now,
                    status.as_u16(),
                    response.url(),
                    start.elapsed().as_millis()
                );
            }

            if status.is_success() {
                return Ok(response);
            }

            // Malformed query or missing resource: never retried.
            if status == reqwest::StatusCode::NOT_FOUND
                || status == reqwest::StatusCode::UNPROCESSABLE_ENTITY
                || status == reqwest::StatusCode::BAD_REQUEST
                || status == reqwest::StatusCode::UNAUTHORIZED
            {
                return Err(FetchError::Fatal(format!("HTTP {}", status.as_u16())));
            }

            // Quota exceeded: capped exponential/absolute backoff.
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS
                || status == reqwest::StatusCode::FORBIDDEN
            {
                let wait = self
                    .retry_after(&response)
                    .unwrap_or_else(|| self.policy.backoff(attempt));
                last_error = format!("HTTP {} (rate limited)", status.as_u16());
                tokio::time::sleep(wait).await;
                continue;
            }

            // Transient server errors: short linear backoff.
            if status.is_server_error() {
                last_error = format!("HTTP {}", status.as_u16());
                tokio::time::sleep(self.policy.linear_backoff(attempt)).await;
                continue;
            }

            // Anything else 4xx-ish is a bad request on our side.
            return Err(FetchError::Fatal(format!("HTTP {}", status.as_u16())));
        }

        Err(FetchError::Retryable(format!(
            "exhausted {} attempts: {}",
            self.policy.max_attempts, last_error
        )))
    }

    fn record_quota_headers(&self, response: &reqwest::Response) {
        let remaining = header_u64(response, "x-ratelimit-remaining");
        let reset = header_u64(response, "x-ratelimit-reset");
        self.quota.record(remaining, reset);
    }

    /// Absolute backoff from Retry-After or the reset header, capped at the
    /// policy maximum.
    fn retry_after(&self, response: &reqwest::Response) -> Option<Duration> {
        if let Some(secs) = header_u64(response, "retry-after") {
            return Some(Duration::from_secs(secs).min(self.policy.max_delay));
        }
        let reset = header_u64(response, "x-ratelimit-reset")?;
        let now = now_epoch();
        if reset > now {
            Some(Duration::from_secs(reset - now + RESET_MARGIN_SECS).min(self.policy.max_delay))
        } else {
            None
        }
    }
}

fn header_u64(response: &reqwest::Response, name: &str) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.parse().ok())
}
