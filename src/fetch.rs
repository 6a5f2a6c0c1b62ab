//! Retrying, size-capped, cancellable feed fetcher.
//!
//! The network sits behind the [`Transport`] trait so tests script responses
//! instead of opening sockets. Every request passes the per-host admission
//! gate first; terminal outcomes are fed back so the breaker sees the truth.
//!
//! Retry policy: network errors, timeouts, 408/429 and 5xx are retried up to
//! the attempt budget with `base · 2^attempt` backoff (±20 % jitter); other
//! 4xx are not. A 429 with `Retry-After` sleeps that long instead of the
//! computed backoff.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::admission::{Admission, HostAdmission, Outcome};
use crate::backoff::Backoff;
use crate::error::FetchError;
use crate::jitter::Jitter;
use crate::sleeper::{Sleeper, TokioSleeper};

/// Cap on how long a `Retry-After` header may stall one attempt.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Raw transport-level response before policy is applied.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("network: {0}")]
    Network(String),

    #[error("transport timed out")]
    TimedOut,

    #[error("body exceeded {limit} bytes")]
    TooLarge { limit: u64 },
}

/// The seam between retry policy and the actual HTTP client.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn get(
        &self,
        url: &str,
        timeout: Duration,
        max_bytes: u64,
    ) -> Result<RawResponse, TransportError>;
}

/// Production transport over reqwest. TLS via rustls; gzip, deflate and
/// brotli bodies are decompressed transparently by the client.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent.to_string())
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(
        &self,
        url: &str,
        timeout: Duration,
        max_bytes: u64,
    ) -> Result<RawResponse, TransportError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);

        if let Some(length) = response.content_length() {
            if length > max_bytes {
                return Err(TransportError::TooLarge { limit: max_bytes });
            }
        }

        // Stream the body so the cap also holds when Content-Length lies
        // or is absent.
        let mut body = Vec::new();
        let mut response = response;
        while let Some(chunk) =
            response.chunk().await.map_err(classify_reqwest_error)?
        {
            if (body.len() + chunk.len()) as u64 > max_bytes {
                return Err(TransportError::TooLarge { limit: max_bytes });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(RawResponse { status, body, retry_after })
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::TimedOut
    } else {
        TransportError::Network(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub max_body_bytes: u64,
    pub max_attempts: usize,
    pub backoff: Backoff,
    pub jitter: Jitter,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_body_bytes: 20 * 1024 * 1024,
            max_attempts: 3,
            backoff: Backoff::new(Duration::from_millis(500)),
            jitter: Jitter::proportional(0.2),
        }
    }
}

/// A fetched body plus the measurements statistics care about.
#[derive(Debug)]
pub struct FetchSuccess {
    pub body: Vec<u8>,
    pub duration_ms: u64,
    pub bytes: u64,
}

#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    admission: HostAdmission,
    sleeper: Arc<dyn Sleeper>,
    config: FetchConfig,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, admission: HostAdmission, config: FetchConfig) -> Self {
        Self { transport, admission, sleeper: Arc::new(TokioSleeper), config }
    }

    /// Swap the sleeper (instant/tracking in tests).
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn admission(&self) -> &HostAdmission {
        &self.admission
    }

    /// Fetch one URL under the admission gate, retry policy and body cap.
    pub async fn fetch(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchSuccess, FetchError> {
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?;

        let started = Instant::now();
        let mut admission_waited = Duration::ZERO;
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            match self.admission.acquire(&host) {
                Admission::Granted => {}
                Admission::CircuitOpen => {
                    return Err(FetchError::CircuitOpen { host });
                }
                Admission::RetryAfter(wait) => {
                    // Block on the bucket only up to the per-request budget.
                    admission_waited += wait;
                    if admission_waited > self.config.timeout {
                        return Err(FetchError::Network(format!(
                            "rate limit wait exceeded request budget for {host}"
                        )));
                    }
                    self.sleep(wait, cancel).await?;
                    continue;
                }
            }

            attempt += 1;
            let attempt_started = Instant::now();
            let result = tokio::select! {
                r = self.transport.get(url, self.config.timeout, self.config.max_body_bytes) => r,
                _ = cancel.cancelled() => {
                    // Partial body (if any) is dropped with the future.
                    return Err(FetchError::Cancelled);
                }
            };

            let error = match result {
                Ok(response) if (200..300).contains(&response.status) => {
                    self.admission.record(&host, Outcome::Success);
                    let duration_ms = started.elapsed().as_millis() as u64;
                    let bytes = response.body.len() as u64;
                    tracing::debug!(url, bytes, duration_ms, "fetched");
                    return Ok(FetchSuccess { body: response.body, duration_ms, bytes });
                }
                Ok(response) => {
                    self.admission.record(&host, Outcome::Failure);
                    let err = FetchError::HttpStatus(response.status);
                    if err.is_retryable() && attempt < self.config.max_attempts {
                        let wait = response
                            .retry_after
                            .filter(|_| response.status == 429)
                            .map(|ra| ra.min(MAX_RETRY_AFTER))
                            .unwrap_or_else(|| self.backoff_delay(attempt));
                        tracing::debug!(url, status = response.status, wait_ms = wait.as_millis() as u64, "retrying");
                        self.sleep(wait, cancel).await?;
                        continue;
                    }
                    err
                }
                Err(TransportError::TimedOut) => {
                    self.admission.record(&host, Outcome::Timeout);
                    let err = FetchError::Timeout {
                        elapsed: attempt_started.elapsed(),
                        timeout: self.config.timeout,
                    };
                    if attempt < self.config.max_attempts {
                        let wait = self.backoff_delay(attempt);
                        self.sleep(wait, cancel).await?;
                        continue;
                    }
                    err
                }
                Err(TransportError::TooLarge { limit }) => {
                    self.admission.record(&host, Outcome::Failure);
                    FetchError::TooLarge { limit }
                }
                Err(TransportError::Network(reason)) => {
                    self.admission.record(&host, Outcome::Failure);
                    if attempt < self.config.max_attempts {
                        let wait = self.backoff_delay(attempt);
                        tracing::debug!(url, %reason, wait_ms = wait.as_millis() as u64, "retrying");
                        self.sleep(wait, cancel).await?;
                        continue;
                    }
                    FetchError::Network(reason)
                }
            };

            tracing::debug!(url, error = %error, attempts = attempt, "fetch failed");
            return Err(error);
        }
    }

    fn backoff_delay(&self, attempt: usize) -> Duration {
        self.config.jitter.apply(self.config.backoff.delay(attempt))
    }

    async fn sleep(&self, wait: Duration, cancel: &CancellationToken) -> Result<(), FetchError> {
        tokio::select! {
            _ = self.sleeper.sleep(wait) => Ok(()),
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
        }
    }
}
