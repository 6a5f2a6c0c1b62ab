//! L2: optional remote KV behind a trait, with failure back-off.
//!
//! The remote tier is best-effort: a failed call degrades to a miss and
//! opens a short skip window so a down backend is not hammered on every
//! cache operation.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::CacheError;

/// Storage interface for the remote tier. Implementations may be an HTTP KV,
/// Redis-style server, or an in-memory fake in tests.
#[async_trait]
pub trait RemoteKv: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    /// Returns the number of keys removed, when the backend reports it.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError>;
}

/// HTTP KV client: `GET/PUT/DELETE {base}/{key}` with the TTL in a header.
#[derive(Debug)]
pub struct HttpKv {
    base: url::Url,
    client: reqwest::Client,
}

impl HttpKv {
    pub fn new(base: url::Url) -> Self {
        Self { base, client: reqwest::Client::new() }
    }

    // Keys carry a `fetch:`/`node:` prefix, so they must go in as a path
    // segment; a plain join would read the prefix as a URL scheme.
    fn key_url(&self, key: &str) -> Result<url::Url, CacheError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| CacheError::RemoteUnavailable("cache base url cannot hold keys".into()))?
            .push(key);
        Ok(url)
    }
}

#[async_trait]
impl RemoteKv for HttpKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let response = self
            .client
            .get(self.key_url(key)?)
            .send()
            .await
            .map_err(|e| CacheError::RemoteUnavailable(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(CacheError::RemoteUnavailable(format!(
                "kv get returned {}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| CacheError::RemoteUnavailable(e.to_string()))?;
        Ok(Some(body.to_vec()))
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let response = self
            .client
            .put(self.key_url(key)?)
            .header("x-ttl-seconds", ttl.as_secs())
            .body(value.to_vec())
            .send()
            .await
            .map_err(|e| CacheError::RemoteUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CacheError::RemoteUnavailable(format!(
                "kv put returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut url = self.base.clone();
        url.set_query(Some(&format!("prefix={prefix}")));
        let response = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(|e| CacheError::RemoteUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CacheError::RemoteUnavailable(format!(
                "kv delete returned {}",
                response.status()
            )));
        }
        let text = response.text().await.unwrap_or_default();
        Ok(text.trim().parse().unwrap_or(0))
    }
}

/// Wrapper adding the degraded-mode skip window around any [`RemoteKv`].
pub struct RemoteTier {
    kv: Box<dyn RemoteKv>,
    backoff: Duration,
    skip_until_millis: Mutex<u64>,
}

impl RemoteTier {
    pub fn new(kv: Box<dyn RemoteKv>, backoff: Duration) -> Self {
        Self { kv, backoff, skip_until_millis: Mutex::new(0) }
    }

    /// Whether the tier is currently worth calling.
    pub fn available(&self, now_millis: u64) -> bool {
        *self.lock_skip() <= now_millis
    }

    pub async fn get(&self, key: &str, now_millis: u64) -> Option<Vec<u8>> {
        if !self.available(now_millis) {
            return None;
        }
        match self.kv.get(key).await {
            Ok(value) => value,
            Err(e) => {
                self.trip(now_millis, &e);
                None
            }
        }
    }

    pub async fn put(&self, key: &str, value: &[u8], ttl: Duration, now_millis: u64) {
        if !self.available(now_millis) {
            return;
        }
        if let Err(e) = self.kv.put(key, value, ttl).await {
            self.trip(now_millis, &e);
        }
    }

    pub async fn delete_prefix(&self, prefix: &str, now_millis: u64) -> u64 {
        if !self.available(now_millis) {
            return 0;
        }
        match self.kv.delete_prefix(prefix).await {
            Ok(count) => count,
            Err(e) => {
                self.trip(now_millis, &e);
                0
            }
        }
    }

    fn trip(&self, now_millis: u64, error: &CacheError) {
        tracing::warn!(%error, backoff_ms = self.backoff.as_millis() as u64, "remote cache tier degraded");
        *self.lock_skip() = now_millis.saturating_add(self.backoff.as_millis() as u64);
    }

    fn lock_skip(&self) -> std::sync::MutexGuard<'_, u64> {
        self.skip_until_millis.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
