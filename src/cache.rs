//! Multi-tier read-through cache: L1 memory, optional L2 remote KV, L3 disk.
//!
//! Reads probe L1 → L2 → L3; a hit in a lower tier promotes a copy upward.
//! Writes update every enabled tier; only the disk tier can fail the call,
//! the remote tier degrades to a miss with a short skip window. Concurrent
//! misses on one key coalesce into a single upstream load (single-flight):
//! the first caller becomes the leader and runs the loader, the rest
//! subscribe to a broadcast of its result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, WallClock};
use crate::error::CacheError;
use crate::node::sha256_hex;
use crate::stats::StatsRegistry;

pub mod disk;
pub mod memory;
pub mod remote;

pub use disk::{DiskConfig, DiskTier};
pub use memory::{MemoryConfig, MemoryTier};
pub use remote::{HttpKv, RemoteKv, RemoteTier};

/// Which tier served (or missed) a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    L1,
    L2,
    L3,
}

impl CacheTier {
    pub fn index(&self) -> usize {
        match self {
            CacheTier::L1 => 0,
            CacheTier::L2 => 1,
            CacheTier::L3 => 2,
        }
    }
}

/// Where a `get_or_fetch` value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    /// Served from a cache tier.
    Cache,
    /// This caller ran the loader.
    Upstream,
    /// Another in-flight caller ran the loader; we shared its result.
    Coalesced,
}

/// Type-erased loader failure shared between coalesced callers.
#[derive(Debug, Clone)]
pub struct LoadError(pub Arc<dyn std::error::Error + Send + Sync>);

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for LoadError {}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub memory: MemoryConfig,
    pub disk: DiskConfig,
    pub l1_ttl: Duration,
    pub l2_ttl: Duration,
    pub l3_ttl: Duration,
    pub l2_backoff: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory: MemoryConfig::default(),
            disk: DiskConfig::default(),
            l1_ttl: Duration::from_secs(3600),
            l2_ttl: Duration::from_secs(24 * 3600),
            l3_ttl: Duration::from_secs(7 * 24 * 3600),
            l2_backoff: Duration::from_secs(5),
        }
    }
}

type FlightResult = Result<Vec<u8>, LoadError>;

pub struct TieredCache {
    l1: MemoryTier,
    l2: Option<RemoteTier>,
    l3: DiskTier,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    stats: StatsRegistry,
    inflight: Mutex<HashMap<String, broadcast::Sender<FlightResult>>>,
}

impl TieredCache {
    pub fn new(
        config: CacheConfig,
        l3_path: impl Into<std::path::PathBuf>,
        remote: Option<Box<dyn RemoteKv>>,
        stats: StatsRegistry,
    ) -> Self {
        Self {
            l1: MemoryTier::new(config.memory),
            l2: remote.map(|kv| RemoteTier::new(kv, config.l2_backoff)),
            l3: DiskTier::open(l3_path, config.disk),
            config,
            clock: Arc::new(WallClock),
            stats,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Override the clock (useful for deterministic TTL tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Probe tiers in order, promoting hits upward. `tier_hint` starts the
    /// probe at a lower tier when the caller knows higher ones are cold.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.get_with_hint(key, None).await
    }

    pub async fn get_with_hint(&self, key: &str, tier_hint: Option<CacheTier>) -> Option<Vec<u8>> {
        let now = self.clock.now_millis();
        let start = tier_hint.map(|t| t.index()).unwrap_or(0);

        if start == 0 {
            if let Some(value) = self.l1.get(key, now) {
                self.stats.record_cache_hit(CacheTier::L1);
                return Some(value);
            }
            self.stats.record_cache_miss(CacheTier::L1);
        }

        if start <= 1 {
            if let Some(l2) = &self.l2 {
                match l2.get(key, now).await {
                    Some(value) => {
                        self.stats.record_cache_hit(CacheTier::L2);
                        self.l1.set(key, value.clone(), self.config.l1_ttl, now);
                        return Some(value);
                    }
                    None => self.stats.record_cache_miss(CacheTier::L2),
                }
            }
        }

        match self.l3.get(key, now) {
            Some(value) => {
                self.stats.record_cache_hit(CacheTier::L3);
                self.l1.set(key, value.clone(), self.config.l1_ttl, now);
                if let Some(l2) = &self.l2 {
                    l2.put(key, &value, self.config.l2_ttl, now).await;
                }
                Some(value)
            }
            None => {
                self.stats.record_cache_miss(CacheTier::L3);
                None
            }
        }
    }

    /// Write through every enabled tier. `ttl` of `None` takes each tier's
    /// default. Remote failures are logged inside the tier; only the disk
    /// tier can fail the call.
    pub async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let now = self.clock.now_millis();
        self.l1.set(key, value.to_vec(), ttl.unwrap_or(self.config.l1_ttl), now);
        if let Some(l2) = &self.l2 {
            l2.put(key, value, ttl.unwrap_or(self.config.l2_ttl), now).await;
        }
        self.l3.set(key, value, ttl.unwrap_or(self.config.l3_ttl), now)
    }

    /// Remove every entry whose key starts with `prefix`. Returns the total
    /// number of entries removed across tiers.
    pub async fn invalidate_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let now = self.clock.now_millis();
        let mut count = self.l1.invalidate_prefix(prefix);
        if let Some(l2) = &self.l2 {
            count += l2.delete_prefix(prefix, now).await;
        }
        count += self.l3.invalidate_prefix(prefix)?;
        Ok(count)
    }

    /// Read-through load with single-flight coalescing.
    ///
    /// On a cold key the first caller runs `loader` exactly once; concurrent
    /// callers for the same key await the leader's broadcast. A successful
    /// load is written to all tiers before followers are woken.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        cancel: &CancellationToken,
        loader: F,
    ) -> Result<(Vec<u8>, LoadSource), LoadError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<u8>, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut loader = Some(loader);
        loop {
            if let Some(value) = self.get(key).await {
                return Ok((value, LoadSource::Cache));
            }

            enum Role {
                Leader,
                Follower(broadcast::Receiver<FlightResult>),
            }

            let role = {
                let mut inflight = self.lock_inflight();
                match inflight.get(key) {
                    Some(sender) => Role::Follower(sender.subscribe()),
                    None => {
                        let (sender, _) = broadcast::channel(1);
                        inflight.insert(key.to_string(), sender);
                        Role::Leader
                    }
                }
            };

            match role {
                Role::Follower(mut receiver) => {
                    let received = tokio::select! {
                        r = receiver.recv() => r,
                        _ = cancel.cancelled() => {
                            return Err(LoadError(Arc::new(crate::error::FetchError::Cancelled)));
                        }
                    };
                    match received {
                        Ok(Ok(value)) => return Ok((value, LoadSource::Coalesced)),
                        Ok(Err(e)) => return Err(e),
                        // Leader abandoned (cancelled); take another lap and
                        // possibly become the leader ourselves.
                        Err(_) => continue,
                    }
                }
                Role::Leader => {
                    // Remove the in-flight entry on every exit path; if this
                    // future is dropped mid-load the guard wakes followers so
                    // one of them can take over.
                    let guard = FlightGuard { cache: self, key: key.to_string(), done: false };
                    let loader = loader.take().expect("leader role reached twice");
                    let result = loader().await;
                    match result {
                        Ok(value) => {
                            self.set(key, &value, ttl)
                                .await
                                .map_err(|e| LoadError(Arc::new(e)))?;
                            guard.complete(Ok(value.clone()));
                            return Ok((value, LoadSource::Upstream));
                        }
                        Err(e) => {
                            let shared = LoadError(Arc::new(e));
                            guard.complete(Err(shared.clone()));
                            return Err(shared);
                        }
                    }
                }
            }
        }
    }

    /// Opportunistic maintenance: drop expired disk rows.
    pub fn compact(&self) -> Result<u64, CacheError> {
        self.l3.compact(self.clock.now_millis())
    }

    fn lock_inflight(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<FlightResult>>> {
        self.inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct FlightGuard<'a> {
    cache: &'a TieredCache,
    key: String,
    done: bool,
}

impl FlightGuard<'_> {
    fn complete(mut self, result: FlightResult) {
        let sender = self.cache.lock_inflight().remove(&self.key);
        if let Some(sender) = sender {
            let _ = sender.send(result);
        }
        self.done = true;
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        // Leader dropped without completing; removing the sender wakes the
        // followers with a recv error and they re-race for leadership.
        if !self.done {
            let _ = self.cache.lock_inflight().remove(&self.key);
        }
    }
}

/// Cache key for a fetched body.
pub fn fetch_key(url: &str) -> String {
    format!("fetch:{}", sha256_hex(url.as_bytes()))
}

/// Cache key for a canonicalized node blob.
pub fn node_key(fingerprint: &str) -> String {
    format!("node:{fingerprint}")
}
