//! Thread-safe counters for the control surface.
//!
//! Individual counters are linearizable; cross-counter consistency is not
//! promised. Readers get a copy-on-read snapshot so they never observe a
//! half-updated registry.

use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cache::CacheTier;

/// Shared handle; all clones update the same registry.
#[derive(Clone)]
pub struct StatsRegistry {
    inner: Arc<Mutex<StatsInner>>,
}

struct StatsInner {
    sources_total: u64,
    sources_ok: u64,
    sources_failed: u64,
    nodes_seen: u64,
    nodes_unique: u64,
    duplicates_suppressed: u64,
    duplicates_by_source: HashMap<String, u64>,
    parse_errors: u64,
    cache_hits: [u64; 3],
    cache_misses: [u64; 3],
    fetch_durations: Histogram<u64>,
    last_update: Option<DateTime<Utc>>,
}

/// Immutable snapshot of all counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub sources_total: u64,
    pub sources_ok: u64,
    pub sources_failed: u64,
    pub nodes_seen: u64,
    pub nodes_unique: u64,
    pub duplicates_suppressed: u64,
    pub duplicates_by_source: HashMap<String, u64>,
    pub parse_errors: u64,
    pub cache_l1_hits: u64,
    pub cache_l1_misses: u64,
    pub cache_l2_hits: u64,
    pub cache_l2_misses: u64,
    pub cache_l3_hits: u64,
    pub cache_l3_misses: u64,
    pub fetch_duration_ms_p50: u64,
    pub fetch_duration_ms_p90: u64,
    pub fetch_duration_ms_p99: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StatsInner {
                sources_total: 0,
                sources_ok: 0,
                sources_failed: 0,
                nodes_seen: 0,
                nodes_unique: 0,
                duplicates_suppressed: 0,
                duplicates_by_source: HashMap::new(),
                parse_errors: 0,
                cache_hits: [0; 3],
                cache_misses: [0; 3],
                // 1ms..10min covers any fetch the timeout allows
                fetch_durations: Histogram::new_with_bounds(1, 600_000, 3)
                    .expect("static histogram bounds"),
                last_update: None,
            })),
        }
    }

    pub fn record_source_attempt(&self) {
        let mut inner = self.lock();
        inner.sources_total += 1;
    }

    pub fn record_source_ok(&self) {
        let mut inner = self.lock();
        inner.sources_ok += 1;
        inner.last_update = Some(Utc::now());
    }

    pub fn record_source_failed(&self) {
        let mut inner = self.lock();
        inner.sources_failed += 1;
        inner.last_update = Some(Utc::now());
    }

    /// Wall time of one real upstream fetch (cache hits are not recorded).
    pub fn record_fetch_duration(&self, duration_ms: u64) {
        let mut inner = self.lock();
        let _ = inner.fetch_durations.record(duration_ms.max(1));
        inner.last_update = Some(Utc::now());
    }

    pub fn record_nodes_seen(&self, count: u64) {
        self.lock().nodes_seen += count;
    }

    pub fn record_unique(&self) {
        self.lock().nodes_unique += 1;
    }

    /// A duplicate was suppressed; charged to the losing source.
    pub fn record_duplicate(&self, source_id: &str) {
        let mut inner = self.lock();
        inner.duplicates_suppressed += 1;
        *inner.duplicates_by_source.entry(source_id.to_string()).or_default() += 1;
    }

    pub fn record_parse_errors(&self, count: u64) {
        self.lock().parse_errors += count;
    }

    pub fn record_cache_hit(&self, tier: CacheTier) {
        self.lock().cache_hits[tier.index()] += 1;
    }

    pub fn record_cache_miss(&self, tier: CacheTier) {
        self.lock().cache_misses[tier.index()] += 1;
    }

    /// Reset the per-job counters at the start of a run. Cache counters and
    /// the duration histogram accumulate across jobs.
    pub fn begin_job(&self) {
        let mut inner = self.lock();
        inner.sources_total = 0;
        inner.sources_ok = 0;
        inner.sources_failed = 0;
        inner.nodes_seen = 0;
        inner.nodes_unique = 0;
        inner.duplicates_suppressed = 0;
        inner.duplicates_by_source.clear();
        inner.parse_errors = 0;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.lock();
        let h = &inner.fetch_durations;
        let quantile = |q: f64| if h.is_empty() { 0 } else { h.value_at_quantile(q) };
        StatsSnapshot {
            sources_total: inner.sources_total,
            sources_ok: inner.sources_ok,
            sources_failed: inner.sources_failed,
            nodes_seen: inner.nodes_seen,
            nodes_unique: inner.nodes_unique,
            duplicates_suppressed: inner.duplicates_suppressed,
            duplicates_by_source: inner.duplicates_by_source.clone(),
            parse_errors: inner.parse_errors,
            cache_l1_hits: inner.cache_hits[0],
            cache_l1_misses: inner.cache_misses[0],
            cache_l2_hits: inner.cache_hits[1],
            cache_l2_misses: inner.cache_misses[1],
            cache_l3_hits: inner.cache_hits[2],
            cache_l3_misses: inner.cache_misses[2],
            fetch_duration_ms_p50: quantile(0.50),
            fetch_duration_ms_p90: quantile(0.90),
            fetch_duration_ms_p99: quantile(0.99),
            last_update: inner.last_update,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatsInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
