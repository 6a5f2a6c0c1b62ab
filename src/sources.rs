//! Source manager: the tiered upstream list and its health counters.
//!
//! Readers (the pipeline, the control plane) take lock-free snapshots via
//! `ArcSwap`; writers are serialized behind a mutex and replace the whole
//! list, so listing order is stable between mutations.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use url::Url;

use crate::error::SourceError;
use crate::node::sha256_hex;

/// Quality class of a source. Variant order is rank order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Experimental,
    Bulk,
    Reliable,
    Premium,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Premium => "premium",
            Tier::Reliable => "reliable",
            Tier::Bulk => "bulk",
            Tier::Experimental => "experimental",
        }
    }

    /// Default per-source weight when the config omits one.
    pub fn default_weight(&self) -> f64 {
        match self {
            Tier::Premium => 1.0,
            Tier::Reliable => 0.75,
            Tier::Bulk => 0.5,
            Tier::Experimental => 0.25,
        }
    }
}

impl FromStr for Tier {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "premium" => Ok(Tier::Premium),
            "reliable" => Ok(Tier::Reliable),
            "bulk" => Ok(Tier::Bulk),
            "experimental" => Ok(Tier::Experimental),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One upstream subscription feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub url: String,
    pub tier: Tier,
    pub weight: f64,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_response_ms: f64,
}

impl Source {
    /// Fraction of attempts that succeeded; 0 for a source never tried.
    pub fn reliability(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        self.success_count as f64 / (total.max(1)) as f64
    }

    /// Host component of the url, used as the admission key.
    pub fn host(&self) -> Option<String> {
        Url::parse(&self.url).ok().and_then(|u| u.host_str().map(str::to_string))
    }
}

/// Result of an add-source request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Added { id: String },
    Duplicate { id: String },
    Invalid { reason: String },
}

/// Fetch outcome fed back into source counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Success,
    Failure,
}

/// The tiered sources YAML document.
#[derive(Debug, Deserialize)]
struct SourcesDoc {
    #[serde(default)]
    #[allow(dead_code)]
    version: Option<u32>,
    #[serde(default)]
    sources: indexmap::IndexMap<String, Vec<SourceEntry>>,
}

/// A list entry is either a bare URL or a map with metadata.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SourceEntry {
    Url(String),
    Detailed {
        url: String,
        #[serde(default)]
        weight: Option<f64>,
        #[serde(default)]
        enabled: Option<bool>,
    },
}

/// Per-source persisted health counters, keyed by source id.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SourceStateFile {
    #[serde(default)]
    counters: HashMap<String, SourceCounters>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SourceCounters {
    success_count: u64,
    failure_count: u64,
    avg_response_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_checked: Option<DateTime<Utc>>,
}

pub struct SourceManager {
    list: ArcSwap<Vec<Source>>,
    // Serializes mutations; readers never take it.
    write_lock: Mutex<()>,
    normalize_query: bool,
}

impl SourceManager {
    /// Parse the tiered YAML document. Unknown tiers fold into `bulk` with a
    /// warning; duplicate normalized URLs are dropped with a warning.
    pub fn load(config_bytes: &[u8], normalize_query: bool) -> Result<Self, SourceError> {
        let doc: SourcesDoc = serde_yaml::from_slice(config_bytes)
            .map_err(|e| SourceError::ConfigMalformed(e.to_string()))?;

        let mut seen = HashMap::new();
        let mut list = Vec::new();
        for (tier_name, entries) in doc.sources {
            let tier = match Tier::from_str(&tier_name) {
                Ok(t) => t,
                Err(()) => {
                    tracing::warn!(tier = %tier_name, "unknown tier, treating as bulk");
                    Tier::Bulk
                }
            };
            for entry in entries {
                let (url, weight, enabled) = match entry {
                    SourceEntry::Url(url) => (url, None, None),
                    SourceEntry::Detailed { url, weight, enabled } => (url, weight, enabled),
                };
                let url = url.trim().to_string();
                let normalized = match normalize_url(&url, normalize_query) {
                    Ok(n) => n,
                    Err(reason) => {
                        tracing::warn!(%url, %reason, "skipping invalid source url");
                        continue;
                    }
                };
                if let Some(prev) = seen.insert(normalized.clone(), url.clone()) {
                    tracing::warn!(%url, %prev, "duplicate source url dropped");
                    continue;
                }
                list.push(Source {
                    id: source_id(&normalized),
                    url,
                    tier,
                    weight: weight.unwrap_or_else(|| tier.default_weight()).clamp(0.0, 1.0),
                    enabled: enabled.unwrap_or(true),
                    last_checked: None,
                    success_count: 0,
                    failure_count: 0,
                    avg_response_ms: 0.0,
                });
            }
        }

        tracing::info!(count = list.len(), "sources loaded");
        Ok(Self {
            list: ArcSwap::from_pointee(list),
            write_lock: Mutex::new(()),
            normalize_query,
        })
    }

    pub fn empty() -> Self {
        Self {
            list: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
            normalize_query: false,
        }
    }

    /// Snapshot of the current list. Order is stable across calls.
    pub fn all(&self) -> Arc<Vec<Source>> {
        self.list.load_full()
    }

    pub fn get(&self, id: &str) -> Option<Source> {
        self.all().iter().find(|s| s.id == id).cloned()
    }

    /// Validate and append a source; defaults to the experimental tier.
    pub fn add(&self, url: &str, tier: Option<Tier>) -> AddOutcome {
        let url = url.trim().to_string();
        let normalized = match normalize_url(&url, self.normalize_query) {
            Ok(n) => n,
            Err(reason) => return AddOutcome::Invalid { reason },
        };
        let id = source_id(&normalized);

        let _guard = self.write_guard();
        let current = self.list.load_full();
        if current.iter().any(|s| s.id == id) {
            return AddOutcome::Duplicate { id };
        }
        let tier = tier.unwrap_or(Tier::Experimental);
        let mut next = current.as_ref().clone();
        next.push(Source {
            id: id.clone(),
            url,
            tier,
            weight: tier.default_weight(),
            enabled: true,
            last_checked: None,
            success_count: 0,
            failure_count: 0,
            avg_response_ms: 0.0,
        });
        self.list.store(Arc::new(next));
        AddOutcome::Added { id }
    }

    /// Update a source's health counters after a fetch attempt.
    pub fn mark_result(&self, id: &str, outcome: MarkOutcome, response_ms: u64) {
        let _guard = self.write_guard();
        let current = self.list.load_full();
        let mut next = current.as_ref().clone();
        if let Some(source) = next.iter_mut().find(|s| s.id == id) {
            match outcome {
                MarkOutcome::Success => source.success_count += 1,
                MarkOutcome::Failure => source.failure_count += 1,
            }
            let attempts = source.success_count + source.failure_count;
            source.avg_response_ms +=
                (response_ms as f64 - source.avg_response_ms) / attempts.max(1) as f64;
            source.last_checked = Some(Utc::now());
            self.list.store(Arc::new(next));
        }
    }

    /// Merge persisted counters into the loaded list.
    pub fn restore_state(&self, path: &Path) {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        let state: SourceStateFile = match serde_json::from_slice(&raw) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "source state unreadable");
                return;
            }
        };
        let _guard = self.write_guard();
        let mut next = self.list.load_full().as_ref().clone();
        for source in next.iter_mut() {
            if let Some(counters) = state.counters.get(&source.id) {
                source.success_count = counters.success_count;
                source.failure_count = counters.failure_count;
                source.avg_response_ms = counters.avg_response_ms;
                source.last_checked = counters.last_checked;
            }
        }
        self.list.store(Arc::new(next));
    }

    /// Persist counters. Called at job boundaries.
    pub fn save_state(&self, path: &Path) -> Result<(), SourceError> {
        let list = self.all();
        let state = SourceStateFile {
            counters: list
                .iter()
                .map(|s| {
                    (
                        s.id.clone(),
                        SourceCounters {
                            success_count: s.success_count,
                            failure_count: s.failure_count,
                            avg_response_ms: s.avg_response_ms,
                            last_checked: s.last_checked,
                        },
                    )
                })
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&state)
            .map_err(|e| SourceError::ConfigMalformed(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| SourceError::ConfigUnreadable {
            path: tmp.clone(),
            reason: e.to_string(),
        })?;
        std::fs::rename(&tmp, path).map_err(|e| SourceError::ConfigUnreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    fn write_guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Stable source id: first 12 hex chars of SHA-256 of the normalized URL.
fn source_id(normalized_url: &str) -> String {
    sha256_hex(normalized_url.as_bytes())[..12].to_string()
}

/// Lowercase scheme/host, trim; optionally sort query pairs.
fn normalize_url(raw: &str, normalize_query: bool) -> Result<String, String> {
    let parsed = Url::parse(raw).map_err(|e| e.to_string())?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(format!("unsupported scheme `{other}`")),
    }
    if parsed.host_str().is_none() {
        return Err("missing host".into());
    }
    // Url already lowercases scheme and host.
    let mut normalized = parsed.clone();
    if normalize_query {
        let mut pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        pairs.sort();
        if pairs.is_empty() {
            normalized.set_query(None);
        } else {
            normalized.query_pairs_mut().clear().extend_pairs(pairs);
        }
    }
    Ok(normalized.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
version: 1
sources:
  premium:
    - url: https://feeds.example/premium.txt
      weight: 0.9
  reliable:
    - https://feeds.example/reliable.txt
  bulk:
    - url: https://bulk.example/all.txt
      enabled: false
  mystery:
    - https://unknown.example/feed.txt
"#;

    #[test]
    fn loads_tiers_and_defaults() {
        let manager = SourceManager::load(YAML.as_bytes(), false).unwrap();
        let list = manager.all();
        assert_eq!(list.len(), 4);

        let premium = &list[0];
        assert_eq!(premium.tier, Tier::Premium);
        assert_eq!(premium.weight, 0.9);
        assert!(premium.enabled);

        let reliable = &list[1];
        assert_eq!(reliable.weight, Tier::Reliable.default_weight());

        let bulk = &list[2];
        assert!(!bulk.enabled);

        // Unknown tier folds into bulk
        let mystery = &list[3];
        assert_eq!(mystery.tier, Tier::Bulk);
    }

    #[test]
    fn duplicate_urls_are_dropped_on_load() {
        let yaml = r#"
sources:
  premium:
    - https://feeds.example/a.txt
  bulk:
    - HTTPS://FEEDS.EXAMPLE/a.txt
"#;
        let manager = SourceManager::load(yaml.as_bytes(), false).unwrap();
        assert_eq!(manager.all().len(), 1);
    }

    #[test]
    fn query_order_distinct_unless_normalizing() {
        let yaml = r#"
sources:
  bulk:
    - https://h.example/x?a=1&b=2
    - https://h.example/x?b=2&a=1
"#;
        let strict = SourceManager::load(yaml.as_bytes(), false).unwrap();
        assert_eq!(strict.all().len(), 2);

        let normalized = SourceManager::load(yaml.as_bytes(), true).unwrap();
        assert_eq!(normalized.all().len(), 1);
    }

    #[test]
    fn add_validates_and_dedups() {
        let manager = SourceManager::load(YAML.as_bytes(), false).unwrap();

        match manager.add("https://new.example/feed.txt", None) {
            AddOutcome::Added { id } => assert_eq!(id.len(), 12),
            other => panic!("expected Added, got {other:?}"),
        }
        let added = manager.all().last().cloned().unwrap();
        assert_eq!(added.tier, Tier::Experimental);

        assert!(matches!(
            manager.add("https://new.example/feed.txt", None),
            AddOutcome::Duplicate { .. }
        ));
        assert!(matches!(
            manager.add("not a url", None),
            AddOutcome::Invalid { .. }
        ));
        assert!(matches!(
            manager.add("ftp://h.example/feed", None),
            AddOutcome::Invalid { .. }
        ));
    }

    #[test]
    fn mark_result_updates_counters_and_average() {
        let manager = SourceManager::load(YAML.as_bytes(), false).unwrap();
        let id = manager.all()[0].id.clone();

        manager.mark_result(&id, MarkOutcome::Success, 100);
        manager.mark_result(&id, MarkOutcome::Success, 300);
        manager.mark_result(&id, MarkOutcome::Failure, 0);

        let source = manager.get(&id).unwrap();
        assert_eq!(source.success_count, 2);
        assert_eq!(source.failure_count, 1);
        assert!((source.reliability() - 2.0 / 3.0).abs() < 1e-9);
        assert!(source.last_checked.is_some());
    }

    #[test]
    fn state_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources_state.json");

        let manager = SourceManager::load(YAML.as_bytes(), false).unwrap();
        let id = manager.all()[0].id.clone();
        manager.mark_result(&id, MarkOutcome::Success, 120);
        manager.save_state(&path).unwrap();

        let fresh = SourceManager::load(YAML.as_bytes(), false).unwrap();
        fresh.restore_state(&path);
        let restored = fresh.get(&id).unwrap();
        assert_eq!(restored.success_count, 1);
        assert!(restored.avg_response_ms > 0.0);
    }

    #[test]
    fn reliability_of_untried_source_is_zero() {
        let manager = SourceManager::load(YAML.as_bytes(), false).unwrap();
        assert_eq!(manager.all()[0].reliability(), 0.0);
    }
}
