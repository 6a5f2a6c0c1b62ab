//! L3: single-writer persistent KV backed by a flat JSON row file.
//!
//! Rows are kept in insertion order, which doubles as age order, so the
//! over-budget eviction policy is simply "pop from the front". Every
//! mutation persists the whole file atomically (`.tmp` + rename); a crash
//! mid-write leaves the previous file intact.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;

use crate::error::CacheError;

#[derive(Debug, Clone, Copy)]
pub struct DiskConfig {
    pub max_rows: usize,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self { max_rows: 100_000 }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Row {
    key: String,
    value_b64: String,
    created_at_ms: u64,
    ttl_ms: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RowFile {
    rows: Vec<Row>,
}

pub struct DiskTier {
    path: PathBuf,
    max_rows: usize,
    rows: Mutex<IndexMap<String, Row>>,
}

impl DiskTier {
    /// Open (or create) the row file. Unreadable files start empty rather
    /// than failing startup; the cache is advisory.
    pub fn open(path: impl Into<PathBuf>, config: DiskConfig) -> Self {
        let path = path.into();
        let rows = match std::fs::read(&path) {
            Ok(raw) => match serde_json::from_slice::<RowFile>(&raw) {
                Ok(file) => file.rows.into_iter().map(|r| (r.key.clone(), r)).collect(),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cache rows unreadable, starting empty");
                    IndexMap::new()
                }
            },
            Err(_) => IndexMap::new(),
        };
        Self { path, max_rows: config.max_rows, rows: Mutex::new(rows) }
    }

    pub fn get(&self, key: &str, now_millis: u64) -> Option<Vec<u8>> {
        let rows = self.lock();
        let row = rows.get(key)?;
        if row.created_at_ms.saturating_add(row.ttl_ms) <= now_millis {
            return None;
        }
        B64.decode(&row.value_b64).ok()
    }

    pub fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        now_millis: u64,
    ) -> Result<(), CacheError> {
        let mut rows = self.lock();
        // Re-inserting moves the row to the back: a rewritten row is young.
        rows.shift_remove(key);
        rows.insert(
            key.to_string(),
            Row {
                key: key.to_string(),
                value_b64: B64.encode(value),
                created_at_ms: now_millis,
                ttl_ms: ttl.as_millis() as u64,
            },
        );
        while rows.len() > self.max_rows {
            rows.shift_remove_index(0);
        }
        self.persist(&rows)
    }

    pub fn invalidate_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut rows = self.lock();
        let before = rows.len();
        rows.retain(|key, _| !key.starts_with(prefix));
        let removed = (before - rows.len()) as u64;
        if removed > 0 {
            self.persist(&rows)?;
        }
        Ok(removed)
    }

    /// Drop expired rows and persist if anything changed.
    pub fn compact(&self, now_millis: u64) -> Result<u64, CacheError> {
        let mut rows = self.lock();
        let before = rows.len();
        rows.retain(|_, row| row.created_at_ms.saturating_add(row.ttl_ms) > now_millis);
        let removed = (before - rows.len()) as u64;
        if removed > 0 {
            self.persist(&rows)?;
        }
        Ok(removed)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn persist(&self, rows: &IndexMap<String, Row>) -> Result<(), CacheError> {
        let file = RowFile {
            rows: rows
                .values()
                .map(|r| Row {
                    key: r.key.clone(),
                    value_b64: r.value_b64.clone(),
                    created_at_ms: r.created_at_ms,
                    ttl_ms: r.ttl_ms,
                })
                .collect(),
        };
        let json = serde_json::to_vec(&file).map_err(|e| CacheError::Codec(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IndexMap<String, Row>> {
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}
