//! In-process control-plane facade.
//!
//! The HTTP layer (out of scope here) calls these operations and forwards
//! the JSON shapes verbatim. [`App`] also serves as the composition root:
//! `bootstrap` wires the registries, cache, fetcher, engine and job runner
//! from one [`AppConfig`].

use arc_swap::ArcSwap;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::admission::HostAdmission;
use crate::cache::{CacheConfig, HttpKv, TieredCache};
use crate::config::AppConfig;
use crate::error::{ConfigError, FetchError, JobError, SourceError};
use crate::fetch::{Fetcher, HttpTransport};
use crate::jobs::{JobConfig, JobRunner};
use crate::node::{Node, Protocol};
use crate::pipeline::PipelineEngine;
use crate::sources::{AddOutcome, SourceManager, Tier};
use crate::stats::StatsRegistry;

/// Cap on one `ListConfigurations` page.
pub const MAX_PAGE_SIZE: usize = 1_000;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sources(#[from] SourceError),

    #[error("http client: {0}")]
    Http(#[from] FetchError),
}

/// Error body the HTTP collaborator forwards verbatim:
/// `{code, message, details?, job_id?}`.
pub fn error_shape(
    code: &str,
    message: &str,
    details: Option<Value>,
    job_id: Option<&str>,
) -> Value {
    let mut body = serde_json::Map::new();
    body.insert("code".into(), code.into());
    body.insert("message".into(), message.into());
    if let Some(details) = details {
        body.insert("details".into(), details);
    }
    if let Some(job_id) = job_id {
        body.insert("job_id".into(), job_id.into());
    }
    Value::Object(body)
}

/// Query for the configuration listing.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub limit: usize,
    pub offset: usize,
    pub protocol: Option<String>,
    pub min_quality: Option<f64>,
}

pub struct App {
    pub sources: Arc<SourceManager>,
    pub cache: Arc<TieredCache>,
    pub stats: StatsRegistry,
    pub runner: Arc<JobRunner>,
    published: Arc<ArcSwap<Vec<Node>>>,
}

impl App {
    /// Wire every collaborator from one validated config. Must run inside a
    /// tokio runtime (the job runner spawns its dispatch loop).
    pub fn bootstrap(config: &AppConfig) -> Result<Self, BootstrapError> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            SourceError::ConfigUnreadable {
                path: config.data_dir.clone(),
                reason: e.to_string(),
            }
        })?;

        let raw = std::fs::read(&config.sources).map_err(|e| {
            SourceError::ConfigUnreadable {
                path: config.sources.clone(),
                reason: e.to_string(),
            }
        })?;
        let sources = Arc::new(SourceManager::load(&raw, config.normalize_query)?);
        sources.restore_state(&config.data_dir.join("sources_state.json"));

        let stats = StatsRegistry::new();
        let remote = match &config.cache_l2_url {
            Some(base) => {
                let base = url::Url::parse(base).map_err(|e| ConfigError::Invalid {
                    field: "cache_l2_url",
                    reason: e.to_string(),
                })?;
                Some(Box::new(HttpKv::new(base)) as Box<dyn crate::cache::RemoteKv>)
            }
            None => None,
        };
        let cache = Arc::new(TieredCache::new(
            CacheConfig::default(),
            config.cache_l3_path(),
            remote,
            stats.clone(),
        ));

        let transport = Arc::new(HttpTransport::new(&config.user_agent)?);
        let fetcher =
            Fetcher::new(transport, HostAdmission::default(), config.fetch_config());

        let published = Arc::new(ArcSwap::from_pointee(Vec::new()));
        let engine = PipelineEngine::new(
            sources.clone(),
            cache.clone(),
            fetcher,
            stats.clone(),
            config.pipeline_config(),
        )
        .with_published(published.clone());

        let runner =
            JobRunner::start(Arc::new(engine), config.jobs_path(), config.runner_config());

        Ok(Self { sources, cache, stats, runner, published })
    }

    /// `RunPipeline`: queue a job, acknowledge immediately.
    pub fn run_pipeline(&self, config: JobConfig) -> Value {
        let job_id = self.runner.submit(config);
        json!({ "job_id": job_id, "status": "accepted" })
    }

    /// `GetJobStatus`.
    pub fn get_job_status(&self, job_id: &str) -> Result<Value, JobError> {
        let job = self.runner.status(job_id)?;
        serde_json::to_value(&job).map_err(|e| JobError::Persistence(e.to_string()))
    }

    /// `ListSources`.
    pub fn list_sources(&self) -> Value {
        json!({ "sources": self.sources.all().as_ref() })
    }

    /// `AddSource`. Invalid tier names and URLs are synchronous errors.
    pub fn add_source(&self, url: &str, tier: Option<&str>) -> Result<Value, SourceError> {
        let tier = match tier {
            Some(name) => Some(
                Tier::from_str(name)
                    .map_err(|()| SourceError::InvalidTier(name.to_string()))?,
            ),
            None => None,
        };
        match self.sources.add(url, tier) {
            AddOutcome::Added { id } => Ok(json!({ "id": id, "status": "added" })),
            AddOutcome::Duplicate { id } => {
                Ok(json!({ "id": id, "status": "duplicate" }))
            }
            AddOutcome::Invalid { reason } => Err(SourceError::InvalidUrl {
                url: url.to_string(),
                reason,
            }),
        }
    }

    /// `ListConfigurations`: paged view over the last successful run's nodes.
    pub fn list_configurations(&self, query: &ListQuery) -> Result<Value, ConfigError> {
        let protocol = match &query.protocol {
            Some(name) => Some(Protocol::from_str(name).map_err(|()| {
                ConfigError::Invalid { field: "protocol", reason: format!("unknown protocol `{name}`") }
            })?),
            None => None,
        };
        let limit = if query.limit == 0 { MAX_PAGE_SIZE } else { query.limit.min(MAX_PAGE_SIZE) };

        let nodes = self.published.load_full();
        let filtered: Vec<&Node> = nodes
            .iter()
            .filter(|n| protocol.map_or(true, |p| n.protocol == p))
            .filter(|n| query.min_quality.map_or(true, |q| n.quality >= q))
            .collect();
        let total = filtered.len();
        let page: Vec<&Node> =
            filtered.into_iter().skip(query.offset).take(limit).collect();

        Ok(json!({
            "total": total,
            "limit": limit,
            "offset": query.offset,
            "configurations": page,
        }))
    }

    /// `GetStatistics`.
    pub fn get_statistics(&self) -> Value {
        serde_json::to_value(self.stats.snapshot()).unwrap_or_else(|_| json!({}))
    }

    /// Node set published by the last successful run.
    pub fn published_nodes(&self) -> Arc<Vec<Node>> {
        self.published.load_full()
    }
}
