//! Pipeline engine: one full fetch → parse → dedup → score → write pass.
//!
//! A bounded set of workers pulls sources from a shared queue. Each worker
//! resolves the body through the cache (single-flight, fetch on miss), parses
//! it, and hands the typed nodes over a bounded channel to the single
//! dedup/score collector, so the hash set never sees contention. The channel
//! bound gives end-to-end back-pressure: a slow collector stalls fetchers.
//!
//! Source-level failures are recorded and never fail the run; only the
//! output writer, the source registry, and the bottom cache tier can.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::{fetch_key, TieredCache};
use crate::dedup::{Accept, BloomFilter, Deduper};
use crate::error::{CacheError, FetchError, PipelineError};
use crate::fetch::Fetcher;
use crate::jobs::{JobConfig, JobExecutor, Summary};
use crate::node::Node;
use crate::output::{OutputFormat, OutputWriter};
use crate::parser::{parse_feed, ParseOptions};
use crate::score::score;
use crate::sources::{MarkOutcome, Source, SourceManager};
use crate::stats::StatsRegistry;

/// Terminal classification of one source within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Ok,
    Empty,
    HttpError,
    Timeout,
    ParseError,
    Blocked,
}

impl FetchStatus {
    fn contributed(&self) -> bool {
        matches!(self, FetchStatus::Ok | FetchStatus::Empty)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers: usize,
    pub channel_capacity: usize,
    pub strict_hosts: bool,
    pub output_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            channel_capacity: 1_024,
            strict_hosts: true,
            output_dir: PathBuf::from("output"),
            data_dir: PathBuf::from("data"),
        }
    }
}

/// `min(128, 4·cores)`.
pub fn default_workers() -> usize {
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    (cores * 4).min(128)
}

enum SourceEvent {
    Done { source: Source, nodes: Vec<Node>, parse_errors: u64, status: FetchStatus },
    Fatal(CacheError),
}

pub struct PipelineEngine {
    sources: Arc<SourceManager>,
    cache: Arc<TieredCache>,
    fetcher: Fetcher,
    stats: StatsRegistry,
    config: PipelineConfig,
    published: Option<Arc<arc_swap::ArcSwap<Vec<Node>>>>,
}

impl PipelineEngine {
    pub fn new(
        sources: Arc<SourceManager>,
        cache: Arc<TieredCache>,
        fetcher: Fetcher,
        stats: StatsRegistry,
        config: PipelineConfig,
    ) -> Self {
        Self { sources, cache, fetcher, stats, config, published: None }
    }

    /// Publish each successful run's node set into the given slot (read by
    /// the control plane's configuration listing).
    pub fn with_published(mut self, slot: Arc<arc_swap::ArcSwap<Vec<Node>>>) -> Self {
        self.published = Some(slot);
        self
    }

    /// Drive one full pass. See the module docs for the shape.
    pub async fn run(
        &self,
        job: &JobConfig,
        progress: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<Summary, PipelineError> {
        let started_at = Utc::now();
        let out_dir =
            job.output_dir.clone().unwrap_or_else(|| self.config.output_dir.clone());
        let writer = OutputWriter::new(&out_dir);
        writer.ensure_writable()?;

        let queue: VecDeque<Source> = self
            .sources
            .all()
            .iter()
            .filter(|s| s.enabled)
            .filter(|s| {
                job.enabled_tiers.as_ref().map_or(true, |tiers| tiers.contains(&s.tier))
            })
            .cloned()
            .collect();
        let total = queue.len();
        tracing::info!(total, workers = self.config.workers, "pipeline started");

        self.stats.begin_job();
        let bloom = self.load_bloom_hint();
        let mut deduper = Deduper::new(bloom);

        let queue = Arc::new(Mutex::new(queue));
        let (tx, mut rx) = mpsc::channel::<SourceEvent>(self.config.channel_capacity.max(1));
        let worker_count = self.config.workers.clamp(1, total.max(1));
        for _ in 0..worker_count {
            let worker = WorkerContext {
                queue: queue.clone(),
                tx: tx.clone(),
                fetcher: self.fetcher.clone(),
                cache: self.cache.clone(),
                sources: self.sources.clone(),
                stats: self.stats.clone(),
                parse_options: ParseOptions { strict_hosts: self.config.strict_hosts },
                seen_at: started_at,
                cancel: cancel.clone(),
            };
            tokio::spawn(worker.run());
        }
        drop(tx);

        let mut summary = Summary { sources_total: total as u64, ..Summary::default() };
        let mut completed = 0usize;
        let mut fatal: Option<CacheError> = None;
        let mut ticker = tokio::time::interval(Duration::from_secs(2));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = ticker.tick() => {
                    progress(completed as f64 / total.max(1) as f64);
                    continue;
                }
            };

            match event {
                SourceEvent::Done { source, nodes, parse_errors, status } => {
                    completed += 1;
                    if status.contributed() {
                        summary.sources_ok += 1;
                        self.stats.record_source_ok();
                    } else {
                        summary.sources_failed += 1;
                        self.stats.record_source_failed();
                    }
                    summary.parse_errors += parse_errors;
                    self.stats.record_parse_errors(parse_errors);
                    summary.nodes_seen += nodes.len() as u64;
                    self.stats.record_nodes_seen(nodes.len() as u64);

                    for mut node in nodes {
                        node.quality = score(&node, &source);
                        match deduper.accept(node, &source) {
                            Accept::Inserted => self.stats.record_unique(),
                            Accept::Replaced { displaced_source_id } => {
                                summary.duplicates_suppressed += 1;
                                self.stats.record_duplicate(&displaced_source_id);
                            }
                            Accept::Suppressed => {
                                summary.duplicates_suppressed += 1;
                                self.stats.record_duplicate(&source.id);
                            }
                        }
                    }
                    progress(completed as f64 / total.max(1) as f64);
                }
                SourceEvent::Fatal(e) => {
                    // Stop the fan-out and drain what is already in flight.
                    cancel.cancel();
                    fatal = Some(e);
                }
            }
        }

        summary.nodes_unique = deduper.len() as u64;

        if let Some(e) = fatal {
            return Err(PipelineError::Cache(e));
        }
        if cancel.is_cancelled() {
            tracing::warn!(completed, total, "pipeline cancelled, no artifacts written");
            summary.cancelled = true;
            return Ok(summary);
        }

        let mut nodes = deduper.into_nodes();
        if let Some(min_quality) = job.min_quality {
            nodes.retain(|n| n.quality >= min_quality);
        }

        let formats: Vec<OutputFormat> = if job.formats.is_empty() {
            OutputFormat::ALL.to_vec()
        } else {
            job.formats.clone()
        };
        let artifacts = writer.write(&nodes, &formats, started_at)?;
        summary.artifacts =
            artifacts.iter().map(|a| a.path.display().to_string()).collect();

        self.save_bloom_hint(&nodes);
        if let Some(slot) = &self.published {
            slot.store(Arc::new(nodes));
        }
        self.sources.save_state(&self.config.data_dir.join("sources_state.json"))?;
        if let Err(e) = self.cache.compact() {
            tracing::warn!(error = %e, "cache compaction failed");
        }

        progress(1.0);
        tracing::info!(
            unique = summary.nodes_unique,
            suppressed = summary.duplicates_suppressed,
            failed = summary.sources_failed,
            "pipeline finished"
        );
        Ok(summary)
    }

    fn bloom_path(&self) -> PathBuf {
        self.config.data_dir.join("bloom.json")
    }

    fn load_bloom_hint(&self) -> Option<BloomFilter> {
        let raw = std::fs::read(self.bloom_path()).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    fn save_bloom_hint(&self, nodes: &[Node]) {
        let mut bloom = BloomFilter::with_capacity(nodes.len().max(1_024));
        for node in nodes {
            bloom.insert(&node.fingerprint);
        }
        if std::fs::create_dir_all(&self.config.data_dir).is_ok() {
            if let Ok(json) = serde_json::to_vec(&bloom) {
                if let Err(e) = std::fs::write(self.bloom_path(), json) {
                    tracing::warn!(error = %e, "bloom hint not persisted");
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl JobExecutor for PipelineEngine {
    async fn execute(
        &self,
        config: &JobConfig,
        progress: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<Summary, PipelineError> {
        self.run(config, progress, cancel).await
    }
}

struct WorkerContext {
    queue: Arc<Mutex<VecDeque<Source>>>,
    tx: mpsc::Sender<SourceEvent>,
    fetcher: Fetcher,
    cache: Arc<TieredCache>,
    sources: Arc<SourceManager>,
    stats: StatsRegistry,
    parse_options: ParseOptions,
    seen_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl WorkerContext {
    async fn run(self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let source = {
                let mut queue =
                    self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                queue.pop_front()
            };
            let Some(source) = source else { break };
            self.stats.record_source_attempt();
            let Some(event) = self.process(source).await else { continue };
            if self.tx.send(event).await.is_err() {
                break;
            }
        }
    }

    /// Resolve one source to nodes. Returns `None` when cancelled mid-way.
    async fn process(&self, source: Source) -> Option<SourceEvent> {
        let key = fetch_key(&source.url);
        let loaded = self
            .cache
            .get_or_fetch(&key, None, &self.cancel, || {
                let fetcher = self.fetcher.clone();
                let sources = self.sources.clone();
                let stats = self.stats.clone();
                let url = source.url.clone();
                let source_id = source.id.clone();
                let cancel = self.cancel.clone();
                async move {
                    match fetcher.fetch(&url, &cancel).await {
                        Ok(success) => {
                            sources.mark_result(
                                &source_id,
                                MarkOutcome::Success,
                                success.duration_ms,
                            );
                            stats.record_fetch_duration(success.duration_ms);
                            Ok(success.body)
                        }
                        Err(FetchError::Cancelled) => Err(FetchError::Cancelled),
                        Err(e) => {
                            tracing::warn!(url = %url, error = %e, "source fetch failed");
                            sources.mark_result(&source_id, MarkOutcome::Failure, 0);
                            Err(e)
                        }
                    }
                }
            })
            .await;

        match loaded {
            Ok((body, _)) => {
                if body.iter().all(|b| b.is_ascii_whitespace()) {
                    return Some(SourceEvent::Done {
                        source,
                        nodes: Vec::new(),
                        parse_errors: 0,
                        status: FetchStatus::Empty,
                    });
                }
                let (nodes, errors) =
                    parse_feed(&body, &source.id, self.seen_at, self.parse_options);
                let status = if nodes.is_empty() && !errors.is_empty() {
                    FetchStatus::ParseError
                } else {
                    FetchStatus::Ok
                };
                Some(SourceEvent::Done {
                    source,
                    nodes,
                    parse_errors: errors.len() as u64,
                    status,
                })
            }
            Err(shared) => {
                if let Some(e) = shared.0.downcast_ref::<CacheError>() {
                    return Some(SourceEvent::Fatal(CacheError::Codec(e.to_string())));
                }
                let status = match shared.0.downcast_ref::<FetchError>() {
                    Some(FetchError::Cancelled) => return None,
                    Some(FetchError::Timeout { .. }) => FetchStatus::Timeout,
                    Some(FetchError::CircuitOpen { .. }) => FetchStatus::Blocked,
                    _ => FetchStatus::HttpError,
                };
                Some(SourceEvent::Done {
                    source,
                    nodes: Vec::new(),
                    parse_errors: 0,
                    status,
                })
            }
        }
    }
}
