//! Job lifecycle: submission queue, state machine, persistence.
//!
//! Jobs move `pending → running → (succeeded | failed | cancelled)` and
//! every transition is persisted to `jobs.json` so a restart sees the last
//! known state. Any job found `running` at startup crashed with the previous
//! process and is folded to `failed`.
//!
//! The actual pipeline work hides behind [`JobExecutor`] so the runner's
//! scheduling, cancellation and persistence are testable with a scripted
//! executor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{JobError, PipelineError};
use crate::output::OutputFormat;
use crate::sources::Tier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// What one pipeline run should do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Formats to emit; empty means all of them.
    #[serde(default)]
    pub formats: Vec<OutputFormat>,
    /// Override of the configured output directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    /// Tiers to pull; `None` means all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_tiers: Option<Vec<Tier>>,
    /// Drop nodes scoring below this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_quality: Option<f64>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self { formats: Vec::new(), output_dir: None, enabled_tiers: None, min_quality: None }
    }
}

/// Result digest stored on a finished job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Summary {
    pub sources_total: u64,
    pub sources_ok: u64,
    pub sources_failed: u64,
    pub nodes_seen: u64,
    pub nodes_unique: u64,
    pub duplicates_suppressed: u64,
    pub parse_errors: u64,
    pub artifacts: Vec<String>,
    /// Set when the run was cancelled and this is a partial digest; no
    /// artifacts were written.
    #[serde(default)]
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub config: JobConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<Summary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The work a job performs, injected by the caller.
#[async_trait]
pub trait JobExecutor: Send + Sync + 'static {
    async fn execute(
        &self,
        config: &JobConfig,
        progress: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<Summary, PipelineError>;
}

#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    pub max_concurrent: usize,
    pub wall_clock: Duration,
    pub history_cap: usize,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            wall_clock: Duration::from_secs(15 * 60),
            history_cap: 200,
        }
    }
}

struct Registry {
    jobs: IndexMap<String, Job>,
    cancels: std::collections::HashMap<String, CancellationToken>,
}

#[derive(Serialize, Deserialize, Default)]
struct JobsFile {
    jobs: Vec<Job>,
}

pub struct JobRunner {
    registry: Arc<Mutex<Registry>>,
    queue: mpsc::UnboundedSender<String>,
    path: PathBuf,
    config: JobRunnerConfig,
    shutdown: CancellationToken,
}

impl JobRunner {
    /// Load persisted jobs, fold crashed `running` entries to `failed`, and
    /// start the dispatch loop.
    pub fn start(
        executor: Arc<dyn JobExecutor>,
        jobs_path: impl Into<PathBuf>,
        config: JobRunnerConfig,
    ) -> Arc<Self> {
        let path = jobs_path.into();
        let mut jobs = load_jobs(&path);
        let mut recovered = 0;
        for job in jobs.values_mut() {
            if matches!(job.status, JobStatus::Running | JobStatus::Pending) {
                job.status = JobStatus::Failed;
                job.error = Some("crashed".to_string());
                job.finished_at = Some(Utc::now());
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::warn!(recovered, "marked interrupted jobs as failed");
        }

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let runner = Arc::new(Self {
            registry: Arc::new(Mutex::new(Registry {
                jobs,
                cancels: std::collections::HashMap::new(),
            })),
            queue: queue_tx,
            path,
            config,
            shutdown: CancellationToken::new(),
        });
        runner.persist();

        tokio::spawn(Self::dispatch_loop(runner.clone(), executor, queue_rx));
        runner
    }

    /// Queue a new pipeline job. FIFO; at most `max_concurrent` run at once.
    pub fn submit(&self, config: JobConfig) -> String {
        let job_id = uuid::Uuid::new_v4().to_string();
        let job = Job {
            job_id: job_id.clone(),
            status: JobStatus::Pending,
            progress: 0.0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            config,
            result_summary: None,
            error: None,
        };
        {
            let mut registry = self.lock();
            registry.jobs.insert(job_id.clone(), job);
            enforce_cap(&mut registry.jobs, self.config.history_cap);
        }
        self.persist();
        tracing::info!(%job_id, "job submitted");
        // The dispatcher only exits at shutdown; a send failure then is moot.
        let _ = self.queue.send(job_id.clone());
        job_id
    }

    pub fn status(&self, job_id: &str) -> Result<Job, JobError> {
        self.lock()
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    /// Cancel a pending or running job.
    pub fn cancel(&self, job_id: &str) -> Result<(), JobError> {
        let mut registry = self.lock();
        let job = registry
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        match job.status {
            JobStatus::Pending => {
                job.status = JobStatus::Cancelled;
                job.finished_at = Some(Utc::now());
                drop(registry);
                self.persist();
                Ok(())
            }
            JobStatus::Running => {
                if let Some(token) = registry.cancels.get(job_id) {
                    token.cancel();
                }
                Ok(())
            }
            _ => Err(JobError::Terminal(job_id.to_string())),
        }
    }

    /// Most-recent-first listing.
    pub fn list(&self, limit: usize, status: Option<JobStatus>) -> Vec<Job> {
        let registry = self.lock();
        registry
            .jobs
            .values()
            .rev()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn dispatch_loop(
        runner: Arc<Self>,
        executor: Arc<dyn JobExecutor>,
        mut queue: mpsc::UnboundedReceiver<String>,
    ) {
        let permits = Arc::new(Semaphore::new(runner.config.max_concurrent.max(1)));
        loop {
            let job_id = tokio::select! {
                id = queue.recv() => match id {
                    Some(id) => id,
                    None => break,
                },
                _ = runner.shutdown.cancelled() => break,
            };

            let permit = tokio::select! {
                p = permits.clone().acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = runner.shutdown.cancelled() => break,
            };

            let runner = runner.clone();
            let executor = executor.clone();
            tokio::spawn(async move {
                runner.run_one(executor, &job_id).await;
                drop(permit);
            });
        }
    }

    async fn run_one(&self, executor: Arc<dyn JobExecutor>, job_id: &str) {
        let cancel = CancellationToken::new();
        let config = {
            let mut registry = self.lock();
            let config = {
                let Some(job) = registry.jobs.get_mut(job_id) else { return };
                // Cancelled while still queued
                if job.status != JobStatus::Pending {
                    return;
                }
                job.status = JobStatus::Running;
                job.started_at = Some(Utc::now());
                job.config.clone()
            };
            registry.cancels.insert(job_id.to_string(), cancel.clone());
            config
        };
        self.persist();
        tracing::info!(%job_id, "job started");

        let registry_for_progress = self.registry.clone();
        let id_for_progress = job_id.to_string();
        let progress = move |value: f64| {
            let mut registry =
                registry_for_progress.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(job) = registry.jobs.get_mut(&id_for_progress) {
                job.progress = value.clamp(0.0, 1.0);
            }
        };

        let outcome = tokio::select! {
            result = executor.execute(&config, &progress, &cancel) => result,
            () = tokio::time::sleep(self.config.wall_clock) => {
                cancel.cancel();
                Err(PipelineError::Cancelled)
            }
        };

        let mut registry = self.lock();
        registry.cancels.remove(job_id);
        if let Some(job) = registry.jobs.get_mut(job_id) {
            job.finished_at = Some(Utc::now());
            match outcome {
                Ok(summary) if summary.cancelled => {
                    job.status = JobStatus::Cancelled;
                    job.result_summary = Some(summary);
                    tracing::info!(%job_id, "job cancelled");
                }
                Ok(summary) => {
                    job.status = JobStatus::Succeeded;
                    job.progress = 1.0;
                    job.result_summary = Some(summary);
                    tracing::info!(%job_id, "job succeeded");
                }
                Err(PipelineError::Cancelled) => {
                    job.status = JobStatus::Cancelled;
                    tracing::info!(%job_id, "job cancelled");
                }
                Err(e) => {
                    job.status = JobStatus::Failed;
                    job.error = Some(e.to_string());
                    tracing::error!(%job_id, error = %e, "job failed");
                }
            }
        }
        drop(registry);
        self.persist();
    }

    fn persist(&self) {
        let registry = self.lock();
        let file = JobsFile { jobs: registry.jobs.values().cloned().collect() };
        drop(registry);
        let json = match serde_json::to_vec_pretty(&file) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "jobs file serialization failed");
                return;
            }
        };
        let tmp = self.path.with_extension("json.tmp");
        let result = std::fs::write(&tmp, json).and_then(|_| std::fs::rename(&tmp, &self.path));
        if let Err(e) = result {
            tracing::error!(path = %self.path.display(), error = %e, "jobs file write failed");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn load_jobs(path: &PathBuf) -> IndexMap<String, Job> {
    match std::fs::read(path) {
        Ok(raw) => match serde_json::from_slice::<JobsFile>(&raw) {
            Ok(file) => file.jobs.into_iter().map(|j| (j.job_id.clone(), j)).collect(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "jobs file unreadable, starting empty");
                IndexMap::new()
            }
        },
        Err(_) => IndexMap::new(),
    }
}

/// Keep only the most recent `cap` entries (insertion order = creation order).
fn enforce_cap(jobs: &mut IndexMap<String, Job>, cap: usize) {
    while jobs.len() > cap {
        jobs.shift_remove_index(0);
    }
}
