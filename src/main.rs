//! One-shot pipeline runner.
//!
//! Exit codes: 0 success, 2 invalid configuration, 3 output directory
//! unwritable, 4 no sources produced any node, 130 cancelled.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use subweave::admission::HostAdmission;
use subweave::cache::{CacheConfig, HttpKv, RemoteKv, TieredCache};
use subweave::config::AppConfig;
use subweave::error::{OutputError, PipelineError, SourceError};
use subweave::fetch::{Fetcher, HttpTransport};
use subweave::jobs::JobConfig;
use subweave::pipeline::PipelineEngine;
use subweave::sources::SourceManager;
use subweave::stats::StatsRegistry;

const EXIT_INVALID_CONFIG: u8 = 2;
const EXIT_OUTPUT_UNWRITABLE: u8 = 3;
const EXIT_NO_NODES: u8 = 4;
const EXIT_CANCELLED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::parse();
    match run(config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "run failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AppConfig) -> anyhow::Result<ExitCode> {
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        return Ok(ExitCode::from(EXIT_INVALID_CONFIG));
    }
    let formats = config.output_formats()?;

    std::fs::create_dir_all(&config.data_dir)?;
    let raw = match std::fs::read(&config.sources) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::error!(path = %config.sources.display(), error = %e, "sources config unreadable");
            return Ok(ExitCode::from(EXIT_INVALID_CONFIG));
        }
    };
    let sources = match SourceManager::load(&raw, config.normalize_query) {
        Ok(sources) => Arc::new(sources),
        Err(e) => {
            tracing::error!(error = %e, "sources config invalid");
            return Ok(ExitCode::from(EXIT_INVALID_CONFIG));
        }
    };
    sources.restore_state(&config.data_dir.join("sources_state.json"));

    let stats = StatsRegistry::new();
    let remote = match &config.cache_l2_url {
        Some(base) => {
            let base = url::Url::parse(base)?;
            Some(Box::new(HttpKv::new(base)) as Box<dyn RemoteKv>)
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
    let fetcher = Fetcher::new(transport, HostAdmission::default(), config.fetch_config());
    let engine = PipelineEngine::new(
        sources,
        cache,
        fetcher,
        stats,
        config.pipeline_config(),
    );

    let cancel = CancellationToken::new();
    let ctrlc_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            ctrlc_token.cancel();
        }
    });

    let job = JobConfig { formats, ..JobConfig::default() };
    let progress = |value: f64| {
        tracing::debug!(progress = format!("{:.0}%", value * 100.0), "pipeline progress");
    };

    let wall_clock = Duration::from_millis(config.job_wall_clock_ms);
    let result = tokio::select! {
        result = engine.run(&job, &progress, &cancel) => result,
        () = tokio::time::sleep(wall_clock) => {
            cancel.cancel();
            Err(PipelineError::Cancelled)
        }
    };

    match result {
        Ok(summary) if summary.cancelled => {
            tracing::warn!("cancelled before completion");
            Ok(ExitCode::from(EXIT_CANCELLED))
        }
        Ok(summary) if summary.nodes_unique == 0 => {
            tracing::error!(
                sources_failed = summary.sources_failed,
                "no sources produced any node"
            );
            Ok(ExitCode::from(EXIT_NO_NODES))
        }
        Ok(summary) => {
            tracing::info!(
                nodes = summary.nodes_unique,
                suppressed = summary.duplicates_suppressed,
                artifacts = summary.artifacts.len(),
                "done"
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(PipelineError::Output(OutputError::DirUnwritable { path, reason })) => {
            tracing::error!(path = %path.display(), %reason, "output directory unwritable");
            Ok(ExitCode::from(EXIT_OUTPUT_UNWRITABLE))
        }
        Err(PipelineError::Cancelled) => Ok(ExitCode::from(EXIT_CANCELLED)),
        Err(PipelineError::Sources(e @ SourceError::ConfigUnreadable { .. })) => {
            tracing::error!(error = %e, "sources unavailable");
            Ok(ExitCode::from(EXIT_INVALID_CONFIG))
        }
        Err(e) => Err(e.into()),
    }
}
