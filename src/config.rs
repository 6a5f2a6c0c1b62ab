//! Runtime configuration, CLI-parsed with environment overrides.

use clap::Parser;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::backoff::Backoff;
use crate::error::ConfigError;
use crate::fetch::FetchConfig;
use crate::jitter::Jitter;
use crate::jobs::JobRunnerConfig;
use crate::output::OutputFormat;
use crate::pipeline::{default_workers, PipelineConfig};

/// Aggregated settings for the pipeline and its collaborators. Every value
/// can come from a flag or the matching environment variable.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "subweave",
    version,
    about = "Aggregate proxy subscription feeds into deduplicated artifacts"
)]
pub struct AppConfig {
    /// Tiered sources YAML file.
    #[arg(long, default_value = "sources.yaml")]
    pub sources: PathBuf,

    /// Directory the artifacts are written to.
    #[arg(long, env = "OUTPUT_DIR", default_value = "output")]
    pub output_dir: PathBuf,

    /// Directory for jobs, cache rows and source state.
    #[arg(long, env = "DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Base URL of the optional remote cache tier.
    #[arg(long, env = "CACHE_L2_URL")]
    pub cache_l2_url: Option<String>,

    /// Fetch worker count; defaults to min(128, 4·cores).
    #[arg(long, env = "MAX_CONCURRENT")]
    pub max_concurrent: Option<usize>,

    /// Per-request fetch timeout.
    #[arg(long, env = "FETCH_TIMEOUT_MS", default_value_t = 30_000)]
    pub fetch_timeout_ms: u64,

    /// Hard cap on a decompressed feed body.
    #[arg(long, env = "BODY_MAX_BYTES", default_value_t = 20 * 1024 * 1024)]
    pub body_max_bytes: u64,

    /// Wall-clock budget for one pipeline job.
    #[arg(long, env = "JOB_WALL_CLOCK_MS", default_value_t = 900_000)]
    pub job_wall_clock_ms: u64,

    /// Treat source URLs differing only in query order as the same source.
    #[arg(long)]
    pub normalize_query: bool,

    /// Accept loopback/RFC1918 node hosts (useful against local fixtures).
    #[arg(long)]
    pub lenient_hosts: bool,

    /// Output formats to emit (repeatable); all formats when omitted.
    #[arg(long = "format", value_name = "FORMAT")]
    pub formats: Vec<String>,

    /// User-Agent for upstream fetches.
    #[arg(long, default_value = concat!("subweave/", env!("CARGO_PKG_VERSION")))]
    pub user_agent: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        // Parse from an empty command line: flag defaults + environment.
        Self::parse_from(["subweave"])
    }
}

impl AppConfig {
    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "fetch_timeout_ms",
                reason: "must be > 0".into(),
            });
        }
        if self.body_max_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "body_max_bytes",
                reason: "must be > 0".into(),
            });
        }
        if self.job_wall_clock_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "job_wall_clock_ms",
                reason: "must be > 0".into(),
            });
        }
        if self.max_concurrent == Some(0) {
            return Err(ConfigError::Invalid {
                field: "max_concurrent",
                reason: "must be > 0".into(),
            });
        }
        if let Some(url) = &self.cache_l2_url {
            url::Url::parse(url).map_err(|e| ConfigError::Invalid {
                field: "cache_l2_url",
                reason: e.to_string(),
            })?;
        }
        self.output_formats()?;
        Ok(())
    }

    /// Requested formats, or all of them when none are given.
    pub fn output_formats(&self) -> Result<Vec<OutputFormat>, ConfigError> {
        if self.formats.is_empty() {
            return Ok(OutputFormat::ALL.to_vec());
        }
        self.formats
            .iter()
            .map(|f| {
                OutputFormat::from_str(f)
                    .map_err(|reason| ConfigError::Invalid { field: "format", reason })
            })
            .collect()
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            timeout: Duration::from_millis(self.fetch_timeout_ms),
            max_body_bytes: self.body_max_bytes,
            max_attempts: 3,
            backoff: Backoff::new(Duration::from_millis(500)),
            jitter: Jitter::proportional(0.2),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            workers: self.max_concurrent.unwrap_or_else(default_workers),
            channel_capacity: 1_024,
            strict_hosts: !self.lenient_hosts,
            output_dir: self.output_dir.clone(),
            data_dir: self.data_dir.clone(),
        }
    }

    pub fn runner_config(&self) -> JobRunnerConfig {
        JobRunnerConfig {
            wall_clock: Duration::from_millis(self.job_wall_clock_ms),
            ..JobRunnerConfig::default()
        }
    }

    pub fn jobs_path(&self) -> PathBuf {
        self.data_dir.join("jobs.json")
    }

    pub fn cache_l3_path(&self) -> PathBuf {
        self.data_dir.join("cache_l3.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::parse_from(["subweave"]);
        config.validate().unwrap();
        assert_eq!(config.fetch_timeout_ms, 30_000);
        assert_eq!(config.body_max_bytes, 20 * 1024 * 1024);
        assert_eq!(config.output_formats().unwrap().len(), OutputFormat::ALL.len());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = AppConfig::parse_from(["subweave", "--fetch-timeout-ms", "0"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_format_is_rejected() {
        let config = AppConfig::parse_from(["subweave", "--format", "toml"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_formats_parse() {
        let config =
            AppConfig::parse_from(["subweave", "--format", "raw", "--format", "clash"]);
        let formats = config.output_formats().unwrap();
        assert_eq!(formats, vec![OutputFormat::Raw, OutputFormat::Clash]);
    }

    #[test]
    fn bad_l2_url_is_rejected() {
        let config = AppConfig::parse_from(["subweave", "--cache-l2-url", "not a url"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn worker_override_flows_into_pipeline_config() {
        let config = AppConfig::parse_from(["subweave", "--max-concurrent", "9"]);
        assert_eq!(config.pipeline_config().workers, 9);
    }
}
