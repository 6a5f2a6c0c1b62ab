#![forbid(unsafe_code)]

//! # subweave
//!
//! Subscription feed aggregator for proxy nodes: pulls hundreds of upstream
//! text/Base64 feeds, parses each line into a typed node record, dedups by
//! canonical fingerprint, scores quality, and emits deterministic artifacts
//! (raw URI list, Base64 bundle, JSON report, Clash YAML, sing-box JSON).
//!
//! ## Shape
//!
//! - **Admission** ([`admission`]): per-host token bucket + circuit breaker
//!   gating every outbound fetch.
//! - **Fetch** ([`fetch`]): retrying, size-capped, cancellable HTTP behind a
//!   [`fetch::Transport`] seam.
//! - **Parse** ([`parser`], [`node`]): Base64 unwrap, line classification,
//!   one typed [`node::Node`] per accepted line.
//! - **Dedup & score** ([`dedup`], [`score`]): fingerprint set with
//!   tier/weight/recency tie-breaking, deterministic composite quality.
//! - **Cache** ([`cache`]): L1 LRU, optional L2 remote KV, L3 disk rows,
//!   with single-flight coalescing of concurrent misses.
//! - **Pipeline** ([`pipeline`]): bounded fan-out workers and a single
//!   collector, driven per job by the [`jobs`] runner.
//! - **Output** ([`output`]): byte-stable artifacts written atomically.
//!
//! ## Quick start
//!
//! ```no_run
//! use subweave::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AppConfig::default();
//!     let app = App::bootstrap(&config)?;
//!     let ack = app.run_pipeline(JobConfig::default());
//!     println!("queued {}", ack["job_id"]);
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod api;
pub mod backoff;
pub mod cache;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fetch;
pub mod jitter;
pub mod jobs;
pub mod node;
pub mod output;
pub mod parser;
pub mod pipeline;
pub mod score;
pub mod sleeper;
pub mod sources;
pub mod stats;

// Re-exports
pub use admission::{Admission, BreakerConfig, BucketConfig, CircuitState, HostAdmission, Outcome};
pub use api::{error_shape, App, BootstrapError, ListQuery};
pub use backoff::Backoff;
pub use cache::{CacheConfig, CacheTier, LoadSource, TieredCache};
pub use clock::{Clock, ManualClock, MonotonicClock, WallClock};
pub use config::AppConfig;
pub use dedup::{Accept, BloomFilter, Deduper};
pub use error::{
    CacheError, ConfigError, FetchError, JobError, OutputError, PipelineError, SourceError,
};
pub use fetch::{
    FetchConfig, FetchSuccess, Fetcher, HttpTransport, RawResponse, Transport, TransportError,
};
pub use jitter::Jitter;
pub use jobs::{Job, JobConfig, JobExecutor, JobRunner, JobRunnerConfig, JobStatus, Summary};
pub use node::{Node, Protocol, Security, TransportKind};
pub use output::{Artifact, OutputFormat, OutputWriter};
pub use parser::{parse_feed, ParseError, ParseOptions};
pub use pipeline::{FetchStatus, PipelineConfig, PipelineEngine};
pub use score::score;
pub use sleeper::{Sleeper, TokioSleeper, VirtualSleeper};
pub use sources::{AddOutcome, MarkOutcome, Source, SourceManager, Tier};
pub use stats::{StatsRegistry, StatsSnapshot};

pub mod prelude;
