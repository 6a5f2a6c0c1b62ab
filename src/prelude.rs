//! Convenience re-exports for embedding the aggregator.
//!
//! ```
//! use subweave::prelude::*;
//! ```

pub use crate::api::{App, ListQuery};
pub use crate::config::AppConfig;
pub use crate::error::{FetchError, PipelineError};
pub use crate::jobs::{JobConfig, JobStatus, Summary};
pub use crate::node::{Node, Protocol, Security, TransportKind};
pub use crate::output::OutputFormat;
pub use crate::sources::Tier;
