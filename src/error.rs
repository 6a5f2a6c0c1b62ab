//! Error types, one enum per failure domain.
//!
//! Source-level failures (`FetchError`, parse errors) are recorded and never
//! abort a pipeline run; `PipelineError` covers the unrecoverable rest.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure fetching one subscription feed. Recorded per source.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {elapsed:?} (limit: {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },

    #[error("upstream returned HTTP {0}")]
    HttpStatus(u16),

    #[error("body exceeded {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("circuit open for host {host}")]
    CircuitOpen { host: String },

    #[error("fetch cancelled")]
    Cancelled,

    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl FetchError {
    /// Network and timeout failures are worth another attempt; everything
    /// else is terminal for the request.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network(_) | FetchError::Timeout { .. } => true,
            FetchError::HttpStatus(code) => {
                *code == 408 || *code == 429 || (500..600).contains(code)
            }
            _ => false,
        }
    }

    /// Outcome classification fed back into the admission layer.
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout { .. })
    }
}

/// Cache-tier failure. L2 failures degrade to misses; L3 failures are
/// surfaced because the disk tier is load-bearing for persistence.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache row codec: {0}")]
    Codec(String),

    #[error("remote tier unavailable: {0}")]
    RemoteUnavailable(String),
}

/// Source configuration problems, reported synchronously to the caller.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("sources config unreadable: {path}: {reason}")]
    ConfigUnreadable { path: PathBuf, reason: String },

    #[error("sources config malformed: {0}")]
    ConfigMalformed(String),

    #[error("invalid source url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid tier `{0}`")]
    InvalidTier(String),
}

/// Job registry failures.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(String),

    #[error("job {0} already terminal")]
    Terminal(String),

    #[error("job persistence: {0}")]
    Persistence(String),
}

/// Artifact emission failures. Any of these fails the job.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("output directory unwritable: {path}: {reason}")]
    DirUnwritable { path: PathBuf, reason: String },

    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("rendering {format}: {reason}")]
    Render { format: String, reason: String },
}

/// Unrecoverable pipeline failure; everything recoverable is recorded
/// per source instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Output(#[from] OutputError),

    #[error(transparent)]
    Sources(#[from] SourceError),

    #[error("disk cache tier failed: {0}")]
    Cache(#[from] CacheError),

    #[error("pipeline cancelled")]
    Cancelled,
}

/// Invalid runtime configuration (exit code 2 in the one-shot runner).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(FetchError::Network("reset".into()).is_retryable());
        assert!(FetchError::Timeout {
            elapsed: Duration::from_secs(30),
            timeout: Duration::from_secs(30)
        }
        .is_retryable());
        assert!(FetchError::HttpStatus(429).is_retryable());
        assert!(FetchError::HttpStatus(408).is_retryable());
        assert!(FetchError::HttpStatus(503).is_retryable());
        assert!(!FetchError::HttpStatus(404).is_retryable());
        assert!(!FetchError::HttpStatus(403).is_retryable());
        assert!(!FetchError::TooLarge { limit: 1 }.is_retryable());
        assert!(!FetchError::Cancelled.is_retryable());
        assert!(!FetchError::CircuitOpen { host: "h".into() }.is_retryable());
    }

    #[test]
    fn display_carries_detail() {
        let err = FetchError::HttpStatus(502);
        assert!(err.to_string().contains("502"));

        let err = OutputError::DirUnwritable {
            path: PathBuf::from("/out"),
            reason: "permission denied".into(),
        };
        assert!(err.to_string().contains("/out"));
    }
}
