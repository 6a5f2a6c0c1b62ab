//! Shared fixtures: a scripted per-URL transport and an engine builder.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use subweave::admission::HostAdmission;
use subweave::cache::{CacheConfig, TieredCache};
use subweave::fetch::{FetchConfig, Fetcher, RawResponse, Transport, TransportError};
use subweave::pipeline::{PipelineConfig, PipelineEngine};
use subweave::sleeper::VirtualSleeper;
use subweave::sources::SourceManager;
use subweave::stats::StatsRegistry;
use tokio_util::sync::CancellationToken;

/// Transport scripted per URL; each call pops the next response for that URL.
#[derive(Debug, Default)]
pub struct MapTransport {
    responses: Mutex<HashMap<String, VecDeque<Result<RawResponse, TransportError>>>>,
    pub calls: AtomicUsize,
    cancel_on_call: Mutex<Option<(usize, CancellationToken)>>,
}

impl MapTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ok(self, url: &str, body: &str) -> Self {
        self.push(url, Ok(RawResponse { status: 200, body: body.as_bytes().to_vec(), retry_after: None }));
        self
    }

    pub fn network_error(self, url: &str, times: usize) -> Self {
        for _ in 0..times {
            self.push(url, Err(TransportError::Network("connection reset".into())));
        }
        self
    }

    pub fn push(&self, url: &str, response: Result<RawResponse, TransportError>) {
        self.responses
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
    }

    /// Cancel the given token when call number `n` (1-based) arrives.
    pub fn cancel_on_nth_call(&self, n: usize, token: CancellationToken) {
        *self.cancel_on_call.lock().unwrap() = Some((n, token));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MapTransport {
    async fn get(
        &self,
        url: &str,
        _timeout: Duration,
        _max_bytes: u64,
    ) -> Result<RawResponse, TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((n, token)) = self.cancel_on_call.lock().unwrap().as_ref() {
            if call >= *n {
                token.cancel();
            }
        }
        self.responses
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| Err(TransportError::Network(format!("no script for {url}"))))
    }
}

pub struct TestEnv {
    pub engine: PipelineEngine,
    pub stats: StatsRegistry,
    pub sources: Arc<SourceManager>,
    pub out_dir: std::path::PathBuf,
}

/// Build an engine over a temp dir with an instant sleeper and the given
/// worker count.
pub fn engine(
    dir: &tempfile::TempDir,
    transport: Arc<MapTransport>,
    sources_yaml: &str,
    workers: usize,
) -> TestEnv {
    let stats = StatsRegistry::new();
    let sources = Arc::new(SourceManager::load(sources_yaml.as_bytes(), false).unwrap());
    let cache = Arc::new(TieredCache::new(
        CacheConfig::default(),
        dir.path().join("cache_l3.json"),
        None,
        stats.clone(),
    ));
    let fetcher = Fetcher::new(transport, HostAdmission::default(), FetchConfig::default())
        .with_sleeper(VirtualSleeper::new());
    let out_dir = dir.path().join("out");
    let engine = PipelineEngine::new(
        sources.clone(),
        cache,
        fetcher,
        stats.clone(),
        PipelineConfig {
            workers,
            output_dir: out_dir.clone(),
            data_dir: dir.path().join("data"),
            ..PipelineConfig::default()
        },
    );
    TestEnv { engine, stats, sources, out_dir }
}

pub const VLESS_LINE: &str = "vless://11111111-1111-4111-8111-111111111111@203.0.113.5:443?security=reality&type=grpc&sni=example.com#EU-1";

pub fn vmess_line() -> String {
    use base64::engine::general_purpose::STANDARD as B64;
    use base64::Engine as _;
    let json = r#"{"add":"198.51.100.7","port":"8443","id":"33333333-3333-4333-8333-333333333333","aid":"0","net":"ws","path":"/sub","tls":"tls","ps":"US-2"}"#;
    format!("vmess://{}", B64.encode(json))
}
