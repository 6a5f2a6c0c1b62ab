//! Cancellation must leave previous artifacts untouched and no temp files.

mod common;

use common::{MapTransport, VLESS_LINE};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use subweave::admission::HostAdmission;
use subweave::cache::{CacheConfig, TieredCache};
use subweave::fetch::{FetchConfig, Fetcher};
use subweave::jobs::JobConfig;
use subweave::pipeline::{PipelineConfig, PipelineEngine};
use subweave::sleeper::VirtualSleeper;
use subweave::sources::SourceManager;
use subweave::stats::StatsRegistry;

const URL: &str = "https://a.example/feed.txt";

fn build_engine(
    work_dir: &std::path::Path,
    out_dir: &std::path::Path,
    transport: Arc<MapTransport>,
) -> PipelineEngine {
    let stats = StatsRegistry::new();
    let yaml = format!("sources:\n  premium:\n    - {URL}\n");
    let sources = Arc::new(SourceManager::load(yaml.as_bytes(), false).unwrap());
    let cache = Arc::new(TieredCache::new(
        CacheConfig::default(),
        work_dir.join("cache_l3.json"),
        None,
        stats.clone(),
    ));
    let fetcher = Fetcher::new(transport, HostAdmission::default(), FetchConfig::default())
        .with_sleeper(VirtualSleeper::new());
    PipelineEngine::new(
        sources,
        cache,
        fetcher,
        stats,
        PipelineConfig {
            workers: 1,
            output_dir: out_dir.to_path_buf(),
            data_dir: work_dir.join("data"),
            ..PipelineConfig::default()
        },
    )
}

fn tmp_files(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|x| x == "tmp"))
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn cancelled_run_leaves_previous_artifacts_intact() {
    let out = tempfile::tempdir().unwrap();

    // First run writes a full set of artifacts.
    let work1 = tempfile::tempdir().unwrap();
    let transport1 =
        Arc::new(MapTransport::new().ok(URL, &format!("{VLESS_LINE}\n")));
    let engine1 = build_engine(work1.path(), out.path(), transport1);
    let summary = engine1
        .run(&JobConfig::default(), &|_| {}, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.nodes_unique, 1);

    let report_path = out.path().join("vpn_report.json");
    let before = std::fs::read(&report_path).unwrap();

    // Second run (fresh cache, same output dir) is cancelled mid-fetch.
    let work2 = tempfile::tempdir().unwrap();
    let transport2 = Arc::new(
        MapTransport::new().ok(URL, "vless://22222222-2222-4222-8222-222222222222@198.51.100.9:443#other\n"),
    );
    let cancel = CancellationToken::new();
    transport2.cancel_on_nth_call(1, cancel.clone());
    let engine2 = build_engine(work2.path(), out.path(), transport2);

    let summary = engine2.run(&JobConfig::default(), &|_| {}, &cancel).await.unwrap();
    assert!(summary.cancelled);
    assert!(summary.artifacts.is_empty());

    // Previous report untouched, nothing half-written
    let after = std::fs::read(&report_path).unwrap();
    assert_eq!(before, after);
    assert!(tmp_files(out.path()).is_empty());
}

#[tokio::test]
async fn rewriting_the_same_nodes_is_idempotent() {
    let out = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let transport =
        Arc::new(MapTransport::new().ok(URL, &format!("{VLESS_LINE}\n")));
    let engine = build_engine(work.path(), out.path(), transport);

    // Two runs over the same (cached) body; timestamp-free artifacts must
    // come out byte-identical, and no temp files may remain.
    engine
        .run(&JobConfig::default(), &|_| {}, &CancellationToken::new())
        .await
        .unwrap();
    let raw_before = std::fs::read(out.path().join("vpn_subscription_raw.txt")).unwrap();
    let clash_before = std::fs::read(out.path().join("clash.yaml")).unwrap();

    engine
        .run(&JobConfig::default(), &|_| {}, &CancellationToken::new())
        .await
        .unwrap();
    let raw_after = std::fs::read(out.path().join("vpn_subscription_raw.txt")).unwrap();
    let clash_after = std::fs::read(out.path().join("clash.yaml")).unwrap();

    assert_eq!(raw_before, raw_after);
    assert_eq!(clash_before, clash_after);
    assert!(tmp_files(out.path()).is_empty());
}
