//! End-to-end pipeline behaviour over scripted feeds.

mod common;

use common::{engine, vmess_line, MapTransport, VLESS_LINE};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use subweave::jobs::JobConfig;
use subweave::output::OutputFormat;
use subweave::sources::MarkOutcome;

const URL_A: &str = "https://a.example/feed.txt";
const URL_B: &str = "https://b.example/feed.txt";
const URL_C: &str = "https://c.example/feed.txt";

fn two_source_yaml() -> String {
    format!(
        "sources:\n  premium:\n    - {URL_A}\n  bulk:\n    - {URL_B}\n"
    )
}

#[tokio::test]
async fn mixed_feeds_dedup_and_record_parse_errors() {
    // Source A: vmess + vless. Source B: the same vless + one malformed line.
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(
        MapTransport::new()
            .ok(URL_A, &format!("{}\n{}\n", vmess_line(), VLESS_LINE))
            .ok(URL_B, &format!("{}\nvless://not-a-uuid\n", VLESS_LINE)),
    );
    let env = engine(&dir, transport, &two_source_yaml(), 4);

    let summary = env
        .engine
        .run(&JobConfig::default(), &|_| {}, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.sources_total, 2);
    assert_eq!(summary.sources_ok, 2);
    assert_eq!(summary.nodes_seen, 3);
    assert_eq!(summary.nodes_unique, 2);
    assert_eq!(summary.duplicates_suppressed, 1);
    assert_eq!(summary.parse_errors, 1);

    let snapshot = env.stats.snapshot();
    assert_eq!(snapshot.nodes_unique, 2);
    assert_eq!(snapshot.duplicates_suppressed, 1);
    assert_eq!(snapshot.parse_errors, 1);

    let raw = std::fs::read_to_string(env.out_dir.join("vpn_subscription_raw.txt")).unwrap();
    assert_eq!(raw.lines().count(), 2);
}

#[tokio::test]
async fn base64_wrapped_feed_yields_identical_fingerprints() {
    use base64::engine::general_purpose::STANDARD as B64;
    use base64::Engine as _;

    let plain = format!("{}\n{}\n", vmess_line(), VLESS_LINE);

    // One engine sees the plain feed, the other the wrapped one.
    let dir_plain = tempfile::tempdir().unwrap();
    let plain_env = engine(
        &dir_plain,
        Arc::new(MapTransport::new().ok(URL_A, &plain)),
        &format!("sources:\n  premium:\n    - {URL_A}\n"),
        2,
    );
    let dir_wrapped = tempfile::tempdir().unwrap();
    let wrapped_env = engine(
        &dir_wrapped,
        Arc::new(MapTransport::new().ok(URL_A, &B64.encode(&plain))),
        &format!("sources:\n  premium:\n    - {URL_A}\n"),
        2,
    );

    let job = JobConfig::default();
    let cancel = CancellationToken::new();
    let a = plain_env.engine.run(&job, &|_| {}, &cancel).await.unwrap();
    let b = wrapped_env.engine.run(&job, &|_| {}, &cancel).await.unwrap();
    assert_eq!(a.nodes_unique, 2);
    assert_eq!(b.nodes_unique, 2);

    // Fingerprints (and thus the raw artifact) must match exactly
    let raw_a =
        std::fs::read(plain_env.out_dir.join("vpn_subscription_raw.txt")).unwrap();
    let raw_b =
        std::fs::read(wrapped_env.out_dir.join("vpn_subscription_raw.txt")).unwrap();
    assert_eq!(raw_a, raw_b);
}

#[tokio::test]
async fn duplicate_resolution_prefers_the_premium_source() {
    // Bulk tier listed first so the premium copy arrives second.
    let yaml = format!(
        "sources:\n  bulk:\n    - {URL_B}\n  premium:\n    - {URL_A}\n"
    );
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(
        MapTransport::new()
            .ok(URL_A, &format!("{VLESS_LINE}\n"))
            .ok(URL_B, &format!("{VLESS_LINE}\n")),
    );
    let env = engine(&dir, transport, &yaml, 1);

    // premium: 9 successes, 1 failure; bulk: 1 success
    let premium_id =
        env.sources.all().iter().find(|s| s.url == URL_A).unwrap().id.clone();
    let bulk_id = env.sources.all().iter().find(|s| s.url == URL_B).unwrap().id.clone();
    for _ in 0..9 {
        env.sources.mark_result(&premium_id, MarkOutcome::Success, 100);
    }
    env.sources.mark_result(&premium_id, MarkOutcome::Failure, 0);
    env.sources.mark_result(&bulk_id, MarkOutcome::Success, 100);

    let summary = env
        .engine
        .run(&JobConfig::default(), &|_| {}, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.nodes_unique, 1);
    assert_eq!(summary.duplicates_suppressed, 1);

    let report: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(env.out_dir.join("vpn_report.json")).unwrap(),
    )
    .unwrap();
    let node = &report["nodes"][0];
    assert_eq!(node["source_id"], premium_id.as_str());

    // Quality reflects the premium source: 0.40·0.9 reliability
    // + 0.15 protocol + 0.15 security + 0.15 transport (all max for this
    // vless/reality/grpc node) + 0.10·0.75 completeness + 0.05 tier bonus.
    let quality = node["quality"].as_f64().unwrap();
    assert!((quality - 0.935).abs() < 1e-9, "quality was {quality}");
}

#[tokio::test]
async fn one_failing_source_does_not_drop_the_others() {
    let yaml = format!(
        "sources:\n  premium:\n    - {URL_A}\n    - {URL_B}\n    - {URL_C}\n"
    );
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(
        MapTransport::new()
            .ok(URL_A, &format!("{VLESS_LINE}\n"))
            .network_error(URL_B, 3)
            .ok(URL_C, &format!("{}\n", vmess_line())),
    );
    let env = engine(&dir, transport, &yaml, 3);

    let summary = env
        .engine
        .run(&JobConfig::default(), &|_| {}, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.sources_total, 3);
    assert_eq!(summary.sources_ok, 2);
    assert_eq!(summary.sources_failed, 1);
    assert_eq!(summary.nodes_unique, 2, "healthy sources contribute fully");
}

#[tokio::test]
async fn artifacts_are_stable_across_worker_counts() {
    let feeds = [
        (URL_A, format!("{}\n{}\n", vmess_line(), VLESS_LINE)),
        (URL_B, format!("{VLESS_LINE}\n")),
        (
            URL_C,
            "trojan://pw@relay.example:443?sni=relay.example#FR-1\n".to_string(),
        ),
    ];
    let yaml = format!(
        "sources:\n  premium:\n    - {URL_A}\n  reliable:\n    - {URL_B}\n  bulk:\n    - {URL_C}\n"
    );

    let mut outputs = Vec::new();
    for workers in [1, 8] {
        let dir = tempfile::tempdir().unwrap();
        let transport = MapTransport::new();
        for (url, body) in &feeds {
            transport.push(
                url,
                Ok(subweave::fetch::RawResponse {
                    status: 200,
                    body: body.as_bytes().to_vec(),
                    retry_after: None,
                }),
            );
        }
        let env = engine(&dir, Arc::new(transport), &yaml, workers);
        let job = JobConfig {
            formats: vec![
                OutputFormat::Raw,
                OutputFormat::Base64,
                OutputFormat::Clash,
                OutputFormat::Singbox,
            ],
            ..JobConfig::default()
        };
        env.engine.run(&job, &|_| {}, &CancellationToken::new()).await.unwrap();

        let bundle: Vec<Vec<u8>> = [
            "vpn_subscription_raw.txt",
            "vpn_subscription_base64.txt",
            "clash.yaml",
            "vpn_singbox.json",
        ]
        .iter()
        .map(|name| std::fs::read(env.out_dir.join(name)).unwrap())
        .collect();
        outputs.push(bundle);
    }

    assert_eq!(outputs[0], outputs[1], "worker interleaving must not leak into artifacts");
}

#[tokio::test]
async fn progress_reaches_one() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(MapTransport::new().ok(URL_A, &format!("{VLESS_LINE}\n")));
    let env = engine(
        &dir,
        transport,
        &format!("sources:\n  premium:\n    - {URL_A}\n"),
        1,
    );

    let seen = std::sync::Mutex::new(Vec::new());
    let progress = |value: f64| seen.lock().unwrap().push(value);
    env.engine
        .run(&JobConfig::default(), &progress, &CancellationToken::new())
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert!(!seen.is_empty());
    assert!(seen.iter().all(|v| (0.0..=1.0).contains(v)));
    assert_eq!(*seen.last().unwrap(), 1.0);
}
