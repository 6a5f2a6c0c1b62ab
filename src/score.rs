//! Deterministic quality scoring from static node and source features.
//!
//! No I/O: the composite is a weighted sum of source reliability, protocol,
//! security, transport, field completeness and source tier. Equal composites
//! are ordered by fingerprint downstream, so the whole ranking is stable.

use crate::node::{Node, Protocol, Security, TransportKind};
use crate::sources::{Source, Tier};

const W_RELIABILITY: f64 = 0.40;
const W_PROTOCOL: f64 = 0.15;
const W_SECURITY: f64 = 0.15;
const W_TRANSPORT: f64 = 0.15;
const W_COMPLETENESS: f64 = 0.10;
const W_TIER: f64 = 0.05;

/// Composite quality in `[0, 1]`.
pub fn score(node: &Node, source: &Source) -> f64 {
    let q = W_RELIABILITY * source.reliability()
        + W_PROTOCOL * protocol_score(node.protocol)
        + W_SECURITY * security_score(node.security)
        + W_TRANSPORT * transport_score(node.transport)
        + W_COMPLETENESS * field_completeness(node)
        + W_TIER * tier_bonus(source.tier);
    q.clamp(0.0, 1.0)
}

fn protocol_score(protocol: Protocol) -> f64 {
    match protocol {
        Protocol::Vless => 1.0,
        Protocol::Vmess => 0.85,
        Protocol::Trojan => 0.85,
        Protocol::Hysteria2 => 0.9,
        Protocol::Tuic => 0.85,
        Protocol::Ss => 0.7,
        Protocol::Ssr => 0.4,
        Protocol::Wireguard => 0.9,
    }
}

fn security_score(security: Security) -> f64 {
    match security {
        Security::Reality => 1.0,
        Security::Tls => 0.8,
        Security::None => 0.2,
    }
}

fn transport_score(transport: TransportKind) -> f64 {
    match transport {
        TransportKind::Grpc => 1.0,
        TransportKind::H2 => 0.95,
        TransportKind::Ws => 0.85,
        TransportKind::Tcp => 0.7,
        TransportKind::Quic => 0.9,
    }
}

/// Fraction of {sni, path, tag, params} that are non-empty.
fn field_completeness(node: &Node) -> f64 {
    let present = [
        node.sni.as_deref().is_some_and(|s| !s.is_empty()),
        node.path.as_deref().is_some_and(|p| !p.is_empty()),
        node.tag.as_deref().is_some_and(|t| !t.is_empty()),
        !node.params.is_empty(),
    ]
    .iter()
    .filter(|p| **p)
    .count();
    present as f64 / 4.0
}

fn tier_bonus(tier: Tier) -> f64 {
    match tier {
        Tier::Premium => 1.0,
        Tier::Reliable => 0.75,
        Tier::Bulk => 0.5,
        Tier::Experimental => 0.25,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use indexmap::IndexMap;

    fn node(protocol: Protocol, security: Security, transport: TransportKind) -> Node {
        Node {
            protocol,
            host: "h.example".into(),
            port: 443,
            identity: "id".into(),
            transport,
            security,
            sni: None,
            path: None,
            params: IndexMap::new(),
            tag: None,
            source_id: "src".into(),
            seen_at: Utc::now(),
            quality: 0.0,
            fingerprint: String::new(),
        }
    }

    fn source(tier: Tier, success: u64, failure: u64) -> Source {
        Source {
            id: "src".into(),
            url: "https://h.example/feed".into(),
            tier,
            weight: tier.default_weight(),
            enabled: true,
            last_checked: None,
            success_count: success,
            failure_count: failure,
            avg_response_ms: 0.0,
        }
    }

    #[test]
    fn perfect_node_scores_one() {
        let mut n = node(Protocol::Vless, Security::Reality, TransportKind::Grpc);
        n.sni = Some("sni.example".into());
        n.path = Some("/".into());
        n.tag = Some("x".into());
        n.params.insert("k".into(), "v".into());
        let s = source(Tier::Premium, 10, 0);
        assert!((score(&n, &s) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn score_is_deterministic() {
        let n = node(Protocol::Vmess, Security::Tls, TransportKind::Ws);
        let s = source(Tier::Reliable, 9, 1);
        assert_eq!(score(&n, &s), score(&n, &s));
    }

    #[test]
    fn reliability_dominates() {
        let n = node(Protocol::Vless, Security::Reality, TransportKind::Grpc);
        let good = source(Tier::Bulk, 9, 1);
        let bad = source(Tier::Bulk, 1, 9);
        assert!(score(&n, &good) > score(&n, &bad));
        // 0.8 reliability delta * 0.40 weight
        assert!((score(&n, &good) - score(&n, &bad) - 0.32).abs() < 1e-9);
    }

    #[test]
    fn completeness_counts_fields() {
        let mut n = node(Protocol::Ss, Security::None, TransportKind::Tcp);
        let s = source(Tier::Experimental, 0, 0);
        let empty = score(&n, &s);

        n.sni = Some("x".into());
        n.tag = Some("y".into());
        let partial = score(&n, &s);
        assert!((partial - empty - 0.05).abs() < 1e-9); // 2/4 * 0.10
    }

    #[test]
    fn composite_stays_in_unit_interval() {
        let n = node(Protocol::Ssr, Security::None, TransportKind::Tcp);
        let s = source(Tier::Experimental, 0, 100);
        let q = score(&n, &s);
        assert!((0.0..=1.0).contains(&q));
    }
}
