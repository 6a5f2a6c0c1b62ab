//! Fingerprint deduplication for one pipeline run.
//!
//! The hash set is authoritative. A bloom filter built from the previous
//! successful job can be consulted as a fast membership hint when refreshing
//! incrementally; false positives are tolerated by design of the structure,
//! so the hint never replaces the set lookup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::node::Node;
use crate::sources::{Source, Tier};

/// Result of offering one node to the deduper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accept {
    /// First sighting of this fingerprint.
    Inserted,
    /// Same fingerprint, and the new contributor outranks the incumbent;
    /// the displaced source is reported for statistics.
    Replaced { displaced_source_id: String },
    /// Same fingerprint, incumbent retained; the new contributor loses.
    Suppressed,
}

/// Ranking key for choosing which contributor's record survives.
#[derive(Debug, Clone)]
struct Claim {
    tier: Tier,
    weight: f64,
    seen_at: DateTime<Utc>,
    url: String,
}

impl Claim {
    fn from_source(source: &Source, seen_at: DateTime<Utc>) -> Self {
        Self { tier: source.tier, weight: source.weight, seen_at, url: source.url.clone() }
    }

    /// `(tier desc, weight desc, seen_at desc)`, ties by ascending url.
    fn outranks(&self, other: &Claim) -> bool {
        match self.tier.cmp(&other.tier) {
            Ordering::Greater => return true,
            Ordering::Less => return false,
            Ordering::Equal => {}
        }
        match self.weight.partial_cmp(&other.weight).unwrap_or(Ordering::Equal) {
            Ordering::Greater => return true,
            Ordering::Less => return false,
            Ordering::Equal => {}
        }
        match self.seen_at.cmp(&other.seen_at) {
            Ordering::Greater => return true,
            Ordering::Less => return false,
            Ordering::Equal => {}
        }
        self.url < other.url
    }
}

/// Job-scoped dedup set keyed by fingerprint.
pub struct Deduper {
    entries: HashMap<String, (Node, Claim)>,
    previous: Option<BloomFilter>,
}

impl Deduper {
    pub fn new(previous: Option<BloomFilter>) -> Self {
        Self { entries: HashMap::new(), previous }
    }

    /// Hint from the previous job's fingerprint set. May report false
    /// positives, never false negatives.
    pub fn seen_in_previous_job(&self, fingerprint: &str) -> bool {
        self.previous.as_ref().is_some_and(|b| b.contains(fingerprint))
    }

    pub fn accept(&mut self, node: Node, source: &Source) -> Accept {
        let claim = Claim::from_source(source, node.seen_at);
        let fingerprint = node.fingerprint.clone();

        match self.entries.get_mut(&fingerprint) {
            None => {
                self.entries.insert(fingerprint, (node, claim));
                Accept::Inserted
            }
            Some((incumbent, incumbent_claim)) => {
                // Whoever wins, the merged record saw this endpoint at the
                // latest of the two timestamps.
                let latest = incumbent.seen_at.max(node.seen_at);
                if claim.outranks(incumbent_claim) {
                    let displaced_source_id = incumbent.source_id.clone();
                    let mut node = node;
                    node.seen_at = latest;
                    *incumbent = node;
                    *incumbent_claim = claim;
                    Accept::Replaced { displaced_source_id }
                } else {
                    incumbent.seen_at = latest;
                    Accept::Suppressed
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drain the retained nodes (unordered; the writer sorts).
    pub fn into_nodes(self) -> Vec<Node> {
        self.entries.into_values().map(|(node, _)| node).collect()
    }

    /// Bloom filter over the retained fingerprints, for the next job.
    pub fn build_hint(&self) -> BloomFilter {
        let mut bloom = BloomFilter::with_capacity(self.entries.len().max(1024));
        for fingerprint in self.entries.keys() {
            bloom.insert(fingerprint);
        }
        bloom
    }
}

/// Double-hashed bloom filter sized for roughly 1 % false positives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u64>,
    hashes: u32,
}

impl BloomFilter {
    /// `capacity` is the expected element count; ~10 bits per element and
    /// 7 probes give ~1 % false positives.
    pub fn with_capacity(capacity: usize) -> Self {
        let bit_count = (capacity.max(64) * 10).next_power_of_two();
        Self { bits: vec![0u64; bit_count / 64], hashes: 7 }
    }

    pub fn insert(&mut self, key: &str) {
        let (h1, h2) = Self::hash_pair(key);
        let m = (self.bits.len() * 64) as u64;
        for i in 0..self.hashes as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % m;
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        let (h1, h2) = Self::hash_pair(key);
        let m = (self.bits.len() * 64) as u64;
        (0..self.hashes as u64).all(|i| {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % m;
            self.bits[(bit / 64) as usize] & (1 << (bit % 64)) != 0
        })
    }

    fn hash_pair(key: &str) -> (u64, u64) {
        let digest = Sha256::digest(key.as_bytes());
        let h1 = u64::from_be_bytes(digest[0..8].try_into().expect("8 bytes"));
        let h2 = u64::from_be_bytes(digest[8..16].try_into().expect("8 bytes")) | 1;
        (h1, h2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use crate::node::{Protocol, Security, TransportKind};

    fn node(fingerprint_seed: &str, source_id: &str, seen_at: DateTime<Utc>) -> Node {
        Node {
            protocol: Protocol::Vless,
            host: format!("{fingerprint_seed}.example"),
            port: 443,
            identity: "11111111-1111-4111-8111-111111111111".into(),
            transport: TransportKind::Tcp,
            security: Security::Tls,
            sni: None,
            path: None,
            params: IndexMap::new(),
            tag: None,
            source_id: source_id.into(),
            seen_at,
            quality: 0.0,
            fingerprint: String::new(),
        }
        .finalize()
    }

    fn source(id: &str, url: &str, tier: Tier, weight: f64) -> Source {
        Source {
            id: id.into(),
            url: url.into(),
            tier,
            weight,
            enabled: true,
            last_checked: None,
            success_count: 0,
            failure_count: 0,
            avg_response_ms: 0.0,
        }
    }

    #[test]
    fn first_sighting_inserts() {
        let mut deduper = Deduper::new(None);
        let s = source("a", "https://a.example", Tier::Bulk, 0.5);
        let outcome = deduper.accept(node("n1", "a", Utc::now()), &s);
        assert_eq!(outcome, Accept::Inserted);
        assert_eq!(deduper.len(), 1);
    }

    #[test]
    fn higher_tier_wins_and_displaces() {
        let mut deduper = Deduper::new(None);
        let t = Utc::now();
        let bulk = source("b", "https://b.example", Tier::Bulk, 0.5);
        let premium = source("p", "https://p.example", Tier::Premium, 1.0);

        assert_eq!(deduper.accept(node("n1", "b", t), &bulk), Accept::Inserted);
        let outcome = deduper.accept(node("n1", "p", t), &premium);
        assert_eq!(outcome, Accept::Replaced { displaced_source_id: "b".into() });

        let nodes = deduper.into_nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].source_id, "p");
    }

    #[test]
    fn lower_tier_is_suppressed() {
        let mut deduper = Deduper::new(None);
        let t = Utc::now();
        let bulk = source("b", "https://b.example", Tier::Bulk, 0.5);
        let premium = source("p", "https://p.example", Tier::Premium, 1.0);

        deduper.accept(node("n1", "p", t), &premium);
        assert_eq!(deduper.accept(node("n1", "b", t), &bulk), Accept::Suppressed);

        let nodes = deduper.into_nodes();
        assert_eq!(nodes[0].source_id, "p");
    }

    #[test]
    fn merged_record_keeps_latest_seen_at() {
        let mut deduper = Deduper::new(None);
        let early = Utc::now();
        let late = early + chrono::Duration::seconds(60);
        let premium = source("p", "https://p.example", Tier::Premium, 1.0);
        let bulk = source("b", "https://b.example", Tier::Bulk, 0.5);

        deduper.accept(node("n1", "p", early), &premium);
        deduper.accept(node("n1", "b", late), &bulk);

        let nodes = deduper.into_nodes();
        assert_eq!(nodes[0].source_id, "p");
        assert_eq!(nodes[0].seen_at, late);
    }

    #[test]
    fn equal_rank_ties_break_on_url() {
        let mut deduper = Deduper::new(None);
        let t = Utc::now();
        let a = source("a", "https://aaa.example", Tier::Bulk, 0.5);
        let z = source("z", "https://zzz.example", Tier::Bulk, 0.5);

        deduper.accept(node("n1", "z", t), &z);
        let outcome = deduper.accept(node("n1", "a", t), &a);
        assert_eq!(outcome, Accept::Replaced { displaced_source_id: "z".into() });
    }

    #[test]
    fn weight_breaks_tier_ties() {
        let mut deduper = Deduper::new(None);
        let t = Utc::now();
        let light = source("l", "https://l.example", Tier::Bulk, 0.3);
        let heavy = source("h", "https://h.example", Tier::Bulk, 0.9);

        deduper.accept(node("n1", "l", t), &light);
        assert!(matches!(
            deduper.accept(node("n1", "h", t), &heavy),
            Accept::Replaced { .. }
        ));
    }

    #[test]
    fn distinct_fingerprints_coexist() {
        let mut deduper = Deduper::new(None);
        let s = source("a", "https://a.example", Tier::Bulk, 0.5);
        deduper.accept(node("n1", "a", Utc::now()), &s);
        deduper.accept(node("n2", "a", Utc::now()), &s);
        assert_eq!(deduper.len(), 2);
    }

    #[test]
    fn bloom_hint_has_no_false_negatives() {
        let mut deduper = Deduper::new(None);
        let s = source("a", "https://a.example", Tier::Bulk, 0.5);
        for i in 0..500 {
            deduper.accept(node(&format!("n{i}"), "a", Utc::now()), &s);
        }
        let bloom = deduper.build_hint();

        let next = Deduper::new(Some(bloom));
        for i in 0..500 {
            let n = node(&format!("n{i}"), "a", Utc::now());
            assert!(next.seen_in_previous_job(&n.fingerprint));
        }
    }

    #[test]
    fn bloom_false_positive_rate_is_small() {
        let mut bloom = BloomFilter::with_capacity(1000);
        for i in 0..1000 {
            bloom.insert(&format!("member-{i}"));
        }
        let false_positives = (0..10_000)
            .filter(|i| bloom.contains(&format!("absent-{i}")))
            .count();
        // ~1% expected; allow generous slack
        assert!(false_positives < 500, "fp rate too high: {false_positives}");
    }
}
