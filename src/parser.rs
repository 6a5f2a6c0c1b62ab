//! Subscription feed parser.
//!
//! Turns one fetched body into typed [`Node`]s. Feeds arrive either as plain
//! text (one URI per line) or as a Base64-wrapped blob of the same; the
//! wrapper is detected and removed before line classification. Unparseable
//! lines become [`ParseError`]s and never abort the feed.

use chrono::{DateTime, Utc};

use crate::node::Node;

pub mod schemes;

/// Options controlling validation strictness.
#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    /// Reject loopback/RFC1918 host literals.
    pub strict_hosts: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self { strict_hosts: true }
    }
}

/// One rejected line with its position in the (unwrapped) feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line_no: usize,
    pub reason: String,
}

/// Parse a feed body into nodes. Never fails; each bad line is reported.
pub fn parse_feed(
    body: &[u8],
    source_id: &str,
    seen_at: DateTime<Utc>,
    options: ParseOptions,
) -> (Vec<Node>, Vec<ParseError>) {
    // Normalize endings up front so line numbers stay honest under \r\n / \r.
    let text = unwrap_body(body).replace("\r\n", "\n").replace('\r', "\n");
    let mut nodes = Vec::new();
    let mut errors = Vec::new();

    for (idx, raw_line) in text.split('\n').enumerate() {
        let line = raw_line.trim_start_matches('\u{feff}').trim();
        if line.is_empty() {
            continue;
        }
        let line_no = idx + 1;
        match parse_line(line, options) {
            Ok(mut node) => {
                node.source_id = source_id.to_string();
                node.seen_at = seen_at;
                nodes.push(node.finalize());
            }
            Err(reason) => {
                tracing::debug!(source_id, line_no, %reason, "dropped line");
                errors.push(ParseError { line_no, reason });
            }
        }
    }

    (nodes, errors)
}

/// Classify one trimmed line by scheme and dispatch.
pub fn parse_line(line: &str, options: ParseOptions) -> Result<Node, String> {
    let (scheme, rest) = line.split_once("://").ok_or("no scheme")?;
    let node = match scheme {
        "vmess" => schemes::parse_vmess(rest)?,
        "vless" => schemes::parse_vless(rest)?,
        "trojan" => schemes::parse_trojan(rest)?,
        "ss" => schemes::parse_ss(rest)?,
        "ssr" => schemes::parse_ssr(rest)?,
        "hysteria2" | "hy2" => schemes::parse_hysteria2(rest)?,
        "tuic" => schemes::parse_tuic(rest)?,
        "wireguard" | "wg" => schemes::parse_wireguard(rest)?,
        other => return Err(format!("unknown scheme `{other}`")),
    };
    schemes::validate_host(&node.host, options.strict_hosts)?;
    Ok(node)
}

/// If the stripped body is Base64 of ASCII text, substitute the decoded
/// bytes; otherwise treat the body as UTF-8 (lossily).
fn unwrap_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let stripped: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if !stripped.is_empty() {
        if let Some(decoded) = schemes::decode_base64_loose(&stripped) {
            if decoded.is_ascii() && looks_like_feed(&decoded) {
                return String::from_utf8_lossy(&decoded).into_owned();
            }
        }
    }
    text.into_owned()
}

/// Cheap sanity check that a decoded blob is a URI list, not binary noise
/// that happened to be valid Base64.
fn looks_like_feed(decoded: &[u8]) -> bool {
    let text = match std::str::from_utf8(decoded) {
        Ok(t) => t,
        Err(_) => return false,
    };
    text.contains("://")
}
