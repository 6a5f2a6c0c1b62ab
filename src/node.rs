//! Typed proxy-node model: the dedupable unit of the whole pipeline.
//!
//! A [`Node`] is one decoded proxy endpoint. Identity for dedup purposes is
//! the SHA-256 fingerprint over `(protocol, host, port, identity, transport,
//! security, sni, path)`; everything else (params, tag, source attribution,
//! quality) rides along.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;

/// Characters escaped when a tag or param value is embedded in a URI.
const URI_COMPONENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'@');

/// Supported proxy protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vmess,
    Vless,
    Trojan,
    Ss,
    Ssr,
    Hysteria2,
    Tuic,
    Wireguard,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vmess => "vmess",
            Protocol::Vless => "vless",
            Protocol::Trojan => "trojan",
            Protocol::Ss => "ss",
            Protocol::Ssr => "ssr",
            Protocol::Hysteria2 => "hysteria2",
            Protocol::Tuic => "tuic",
            Protocol::Wireguard => "wireguard",
        }
    }
}

impl FromStr for Protocol {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vmess" => Ok(Protocol::Vmess),
            "vless" => Ok(Protocol::Vless),
            "trojan" => Ok(Protocol::Trojan),
            "ss" => Ok(Protocol::Ss),
            "ssr" => Ok(Protocol::Ssr),
            "hysteria2" => Ok(Protocol::Hysteria2),
            "tuic" => Ok(Protocol::Tuic),
            "wireguard" => Ok(Protocol::Wireguard),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stream transport carried inside the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Ws,
    Grpc,
    H2,
    Quic,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Ws => "ws",
            TransportKind::Grpc => "grpc",
            TransportKind::H2 => "h2",
            TransportKind::Quic => "quic",
        }
    }
}

impl FromStr for TransportKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(TransportKind::Tcp),
            "ws" => Ok(TransportKind::Ws),
            "grpc" => Ok(TransportKind::Grpc),
            "h2" | "http" => Ok(TransportKind::H2),
            "quic" => Ok(TransportKind::Quic),
            _ => Err(()),
        }
    }
}

/// Channel security layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    #[default]
    None,
    Tls,
    Reality,
}

impl Security {
    pub fn as_str(&self) -> &'static str {
        match self {
            Security::None => "none",
            Security::Tls => "tls",
            Security::Reality => "reality",
        }
    }
}

impl FromStr for Security {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "none" => Ok(Security::None),
            "tls" => Ok(Security::Tls),
            "reality" => Ok(Security::Reality),
            _ => Err(()),
        }
    }
}

/// One decoded proxy endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    /// UUID for vmess/vless/tuic, password for the rest.
    pub identity: String,
    pub transport: TransportKind,
    pub security: Security,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Protocol-specific parameters in insertion order.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub params: IndexMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub source_id: String,
    pub seen_at: DateTime<Utc>,
    pub quality: f64,
    pub fingerprint: String,
}

impl Node {
    /// Canonical dedup hash. Lowercased protocol, then the identity-bearing
    /// fields joined with `|` so `host:port` collisions across protocols or
    /// credentials stay distinct.
    pub fn compute_fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.protocol.as_str().as_bytes());
        hasher.update(self.host.as_bytes());
        hasher.update(b":");
        hasher.update(self.port.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(self.identity.as_bytes());
        hasher.update(b"|");
        hasher.update(self.transport.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(self.security.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(self.sni.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"|");
        hasher.update(self.path.as_deref().unwrap_or("").as_bytes());
        hex(&hasher.finalize())
    }

    /// Seal the fingerprint after all identity fields are set.
    pub fn finalize(mut self) -> Self {
        self.fingerprint = self.compute_fingerprint();
        self
    }

    /// Canonical URI for the `raw` artifact. Byte-stable: params are emitted
    /// in sorted order and the vmess JSON uses a fixed key sequence.
    pub fn canonical_uri(&self) -> String {
        match self.protocol {
            Protocol::Vmess => self.vmess_uri(),
            Protocol::Ss => self.ss_uri(),
            Protocol::Ssr => self.ssr_uri(),
            _ => self.query_form_uri(),
        }
    }

    fn vmess_uri(&self) -> String {
        // Key order is fixed by struct field order.
        #[derive(Serialize)]
        struct VmessOut<'a> {
            v: &'a str,
            ps: &'a str,
            add: &'a str,
            port: String,
            id: &'a str,
            aid: &'a str,
            scy: &'a str,
            net: &'a str,
            #[serde(rename = "type")]
            typ: &'a str,
            host: &'a str,
            path: &'a str,
            tls: &'a str,
            sni: &'a str,
        }

        let out = VmessOut {
            v: "2",
            ps: self.tag.as_deref().unwrap_or(""),
            add: &self.host,
            port: self.port.to_string(),
            id: &self.identity,
            aid: self.params.get("aid").map(String::as_str).unwrap_or("0"),
            scy: self.params.get("scy").map(String::as_str).unwrap_or("auto"),
            net: self.transport.as_str(),
            typ: self.params.get("type").map(String::as_str).unwrap_or("none"),
            host: self.params.get("host").map(String::as_str).unwrap_or(""),
            path: self.path.as_deref().unwrap_or(""),
            tls: match self.security {
                Security::Tls => "tls",
                Security::Reality => "reality",
                Security::None => "",
            },
            sni: self.sni.as_deref().unwrap_or(""),
        };
        let json = serde_json::to_string(&out).expect("vmess json never fails");
        format!("vmess://{}", B64.encode(json))
    }

    fn ss_uri(&self) -> String {
        let method = self.params.get("method").map(String::as_str).unwrap_or("");
        let userinfo = B64.encode(format!("{}:{}", method, self.identity));
        let mut uri = format!("ss://{}@{}:{}", userinfo, self.host, self.port);
        if let Some(tag) = &self.tag {
            uri.push('#');
            uri.push_str(&utf8_percent_encode(tag, URI_COMPONENT).to_string());
        }
        uri
    }

    fn ssr_uri(&self) -> String {
        let proto = self.params.get("protocol").map(String::as_str).unwrap_or("origin");
        let method = self.params.get("method").map(String::as_str).unwrap_or("");
        let obfs = self.params.get("obfs").map(String::as_str).unwrap_or("plain");
        let mut compound = format!(
            "{}:{}:{}:{}:{}:{}",
            self.host,
            self.port,
            proto,
            method,
            obfs,
            B64.encode(&self.identity)
        );
        let mut extras: BTreeMap<&str, String> = BTreeMap::new();
        for key in ["obfsparam", "protoparam"] {
            if let Some(value) = self.params.get(key) {
                extras.insert(key, B64.encode(value));
            }
        }
        if let Some(tag) = &self.tag {
            extras.insert("remarks", B64.encode(tag));
        }
        if !extras.is_empty() {
            let query: Vec<String> =
                extras.into_iter().map(|(k, v)| format!("{k}={v}")).collect();
            compound.push_str("/?");
            compound.push_str(&query.join("&"));
        }
        format!("ssr://{}", B64.encode(compound))
    }

    /// `scheme://identity@host:port?params#tag` with alphabetically sorted
    /// params, used by vless/trojan/hysteria2/tuic/wireguard.
    fn query_form_uri(&self) -> String {
        let mut uri = format!(
            "{}://{}@{}:{}",
            self.protocol.as_str(),
            utf8_percent_encode(&self.identity, URI_COMPONENT),
            self.host,
            self.port
        );
        let sorted: BTreeMap<&String, &String> = self.params.iter().collect();
        if !sorted.is_empty() {
            let query: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}={}", k, utf8_percent_encode(v, URI_COMPONENT)))
                .collect();
            uri.push('?');
            uri.push_str(&query.join("&"));
        }
        if let Some(tag) = &self.tag {
            uri.push('#');
            uri.push_str(&utf8_percent_encode(tag, URI_COMPONENT).to_string());
        }
        uri
    }
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// SHA-256 of arbitrary bytes as lowercase hex. Shared by cache keys and
/// source ids.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex(&hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_node() -> Node {
        Node {
            protocol: Protocol::Vless,
            host: "203.0.113.5".into(),
            port: 443,
            identity: "11111111-1111-4111-8111-111111111111".into(),
            transport: TransportKind::Grpc,
            security: Security::Reality,
            sni: Some("example.com".into()),
            path: None,
            params: IndexMap::from([
                ("security".to_string(), "reality".to_string()),
                ("type".to_string(), "grpc".to_string()),
                ("sni".to_string(), "example.com".to_string()),
            ]),
            tag: Some("EU-1".into()),
            source_id: "src".into(),
            seen_at: Utc::now(),
            quality: 0.0,
            fingerprint: String::new(),
        }
        .finalize()
    }

    #[test]
    fn fingerprint_is_stable_and_identity_sensitive() {
        let a = sample_node();
        let b = sample_node();
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.fingerprint.len(), 64);

        let mut c = sample_node();
        c.port = 444;
        let c = c.finalize();
        assert_ne!(a.fingerprint, c.fingerprint);
    }

    #[test]
    fn fingerprint_ignores_tag_and_source() {
        let a = sample_node();
        let mut b = sample_node();
        b.tag = Some("renamed".into());
        b.source_id = "other".into();
        let b = b.finalize();
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn query_form_uri_sorts_params() {
        let node = sample_node();
        let uri = node.canonical_uri();
        assert!(uri.starts_with(
            "vless://11111111-1111-4111-8111-111111111111@203.0.113.5:443?"
        ));
        let query = uri.split('?').nth(1).unwrap().split('#').next().unwrap();
        assert_eq!(query, "security=reality&sni=example.com&type=grpc");
        assert!(uri.ends_with("#EU-1"));
    }

    #[test]
    fn tag_is_percent_encoded() {
        let mut node = sample_node();
        node.tag = Some("EU 1 #fast".into());
        let uri = node.finalize().canonical_uri();
        assert!(uri.ends_with("#EU%201%20%23fast"));
    }

    #[test]
    fn vmess_uri_round_trips_fixed_key_order() {
        let mut node = sample_node();
        node.protocol = Protocol::Vmess;
        node.transport = TransportKind::Ws;
        node.security = Security::Tls;
        node.path = Some("/feed".into());
        node.params = IndexMap::from([("aid".to_string(), "0".to_string())]);
        let node = node.finalize();

        let uri = node.canonical_uri();
        let payload = uri.strip_prefix("vmess://").unwrap();
        let decoded = String::from_utf8(B64.decode(payload).unwrap()).unwrap();
        let keys: Vec<&str> = decoded
            .split('"')
            .skip(1)
            .step_by(4)
            .collect();
        assert_eq!(
            keys,
            vec![
                "v", "ps", "add", "port", "id", "aid", "scy", "net", "type", "host", "path",
                "tls", "sni"
            ]
        );
    }

    #[test]
    fn ss_uri_uses_legacy_base64_userinfo() {
        let mut node = sample_node();
        node.protocol = Protocol::Ss;
        node.identity = "secret".into();
        node.params = IndexMap::from([("method".to_string(), "aes-256-gcm".to_string())]);
        node.tag = Some("JP".into());
        let node = node.finalize();

        let uri = node.canonical_uri();
        let userinfo = uri.strip_prefix("ss://").unwrap().split('@').next().unwrap();
        assert_eq!(
            String::from_utf8(B64.decode(userinfo).unwrap()).unwrap(),
            "aes-256-gcm:secret"
        );
        assert!(uri.ends_with("@203.0.113.5:443#JP"));
    }
}
