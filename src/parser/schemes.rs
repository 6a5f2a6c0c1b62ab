//! Per-protocol URI decoders.
//!
//! Each decoder takes one trimmed line and returns a [`Node`] with the
//! identity fields populated; attribution (`source_id`, `seen_at`) and the
//! fingerprint are filled in by the feed parser. Decoders return a plain
//! string reason on failure so the caller can attach line context.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use std::net::IpAddr;
use std::str::FromStr;

use base64::engine::general_purpose::{STANDARD as B64, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;

use crate::node::{Node, Protocol, Security, TransportKind};

/// Decode Base64 accepting standard or URL-safe alphabets, padded or not.
pub(crate) fn decode_base64_loose(input: &str) -> Option<Vec<u8>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    B64.decode(trimmed)
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
        .or_else(|_| URL_SAFE.decode(trimmed))
        .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed))
        .ok()
}

fn percent_decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

/// Split `host:port` with IPv6 bracket support.
fn split_host_port(authority: &str) -> Result<(String, u16), String> {
    let (host, port_str) = if let Some(rest) = authority.strip_prefix('[') {
        let end = rest.find(']').ok_or("unterminated ipv6 literal")?;
        let host = &rest[..end];
        let port = rest[end + 1..].strip_prefix(':').ok_or("missing port")?;
        (host.to_string(), port)
    } else {
        let idx = authority.rfind(':').ok_or("missing port")?;
        (authority[..idx].to_string(), &authority[idx + 1..])
    };
    if host.is_empty() {
        return Err("empty host".into());
    }
    let port: u16 = port_str.parse().map_err(|_| format!("bad port `{port_str}`"))?;
    if port == 0 {
        return Err("port out of range".into());
    }
    Ok((host, port))
}

/// Reject loopback and RFC1918 literals when strict mode is on.
pub(crate) fn validate_host(host: &str, strict: bool) -> Result<(), String> {
    if host.is_empty() {
        return Err("empty host".into());
    }
    if !strict {
        return Ok(());
    }
    if let Ok(addr) = IpAddr::from_str(host) {
        let blocked = match addr {
            IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_unspecified(),
            IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
        };
        if blocked {
            return Err(format!("non-routable host literal `{host}`"));
        }
    }
    Ok(())
}

/// Parse `?k=v&...` preserving insertion order; values percent-decoded.
fn parse_query(query: &str) -> IndexMap<String, String> {
    let mut params = IndexMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        params.insert(key.to_string(), percent_decode(value));
    }
    params
}

/// Split a URI remainder into (before-query, params, tag).
fn split_query_fragment(rest: &str) -> (&str, IndexMap<String, String>, Option<String>) {
    let (rest, tag) = match rest.split_once('#') {
        Some((r, t)) if !t.is_empty() => (r, Some(percent_decode(t))),
        Some((r, _)) => (r, None),
        None => (rest, None),
    };
    match rest.split_once('?') {
        Some((head, query)) => (head, parse_query(query), tag),
        None => (rest, IndexMap::new(), tag),
    }
}

fn is_uuid(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    for (i, b) in bytes.iter().enumerate() {
        match i {
            8 | 13 | 18 | 23 => {
                if *b != b'-' {
                    return false;
                }
            }
            _ => {
                if !b.is_ascii_hexdigit() {
                    return false;
                }
            }
        }
    }
    true
}

fn blank_node(protocol: Protocol) -> Node {
    Node {
        protocol,
        host: String::new(),
        port: 0,
        identity: String::new(),
        transport: TransportKind::default(),
        security: Security::default(),
        sni: None,
        path: None,
        params: IndexMap::new(),
        tag: None,
        source_id: String::new(),
        seen_at: DateTime::<Utc>::MIN_UTC,
        quality: 0.0,
        fingerprint: String::new(),
    }
}

/// `vmess://<base64-json>`
pub(crate) fn parse_vmess(payload: &str) -> Result<Node, String> {
    #[derive(Deserialize)]
    struct VmessIn {
        #[serde(default)]
        add: String,
        #[serde(default)]
        port: serde_json::Value,
        #[serde(default)]
        id: String,
        #[serde(default)]
        aid: serde_json::Value,
        #[serde(default)]
        net: String,
        #[serde(default, rename = "type")]
        typ: String,
        #[serde(default)]
        host: String,
        #[serde(default)]
        path: String,
        #[serde(default)]
        tls: String,
        #[serde(default)]
        sni: String,
        #[serde(default)]
        scy: String,
        #[serde(default)]
        ps: String,
    }

    let raw = decode_base64_loose(payload).ok_or("vmess payload is not base64")?;
    let json = String::from_utf8(raw).map_err(|_| "vmess payload is not utf-8")?;
    let input: VmessIn =
        serde_json::from_str(&json).map_err(|e| format!("vmess json: {e}"))?;

    let port = match &input.port {
        serde_json::Value::Number(n) => {
            n.as_u64().ok_or("vmess port not an integer")?
        }
        serde_json::Value::String(s) => {
            s.parse::<u64>().map_err(|_| "vmess port not an integer")?
        }
        _ => return Err("vmess port missing".into()),
    };
    let port = u16::try_from(port).map_err(|_| "vmess port out of range")?;
    if port == 0 {
        return Err("vmess port out of range".into());
    }
    if input.id.is_empty() {
        return Err("vmess id missing".into());
    }

    let mut node = blank_node(Protocol::Vmess);
    node.host = input.add;
    node.port = port;
    node.identity = input.id;
    node.transport = TransportKind::from_str(&input.net).unwrap_or_default();
    node.security = match input.tls.as_str() {
        "tls" => Security::Tls,
        "reality" => Security::Reality,
        _ => Security::None,
    };
    if !input.sni.is_empty() {
        node.sni = Some(input.sni);
    }
    if !input.path.is_empty() {
        node.path = Some(input.path);
    }
    let aid = match &input.aid {
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.clone(),
        _ => "0".to_string(),
    };
    node.params.insert("aid".into(), aid);
    if !input.scy.is_empty() {
        node.params.insert("scy".into(), input.scy);
    }
    if !input.typ.is_empty() {
        node.params.insert("type".into(), input.typ);
    }
    if !input.host.is_empty() {
        node.params.insert("host".into(), input.host);
    }
    if !input.ps.is_empty() {
        node.tag = Some(input.ps);
    }
    Ok(node)
}

/// `vless://<uuid>@<host>:<port>?params#tag`
pub(crate) fn parse_vless(rest: &str) -> Result<Node, String> {
    let (head, params, tag) = split_query_fragment(rest);
    let (userinfo, authority) = head.split_once('@').ok_or("vless missing `@`")?;
    let uuid = percent_decode(userinfo);
    if !is_uuid(&uuid) {
        return Err(format!("vless id `{uuid}` is not a uuid"));
    }
    let (host, port) = split_host_port(authority)?;

    let mut node = blank_node(Protocol::Vless);
    node.host = host;
    node.port = port;
    node.identity = uuid;
    node.transport = params
        .get("type")
        .and_then(|t| TransportKind::from_str(t).ok())
        .unwrap_or_default();
    node.security = params
        .get("security")
        .and_then(|s| Security::from_str(s).ok())
        .unwrap_or_default();
    node.sni = params.get("sni").cloned();
    node.path = params.get("path").cloned();
    node.params = params;
    node.tag = tag;
    Ok(node)
}

/// `trojan://<password>@<host>:<port>?params#tag`
pub(crate) fn parse_trojan(rest: &str) -> Result<Node, String> {
    let (head, params, tag) = split_query_fragment(rest);
    let (userinfo, authority) = head.split_once('@').ok_or("trojan missing `@`")?;
    let password = percent_decode(userinfo);
    if password.is_empty() {
        return Err("trojan password missing".into());
    }
    let (host, port) = split_host_port(authority)?;

    let mut node = blank_node(Protocol::Trojan);
    node.host = host;
    node.port = port;
    node.identity = password;
    node.transport = params
        .get("type")
        .and_then(|t| TransportKind::from_str(t).ok())
        .unwrap_or_default();
    // Trojan is TLS unless the URI says otherwise.
    node.security = params
        .get("security")
        .and_then(|s| Security::from_str(s).ok())
        .unwrap_or(Security::Tls);
    node.sni = params.get("sni").cloned();
    node.path = params.get("path").cloned();
    node.params = params;
    node.tag = tag;
    Ok(node)
}

/// `ss://` in either the legacy base64-userinfo form or plain SIP002.
pub(crate) fn parse_ss(rest: &str) -> Result<Node, String> {
    let (head, params, tag) = split_query_fragment(rest);

    // A body without `@` is the fully wrapped legacy form:
    // base64(method:password@host:port)
    let expanded;
    let head = if head.contains('@') {
        head
    } else {
        let decoded = decode_base64_loose(head).ok_or("ss payload is not base64")?;
        expanded =
            String::from_utf8(decoded).map_err(|_| "ss payload is not utf-8")?;
        expanded.as_str()
    };

    let (userinfo, authority) = head.split_once('@').ok_or("ss missing `@`")?;
    let creds = match decode_base64_loose(userinfo) {
        Some(decoded) => {
            String::from_utf8(decoded).map_err(|_| "ss userinfo is not utf-8")?
        }
        None => percent_decode(userinfo),
    };
    let (method, password) =
        creds.split_once(':').ok_or("ss userinfo missing `method:password`")?;
    if method.is_empty() || password.is_empty() {
        return Err("ss method or password missing".into());
    }
    let (host, port) = split_host_port(authority)?;

    let mut node = blank_node(Protocol::Ss);
    node.host = host;
    node.port = port;
    node.identity = password.to_string();
    node.params.insert("method".into(), method.to_string());
    for (k, v) in params {
        node.params.insert(k, v);
    }
    node.tag = tag;
    Ok(node)
}

/// `ssr://<base64(host:port:proto:method:obfs:base64pass[/?params])>`
///
/// Strict subset: all six positional fields must parse; recognized query
/// params are `remarks`, `obfsparam`, `protoparam` (each base64).
pub(crate) fn parse_ssr(payload: &str) -> Result<Node, String> {
    let decoded = decode_base64_loose(payload).ok_or("ssr payload is not base64")?;
    let compound =
        String::from_utf8(decoded).map_err(|_| "ssr payload is not utf-8")?;

    let (main, query) = match compound.split_once("/?") {
        Some((m, q)) => (m, Some(q)),
        None => (compound.as_str(), None),
    };

    let mut fields = main.rsplitn(6, ':');
    let pass_b64 = fields.next().ok_or("ssr missing password")?;
    let obfs = fields.next().ok_or("ssr missing obfs")?;
    let method = fields.next().ok_or("ssr missing method")?;
    let proto = fields.next().ok_or("ssr missing protocol")?;
    let port_str = fields.next().ok_or("ssr missing port")?;
    let host = fields.next().ok_or("ssr missing host")?;
    if host.is_empty() || method.is_empty() {
        return Err("ssr host or method missing".into());
    }
    let port: u16 = port_str.parse().map_err(|_| "ssr bad port")?;
    if port == 0 {
        return Err("ssr port out of range".into());
    }
    let password = decode_base64_loose(pass_b64)
        .and_then(|b| String::from_utf8(b).ok())
        .ok_or("ssr password is not base64")?;

    let mut node = blank_node(Protocol::Ssr);
    node.host = host.to_string();
    node.port = port;
    node.identity = password;
    node.params.insert("protocol".into(), proto.to_string());
    node.params.insert("method".into(), method.to_string());
    node.params.insert("obfs".into(), obfs.to_string());
    if let Some(query) = query {
        for (key, value) in parse_query(query) {
            match key.as_str() {
                "remarks" => {
                    node.tag = decode_base64_loose(&value)
                        .and_then(|b| String::from_utf8(b).ok());
                }
                "obfsparam" | "protoparam" => {
                    if let Some(v) =
                        decode_base64_loose(&value).and_then(|b| String::from_utf8(b).ok())
                    {
                        node.params.insert(key, v);
                    }
                }
                _ => {}
            }
        }
    }
    Ok(node)
}

/// `hysteria2://<auth>@<host>:<port>?params#tag`
pub(crate) fn parse_hysteria2(rest: &str) -> Result<Node, String> {
    let (head, params, tag) = split_query_fragment(rest);
    let (userinfo, authority) = head.split_once('@').ok_or("hysteria2 missing `@`")?;
    let auth = percent_decode(userinfo);
    if auth.is_empty() {
        return Err("hysteria2 auth missing".into());
    }
    let (host, port) = split_host_port(authority)?;

    let mut node = blank_node(Protocol::Hysteria2);
    node.host = host;
    node.port = port;
    node.identity = auth;
    node.transport = TransportKind::Quic;
    node.security = Security::Tls;
    node.sni = params.get("sni").cloned();
    node.params = params;
    node.tag = tag;
    Ok(node)
}

/// `tuic://<uuid>:<password>@<host>:<port>?params#tag`
pub(crate) fn parse_tuic(rest: &str) -> Result<Node, String> {
    let (head, params, tag) = split_query_fragment(rest);
    let (userinfo, authority) = head.split_once('@').ok_or("tuic missing `@`")?;
    let creds = percent_decode(userinfo);
    let (uuid, password) = creds.split_once(':').ok_or("tuic missing `uuid:password`")?;
    if !is_uuid(uuid) {
        return Err(format!("tuic id `{uuid}` is not a uuid"));
    }
    let (host, port) = split_host_port(authority)?;

    let mut node = blank_node(Protocol::Tuic);
    node.host = host;
    node.port = port;
    node.identity = format!("{uuid}:{password}");
    node.transport = TransportKind::Quic;
    node.security = Security::Tls;
    node.sni = params.get("sni").cloned();
    node.params = params;
    node.tag = tag;
    Ok(node)
}

/// `wireguard://<private-key>@<host>:<port>?params#tag`
pub(crate) fn parse_wireguard(rest: &str) -> Result<Node, String> {
    let (head, params, tag) = split_query_fragment(rest);
    let (userinfo, authority) = head.split_once('@').ok_or("wireguard missing `@`")?;
    let key = percent_decode(userinfo);
    if key.is_empty() {
        return Err("wireguard private key missing".into());
    }
    let (host, port) = split_host_port(authority)?;

    let mut node = blank_node(Protocol::Wireguard);
    node.host = host;
    node.port = port;
    node.identity = key;
    node.params = params;
    node.tag = tag;
    Ok(node)
}
