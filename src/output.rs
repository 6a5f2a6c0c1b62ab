//! Artifact emission: raw URI list, Base64 bundle, JSON report, Clash YAML
//! and sing-box JSON.
//!
//! All formats share one node ordering (quality desc, fingerprint asc) and
//! one timestamp, so a fixed node set renders byte-identical files on every
//! run. Files are written `<name>.tmp` then renamed; a crash mid-write
//! leaves the previous artifact untouched.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;

use crate::error::OutputError;
use crate::node::{Node, Protocol, Security};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Raw,
    Base64,
    Json,
    Clash,
    Singbox,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 5] = [
        OutputFormat::Raw,
        OutputFormat::Base64,
        OutputFormat::Json,
        OutputFormat::Clash,
        OutputFormat::Singbox,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Raw => "raw",
            OutputFormat::Base64 => "base64",
            OutputFormat::Json => "json",
            OutputFormat::Clash => "clash",
            OutputFormat::Singbox => "singbox",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            OutputFormat::Raw => "vpn_subscription_raw.txt",
            OutputFormat::Base64 => "vpn_subscription_base64.txt",
            OutputFormat::Json => "vpn_report.json",
            OutputFormat::Clash => "clash.yaml",
            OutputFormat::Singbox => "vpn_singbox.json",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(OutputFormat::Raw),
            "base64" => Ok(OutputFormat::Base64),
            "json" => Ok(OutputFormat::Json),
            "clash" => Ok(OutputFormat::Clash),
            "singbox" => Ok(OutputFormat::Singbox),
            other => Err(format!("unknown output format `{other}`")),
        }
    }
}

/// One emitted file.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub format: OutputFormat,
    pub path: PathBuf,
    pub bytes: u64,
}

pub struct OutputWriter {
    out_dir: PathBuf,
}

impl OutputWriter {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self { out_dir: out_dir.into() }
    }

    /// Create the output directory and prove it accepts writes. Called at
    /// job start so an unwritable directory fails fast.
    pub fn ensure_writable(&self) -> Result<(), OutputError> {
        std::fs::create_dir_all(&self.out_dir).map_err(|e| OutputError::DirUnwritable {
            path: self.out_dir.clone(),
            reason: e.to_string(),
        })?;
        let probe = self.out_dir.join(".write_probe");
        std::fs::write(&probe, b"").map_err(|e| OutputError::DirUnwritable {
            path: self.out_dir.clone(),
            reason: e.to_string(),
        })?;
        let _ = std::fs::remove_file(&probe);
        Ok(())
    }

    /// Render and atomically write the requested formats.
    pub fn write(
        &self,
        nodes: &[Node],
        formats: &[OutputFormat],
        generated_at: DateTime<Utc>,
    ) -> Result<Vec<Artifact>, OutputError> {
        let ordered = rank(nodes);
        let mut artifacts = Vec::with_capacity(formats.len());
        for format in formats {
            let bytes = match format {
                OutputFormat::Raw => render_raw(&ordered).into_bytes(),
                OutputFormat::Base64 => B64.encode(render_raw(&ordered)).into_bytes(),
                OutputFormat::Json => render_report(&ordered, generated_at)?,
                OutputFormat::Clash => render_clash(&ordered)?,
                OutputFormat::Singbox => render_singbox(&ordered)?,
            };
            let path = self.out_dir.join(format.file_name());
            write_atomic(&path, &bytes)?;
            tracing::info!(format = format.as_str(), path = %path.display(), bytes = bytes.len(), "artifact written");
            artifacts.push(Artifact { format: *format, path, bytes: bytes.len() as u64 });
        }
        Ok(artifacts)
    }
}

/// Output order shared by every format: quality desc, fingerprint asc.
fn rank(nodes: &[Node]) -> Vec<&Node> {
    let mut ordered: Vec<&Node> = nodes.iter().collect();
    ordered.sort_by(|a, b| {
        b.quality
            .partial_cmp(&a.quality)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.fingerprint.cmp(&b.fingerprint))
    });
    ordered
}

fn render_raw(nodes: &[&Node]) -> String {
    let mut out = String::new();
    for node in nodes {
        out.push_str(&node.canonical_uri());
        out.push('\n');
    }
    out
}

fn render_report(
    nodes: &[&Node],
    generated_at: DateTime<Utc>,
) -> Result<Vec<u8>, OutputError> {
    let mut by_protocol: BTreeMap<&str, u64> = BTreeMap::new();
    for node in nodes {
        *by_protocol.entry(node.protocol.as_str()).or_default() += 1;
    }

    #[derive(Serialize)]
    struct Report<'a> {
        generated_at: DateTime<Utc>,
        total: usize,
        by_protocol: BTreeMap<&'a str, u64>,
        nodes: Vec<&'a Node>,
    }

    let report = Report {
        generated_at,
        total: nodes.len(),
        by_protocol,
        nodes: nodes.to_vec(),
    };
    // Through Value so every map in the report comes out key-sorted.
    let value = serde_json::to_value(&report)
        .map_err(|e| render_error(OutputFormat::Json, e))?;
    let mut bytes = serde_json::to_vec_pretty(&value)
        .map_err(|e| render_error(OutputFormat::Json, e))?;
    bytes.push(b'\n');
    Ok(bytes)
}

#[derive(Serialize)]
struct ClashProxy {
    name: String,
    #[serde(rename = "type")]
    kind: &'static str,
    server: String,
    port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cipher: Option<String>,
    #[serde(rename = "alterId", skip_serializing_if = "Option::is_none")]
    alter_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sni: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    network: Option<&'static str>,
    #[serde(rename = "ws-path", skip_serializing_if = "Option::is_none")]
    ws_path: Option<String>,
}

#[derive(Serialize)]
struct ClashGroup {
    name: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    url: &'static str,
    interval: u32,
    proxies: Vec<String>,
}

#[derive(Serialize)]
struct ClashDoc {
    proxies: Vec<ClashProxy>,
    #[serde(rename = "proxy-groups")]
    proxy_groups: Vec<ClashGroup>,
}

fn render_clash(nodes: &[&Node]) -> Result<Vec<u8>, OutputError> {
    let names = unique_names(nodes);
    let proxies: Vec<ClashProxy> = nodes
        .iter()
        .zip(names.iter())
        .map(|(node, name)| {
            let tls = match node.security {
                Security::None => None,
                _ => Some(true),
            };
            let network = match node.transport {
                crate::node::TransportKind::Tcp => None,
                t => Some(t.as_str()),
            };
            let mut proxy = ClashProxy {
                name: name.clone(),
                kind: clash_type(node.protocol),
                server: node.host.clone(),
                port: node.port,
                uuid: None,
                password: None,
                cipher: None,
                alter_id: None,
                tls,
                sni: node.sni.clone(),
                network,
                ws_path: node.path.clone(),
            };
            match node.protocol {
                Protocol::Vmess => {
                    proxy.uuid = Some(node.identity.clone());
                    proxy.alter_id =
                        node.params.get("aid").and_then(|a| a.parse().ok()).or(Some(0));
                    proxy.cipher = Some(
                        node.params.get("scy").cloned().unwrap_or_else(|| "auto".to_string()),
                    );
                }
                Protocol::Vless | Protocol::Tuic => {
                    proxy.uuid = Some(node.identity.clone());
                }
                Protocol::Ss | Protocol::Ssr => {
                    proxy.password = Some(node.identity.clone());
                    proxy.cipher = node.params.get("method").cloned();
                }
                Protocol::Trojan | Protocol::Hysteria2 | Protocol::Wireguard => {
                    proxy.password = Some(node.identity.clone());
                }
            }
            proxy
        })
        .collect();

    let doc = ClashDoc {
        proxies,
        proxy_groups: vec![ClashGroup {
            name: "auto-select",
            kind: "url-test",
            url: "http://www.gstatic.com/generate_204",
            interval: 300,
            proxies: names,
        }],
    };
    serde_yaml::to_string(&doc)
        .map(String::into_bytes)
        .map_err(|e| render_error(OutputFormat::Clash, e))
}

fn clash_type(protocol: Protocol) -> &'static str {
    match protocol {
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

fn render_singbox(nodes: &[&Node]) -> Result<Vec<u8>, OutputError> {
    let names = unique_names(nodes);
    let outbounds: Vec<serde_json::Value> = nodes
        .iter()
        .zip(names.iter())
        .map(|(node, name)| {
            let mut outbound = serde_json::Map::new();
            outbound.insert("type".into(), clash_type(node.protocol).into());
            outbound.insert("tag".into(), name.clone().into());
            outbound.insert("server".into(), node.host.clone().into());
            outbound.insert("server_port".into(), node.port.into());
            match node.protocol {
                Protocol::Vmess | Protocol::Vless | Protocol::Tuic => {
                    outbound.insert("uuid".into(), node.identity.clone().into());
                }
                Protocol::Ss | Protocol::Ssr => {
                    outbound.insert("password".into(), node.identity.clone().into());
                    if let Some(method) = node.params.get("method") {
                        outbound.insert("method".into(), method.clone().into());
                    }
                }
                Protocol::Trojan | Protocol::Hysteria2 | Protocol::Wireguard => {
                    outbound.insert("password".into(), node.identity.clone().into());
                }
            }
            if node.security != Security::None {
                let mut tls = serde_json::Map::new();
                tls.insert("enabled".into(), true.into());
                if let Some(sni) = &node.sni {
                    tls.insert("server_name".into(), sni.clone().into());
                }
                outbound.insert("tls".into(), tls.into());
            }
            serde_json::Value::Object(outbound)
        })
        .collect();

    let doc = serde_json::json!({ "outbounds": outbounds });
    let mut bytes =
        serde_json::to_vec_pretty(&doc).map_err(|e| render_error(OutputFormat::Singbox, e))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Proxy display names, deduplicated deterministically.
fn unique_names(nodes: &[&Node]) -> Vec<String> {
    let mut used: HashMap<String, u32> = HashMap::new();
    nodes
        .iter()
        .map(|node| {
            let base = node
                .tag
                .clone()
                .unwrap_or_else(|| format!("{}-{}:{}", node.protocol.as_str(), node.host, node.port));
            let n = used.entry(base.clone()).or_insert(0);
            *n += 1;
            if *n == 1 {
                base
            } else {
                format!("{base} #{n}")
            }
        })
        .collect()
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), OutputError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes)
        .map_err(|e| OutputError::Io { path: tmp.clone(), source: e })?;
    std::fs::rename(&tmp, path).map_err(|e| OutputError::Io { path: path.to_path_buf(), source: e })
}

fn render_error(format: OutputFormat, e: impl std::fmt::Display) -> OutputError {
    OutputError::Render { format: format.as_str().to_string(), reason: e.to_string() }
}
