//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use mesh_core::{MacAddress, NetConfig, TransportKind, TransportSet};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/meshnode/config.toml or /etc/meshnode/config.toml.
/// Env overrides: MESHNODE_NAME, MESHNODE_MAC, MESHNODE_RELATIONS, MESHNODE_CHECKSUM.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Node name announced in presentations (default: host name).
    #[serde(default = "default_name")]
    pub name: String,
    /// Primary address, `aa:bb:cc:dd:ee:ff`. Random if unset.
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub i2c_address: u8,
    #[serde(default)]
    pub can_address: u8,
    /// Append-only relation file.
    #[serde(default = "default_relations")]
    pub relations: PathBuf,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub network: NetConfig,
}

/// One simulated link: a UDP socket standing in for a radio or bus.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkConfig {
    /// Transport kind this link simulates, e.g. "espnow" or "lora".
    pub kind: String,
    pub bind: SocketAddr,
    /// Other nodes on the same simulated medium.
    #[serde(default)]
    pub remotes: Vec<SocketAddr>,
    /// Frame limit; the kind's default if unset.
    #[serde(default)]
    pub max_frame: Option<usize>,
}

/// A peer known up front. It is presented to by the first health check.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerConfig {
    pub name: String,
    pub mac: String,
    /// Transports the peer is reachable on; every local one if empty.
    #[serde(default)]
    pub transports: Vec<String>,
}

fn default_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "meshnode".into())
}
fn default_relations() -> PathBuf {
    PathBuf::from("/var/lib/meshnode/relations.bin")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            mac: None,
            i2c_address: 0,
            can_address: 0,
            relations: default_relations(),
            links: Vec::new(),
            peers: Vec::new(),
            network: NetConfig::default(),
        }
    }
}

impl Config {
    /// Configured MAC, or a fresh random one.
    pub fn mac(&self) -> Result<MacAddress> {
        match &self.mac {
            Some(s) => parse_mac(s),
            None => Ok(MacAddress::random()),
        }
    }
}

impl LinkConfig {
    pub fn kind(&self) -> Result<TransportKind> {
        self.kind.parse().map_err(anyhow::Error::msg)
    }
}

impl PeerConfig {
    pub fn mac(&self) -> Result<MacAddress> {
        parse_mac(&self.mac).with_context(|| format!("peer {}", self.name))
    }

    pub fn transports(&self) -> Result<TransportSet> {
        self.transports
            .iter()
            .map(|t| t.parse::<TransportKind>().map_err(anyhow::Error::msg))
            .collect()
    }
}

fn parse_mac(s: &str) -> Result<MacAddress> {
    s.parse().map_err(anyhow::Error::msg)
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("MESHNODE_NAME") {
        c.name = s;
    }
    if let Some(s) = var("MESHNODE_MAC") {
        c.mac = Some(s);
    }
    if let Some(s) = var("MESHNODE_RELATIONS") {
        c.relations = PathBuf::from(s);
    }
    if let Some(s) = var("MESHNODE_CHECKSUM") {
        match s.parse() {
            Ok(kind) => c.network.checksum = kind,
            Err(err) => tracing::warn!(%err, "ignoring MESHNODE_CHECKSUM"),
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/meshnode/config.toml"));
    }
    out.push(PathBuf::from("/etc/meshnode/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(err) => tracing::warn!(path = %p.display(), %err, "invalid config, using defaults"),
                },
                Err(err) => tracing::warn!(path = %p.display(), %err, "unreadable config"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
name = "gateway"
mac = "02:00:00:00:00:0a"
relations = "/tmp/relations.bin"

[[links]]
kind = "espnow"
bind = "127.0.0.1:47001"
remotes = ["127.0.0.1:47002"]

[[links]]
kind = "lora"
bind = "127.0.0.1:47101"
max_frame = 200

[[peers]]
name = "sensor"
mac = "02:00:00:00:00:0b"
transports = ["espnow"]

[network]
heartbeat_interval_ms = 1000
checksum = "fletcher16"
"#;

    #[test]
    fn parses_full_file() {
        let c: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(c.name, "gateway");
        assert_eq!(c.mac().unwrap(), MacAddress([2, 0, 0, 0, 0, 0x0a]));
        assert_eq!(c.links.len(), 2);
        assert_eq!(c.links[0].kind().unwrap(), TransportKind::EspNow);
        assert_eq!(c.links[1].max_frame, Some(200));
        assert_eq!(
            c.peers[0].transports().unwrap(),
            TransportSet::from(TransportKind::EspNow)
        );
        assert_eq!(c.network.heartbeat_interval_ms, 1_000);
        assert_eq!(c.network.checksum, mesh_core::ChecksumKind::Fletcher16);
        assert_eq!(c.network.max_relations, NetConfig::default().max_relations);
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(toml::from_str::<Config>("colour = \"blue\"").is_err());
        assert!(toml::from_str::<Config>("[network]\nspeed = 3").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let mut c: Config = toml::from_str(SAMPLE).unwrap();
        apply_env(&mut c, |key| match key {
            "MESHNODE_NAME" => Some("relay".into()),
            "MESHNODE_CHECKSUM" => Some("crc32".into()),
            _ => None,
        });
        assert_eq!(c.name, "relay");
        assert_eq!(c.network.checksum, mesh_core::ChecksumKind::Crc32);
        assert_eq!(c.relations, PathBuf::from("/tmp/relations.bin"));
    }

    #[test]
    fn bad_values_are_errors() {
        let c: Config = toml::from_str("mac = \"nope\"").unwrap();
        assert!(c.mac().is_err());
        let l = LinkConfig {
            kind: "carrier-pigeon".into(),
            bind: "127.0.0.1:1".parse().unwrap(),
            remotes: vec![],
            max_frame: None,
        };
        assert!(l.kind().is_err());
    }
}
