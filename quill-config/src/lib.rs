use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use quill_core::{DEFAULT_P2P_PORT, DEFAULT_RPC_PORT};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub p2p: P2pConfig,
    pub rpc: RpcConfig,
    pub mining: MiningConfig,
    /// Bootstrap peers as `host:port` strings.
    pub bootstrap_peers: Vec<String>,
    pub keyfile: Option<PathBuf>,
    pub log_filter: String,
}

impl NodeConfig {
    /// Load from a TOML file, with `QUILL_`-prefixed environment overrides
    /// (e.g. `QUILL_P2P__PORT=9444`).
    pub fn load(path: &Path) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("QUILL").separator("__"));
        let cfg = builder.build()?;
        Ok(cfg.try_deserialize()?)
    }

    /// Render as pretty TOML (used by `quill init`).
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn example() -> Self {
        Self {
            p2p: P2pConfig {
                host: "0.0.0.0".into(),
                port: DEFAULT_P2P_PORT,
            },
            rpc: RpcConfig {
                host: "127.0.0.1".into(),
                port: DEFAULT_RPC_PORT,
            },
            mining: MiningConfig { enabled: false },
            bootstrap_peers: vec![],
            keyfile: None,
            log_filter: "info".into(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::example()
    }
}

/// Parse `host:port,host:port,...` into address pairs; malformed entries
/// are skipped.
pub fn parse_peer_list(text: &str) -> Vec<(String, u16)> {
    text.split(',')
        .filter_map(|entry| parse_peer_addr(entry.trim()))
        .collect()
}

pub fn parse_peer_addr(entry: &str) -> Option<(String, u16)> {
    let (host, port) = entry.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_roundtrips_through_toml() {
        let cfg = NodeConfig::example();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let restored: NodeConfig = toml::from_str(&text).unwrap();
        assert_eq!(restored.p2p.port, DEFAULT_P2P_PORT);
        assert_eq!(restored.rpc.port, DEFAULT_RPC_PORT);
        assert!(!restored.mining.enabled);
    }

    #[test]
    fn peer_lists_parse_and_skip_garbage() {
        let peers = parse_peer_list("10.0.0.1:9333, example.com:9444");
        assert_eq!(
            peers,
            vec![
                ("10.0.0.1".to_string(), 9333),
                ("example.com".to_string(), 9444),
            ]
        );
        assert!(parse_peer_list("").is_empty());
        assert!(parse_peer_list("no-port,:9333,host:notanumber").is_empty());
    }
}
