use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use quill_config::{NodeConfig, parse_peer_list};
use quill_crypto::{generate_keypair, public_key_from_secret, secret_key_from_hex, KeyMaterial};
use quill_node::Node;
use quill_rpc::RpcServer;

#[derive(Parser)]
#[command(name = "quill", version, about = "quill blockchain node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an example config file
    Init {
        #[arg(long, default_value = "config/quill.toml")]
        config: PathBuf,
    },
    /// Start a node
    Start {
        /// Optional config file; flags below override it
        #[arg(long)]
        config: Option<PathBuf>,
        /// P2P listen host
        #[arg(long)]
        host: Option<String>,
        /// P2P port
        #[arg(long)]
        port: Option<u16>,
        /// RPC listen host
        #[arg(long)]
        rpc_host: Option<String>,
        /// RPC port
        #[arg(long)]
        rpc_port: Option<u16>,
        /// Enable mining
        #[arg(long)]
        mine: bool,
        /// Bootstrap peers (host:port,...)
        #[arg(long, default_value = "")]
        peers: String,
        /// Private key file (hex); generated when absent
        #[arg(long)]
        keyfile: Option<PathBuf>,
        #[arg(long, default_value = "info")]
        log_level: String,
    },
}

fn main() -> Result<()> {
    match Cli::parse().command {
        Commands::Init { config } => init_config(config),
        Commands::Start {
            config,
            host,
            port,
            rpc_host,
            rpc_port,
            mine,
            peers,
            keyfile,
            log_level,
        } => {
            let mut cfg = match config {
                Some(path) => NodeConfig::load(&path)?,
                None => NodeConfig::example(),
            };
            if let Some(host) = host {
                cfg.p2p.host = host;
            }
            if let Some(port) = port {
                cfg.p2p.port = port;
            }
            if let Some(rpc_host) = rpc_host {
                cfg.rpc.host = rpc_host;
            }
            if let Some(rpc_port) = rpc_port {
                cfg.rpc.port = rpc_port;
            }
            if mine {
                cfg.mining.enabled = true;
            }
            if !peers.trim().is_empty() {
                cfg.bootstrap_peers = parse_peer_list(&peers)
                    .into_iter()
                    .map(|(host, port)| format!("{host}:{port}"))
                    .collect();
            }
            if let Some(keyfile) = keyfile {
                cfg.keyfile = Some(keyfile);
            }
            if log_level != "info" {
                cfg.log_filter = log_level;
            }

            init_logging(&cfg.log_filter);
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run_node(cfg))
        }
    }
}

fn init_config(path: PathBuf) -> Result<()> {
    if path.exists() {
        println!("Config already exists at {}", path.display());
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, NodeConfig::example().to_toml()?)?;
    println!("Wrote config to {}", path.display());
    Ok(())
}

fn init_logging(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Load a private key from file, or generate and save a new one.
fn load_or_generate_keypair(keyfile: Option<&Path>) -> Result<KeyMaterial> {
    if let Some(path) = keyfile {
        if path.exists() {
            let secret_key = secret_key_from_hex(&fs::read_to_string(path)?)?;
            return Ok(KeyMaterial {
                public_key: public_key_from_secret(&secret_key),
                secret_key,
            });
        }
    }
    let keypair = generate_keypair();
    if let Some(path) = keyfile {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, hex::encode(keypair.secret_key))?;
        println!("Generated keypair, saved to {}", path.display());
    }
    Ok(keypair)
}

async fn run_node(cfg: NodeConfig) -> Result<()> {
    let keypair = load_or_generate_keypair(cfg.keyfile.as_deref())?;

    println!("Public key: {}", hex::encode(keypair.public_key));
    println!("P2P: {}:{}", cfg.p2p.host, cfg.p2p.port);
    println!("RPC: {}:{}", cfg.rpc.host, cfg.rpc.port);
    println!(
        "Mining: {}",
        if cfg.mining.enabled { "enabled" } else { "disabled" }
    );
    if !cfg.bootstrap_peers.is_empty() {
        println!("Bootstrap peers: {}", cfg.bootstrap_peers.join(", "));
    }

    let rpc_host = cfg.rpc.host.clone();
    let rpc_port = cfg.rpc.port;
    let node = Arc::new(Node::new(keypair, cfg));
    node.start(None).await?;

    let rpc = RpcServer::new(Arc::clone(&node), rpc_host, rpc_port);
    rpc.start().await?;

    tokio::signal::ctrl_c().await?;
    rpc.stop().await;
    node.stop().await;
    Ok(())
}
