use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use quill_chain::{Chain, ValidationError};
use quill_config::{parse_peer_addr, NodeConfig};
use quill_core::{Block, Hash, PubKey, Transaction};
use quill_crypto::KeyMaterial;
use quill_mempool::Mempool;
use quill_miner::{mine_block, Miner};
use quill_net::{BlockIngest, LocalNode, P2pServer};

/// Nonces ground between cooperative yields, so gossip arriving during
/// mining is processed promptly.
const MINING_CHUNK: u64 = 1000;

/// The chain and mempool behind one lock: every mutation is serialized, so
/// admissions always see a consistent chain snapshot and block application
/// is strictly linear.
#[derive(Debug, Default)]
pub struct NodeState {
    pub chain: Chain,
    pub mempool: Mempool,
}

impl NodeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a transaction to the mempool.
    pub fn accept_transaction(&mut self, tx: Transaction) -> Result<Hash, ValidationError> {
        let tx_hash = self.mempool.add(tx, &self.chain)?;
        info!("new tx {}...", short(&tx_hash));
        Ok(tx_hash)
    }

    /// Validate and append a block, then purge confirmed transactions and
    /// revalidate what remains pending.
    pub fn accept_block(
        &mut self,
        block: Block,
        current_time: Option<u64>,
    ) -> Result<BlockIngest, ValidationError> {
        let block_hash = block.block_hash();
        if self.chain.block_by_hash(&block_hash).is_some() {
            return Ok(BlockIngest::AlreadyKnown);
        }
        let expected_height = self.chain.height() + 1;
        if block.header.height as i64 != expected_height {
            debug!(
                "block height {} != expected {expected_height}",
                block.header.height
            );
            return Ok(BlockIngest::Stale);
        }

        let height = block.header.height;
        self.chain.add_block(block.clone(), current_time)?;
        self.mempool.remove_confirmed(&block);
        let dropped = self.mempool.revalidate(&self.chain);
        if !dropped.is_empty() {
            debug!("dropped {} stale mempool transactions", dropped.len());
        }
        info!("accepted block {}... height={height}", short(&block_hash));
        Ok(BlockIngest::Accepted)
    }
}

fn short(hash: &Hash) -> String {
    hex::encode(&hash[..8])
}

/// The gossip engine's view of the node: lookups and ingestion over the
/// shared state.
#[derive(Clone)]
pub struct StateHandle {
    state: Arc<Mutex<NodeState>>,
}

#[async_trait]
impl LocalNode for StateHandle {
    fn chain_height(&self) -> i64 {
        self.state.lock().chain.height()
    }

    fn genesis_hash(&self) -> Option<Hash> {
        self.state.lock().chain.genesis_hash()
    }

    fn has_block(&self, hash: &Hash) -> bool {
        self.state.lock().chain.block_by_hash(hash).is_some()
    }

    fn knows_transaction(&self, hash: &Hash) -> bool {
        let state = self.state.lock();
        state.mempool.contains(hash) || state.chain.contains_transaction(hash)
    }

    fn block_by_height(&self, height: u64) -> Option<Block> {
        self.state.lock().chain.block_by_height(height).cloned()
    }

    fn block_by_hash(&self, hash: &Hash) -> Option<Block> {
        self.state.lock().chain.block_by_hash(hash).cloned()
    }

    fn find_transaction(&self, hash: &Hash) -> Option<Transaction> {
        let state = self.state.lock();
        state
            .mempool
            .get_by_hash(hash)
            .or_else(|| state.chain.transaction_by_hash(hash))
            .cloned()
    }

    async fn accept_transaction(&self, tx: Transaction) -> Result<Hash, ValidationError> {
        self.state.lock().accept_transaction(tx)
    }

    async fn accept_block(&self, block: Block) -> Result<BlockIngest, ValidationError> {
        self.state.lock().accept_block(block, None)
    }
}

/// Orchestrates chain, mempool, miner, and the P2P engine. The RPC server
/// attaches from above (it lives higher in the crate graph).
pub struct Node {
    keypair: KeyMaterial,
    config: NodeConfig,
    state: Arc<Mutex<NodeState>>,
    p2p: Arc<P2pServer<StateHandle>>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    pub fn new(keypair: KeyMaterial, config: NodeConfig) -> Self {
        let state = Arc::new(Mutex::new(NodeState::new()));
        let handle = StateHandle {
            state: Arc::clone(&state),
        };
        let p2p = P2pServer::new(
            Arc::new(handle),
            config.p2p.host.clone(),
            config.p2p.port,
        );
        Self {
            keypair,
            config,
            state,
            p2p,
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn public_key(&self) -> &PubKey {
        &self.keypair.public_key
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<Mutex<NodeState>> {
        &self.state
    }

    pub fn p2p(&self) -> &Arc<P2pServer<StateHandle>> {
        &self.p2p
    }

    /// Initialize (or adopt) the genesis, start the P2P listener, dial the
    /// bootstrap peers, and spawn the background loops.
    pub async fn start(&self, genesis: Option<Block>) -> Result<()> {
        {
            let mut state = self.state.lock();
            match genesis {
                Some(block) => state.chain.install_genesis(block)?,
                None => {
                    state.chain.initialize_genesis(&self.keypair.public_key, None)?;
                }
            }
            info!("chain initialized, height={}", state.chain.height());
        }

        Arc::clone(&self.p2p).start().await?;

        for entry in &self.config.bootstrap_peers {
            let Some((host, port)) = parse_peer_addr(entry) else {
                warn!("ignoring malformed bootstrap peer {entry:?}");
                continue;
            };
            let p2p = Arc::clone(&self.p2p);
            tokio::spawn(async move {
                p2p.connect_to_peer(&host, port).await;
            });
        }

        self.running.store(true, Ordering::SeqCst);

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Arc::clone(&self.p2p).peer_exchange_loop()));
        if self.config.mining.enabled {
            tasks.push(self.spawn_mining_loop());
        }

        info!("node started");
        Ok(())
    }

    /// Stop background tasks and close every peer connection.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.p2p.stop().await;
        info!("node stopped");
    }

    /// Build a template, grind it cooperatively, and publish the result if
    /// the chain has not advanced under us.
    fn spawn_mining_loop(&self) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let p2p = Arc::clone(&self.p2p);
        let running = Arc::clone(&self.running);
        let miner = Miner::new(self.keypair.public_key);

        tokio::spawn(async move {
            info!("mining started");
            while running.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;

                let template = {
                    let state = state.lock();
                    miner.create_block_template(&state.chain, &state.mempool)
                };
                let Some(block) = grind(template, running.as_ref()).await else {
                    continue;
                };

                let outcome = {
                    let mut state = state.lock();
                    // the chain may have advanced while we were grinding
                    if block.header.height as i64 != state.chain.height() + 1 {
                        continue;
                    }
                    state.accept_block(block.clone(), None)
                };
                match outcome {
                    Ok(BlockIngest::Accepted) => {
                        let hash_hex = hex::encode(block.block_hash());
                        info!(
                            "mined block {}... height={}",
                            &hash_hex[..16],
                            block.header.height
                        );
                        p2p.broadcast_block(&hash_hex, block.header.height, None).await;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("mined block rejected: {e}"),
                }
            }
        })
    }
}

/// Grind in fixed nonce chunks, yielding to the scheduler between chunks so
/// I/O stays live; gives up when the shutdown flag drops.
async fn grind(mut block: Block, running: &AtomicBool) -> Option<Block> {
    loop {
        if !running.load(Ordering::SeqCst) {
            return None;
        }
        if mine_block(&mut block, MINING_CHUNK) {
            return Some(block);
        }
        tokio::task::yield_now().await;
    }
}
