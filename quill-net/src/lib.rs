use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use quill_chain::ValidationError;
use quill_core::{
    parse_hash, Block, Hash, Transaction, HANDSHAKE_TIMEOUT, MAX_MESSAGE_SIZE, MAX_PEERS,
    PEER_EXCHANGE_INTERVAL, PROTOCOL_VERSION, SYNC_BATCH_SIZE,
};
use quill_proto::{decode_message, encode_message, Message, MessageType};

/// Outcome of handing a gossiped block to the local chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockIngest {
    /// Validated and appended to the chain.
    Accepted,
    /// The block hash is already present locally.
    AlreadyKnown,
    /// The height does not extend the current tip; ignored.
    Stale,
}

/// The seam through which the gossip engine reaches the local node. The
/// engine announces accepted gossip onward itself, so implementations only
/// ingest and answer lookups.
#[async_trait]
pub trait LocalNode: Send + Sync + 'static {
    fn chain_height(&self) -> i64;
    fn genesis_hash(&self) -> Option<Hash>;
    fn has_block(&self, hash: &Hash) -> bool;
    fn knows_transaction(&self, hash: &Hash) -> bool;
    fn block_by_height(&self, height: u64) -> Option<Block>;
    fn block_by_hash(&self, hash: &Hash) -> Option<Block>;
    /// Pending or confirmed transaction lookup.
    fn find_transaction(&self, hash: &Hash) -> Option<Transaction>;
    async fn accept_transaction(&self, tx: Transaction) -> Result<Hash, ValidationError>;
    async fn accept_block(&self, block: Block) -> Result<BlockIngest, ValidationError>;
}

#[derive(Debug, Clone)]
struct PeerMeta {
    version: Option<u32>,
    peer_height: i64,
    genesis_hash: Option<String>,
    handshake_done: bool,
}

impl Default for PeerMeta {
    fn default() -> Self {
        Self {
            version: None,
            peer_height: -1,
            genesis_hash: None,
            handshake_done: false,
        }
    }
}

/// One connected peer. Reads are owned by the peer task; writes are
/// serialized through an async mutex; close is idempotent.
pub struct Peer {
    id: u64,
    host: String,
    port: u16,
    inbound: bool,
    meta: Mutex<PeerMeta>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
}

impl Peer {
    fn new(id: u64, host: String, port: u16, inbound: bool, writer: OwnedWriteHalf) -> Self {
        Self {
            id,
            host,
            port,
            inbound,
            meta: Mutex::new(PeerMeta::default()),
            writer: tokio::sync::Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }

    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn version(&self) -> Option<u32> {
        self.meta.lock().version
    }

    pub fn peer_height(&self) -> i64 {
        self.meta.lock().peer_height
    }

    pub fn genesis_hash(&self) -> Option<String> {
        self.meta.lock().genesis_hash.clone()
    }

    pub fn handshake_done(&self) -> bool {
        self.meta.lock().handshake_done
    }

    /// Send a framed message; I/O errors close the connection.
    pub async fn send(&self, msg: &Message) {
        if self.is_closed() {
            return;
        }
        let frame = match encode_message(msg) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("refusing to send to {}:{}: {e}", self.host, self.port);
                return;
            }
        };
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(&frame).await {
            debug!("send error to {}:{}: {e}", self.host, self.port);
            drop(writer);
            self.close().await;
        }
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Read one framed message. Returns None on EOF, I/O error, oversize, or a
/// malformed frame; the caller drops the connection.
async fn read_frame(peer: &Peer, reader: &mut OwnedReadHalf) -> Option<Message> {
    let mut header = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut header).await {
        debug!("receive error from {}:{}: {e}", peer.host, peer.port);
        return None;
    }
    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_MESSAGE_SIZE {
        warn!(
            "message too large from {}:{}: {length}",
            peer.host, peer.port
        );
        return None;
    }
    let mut data = vec![0u8; length];
    if let Err(e) = reader.read_exact(&mut data).await {
        debug!("receive error from {}:{}: {e}", peer.host, peer.port);
        return None;
    }
    match decode_message(&data) {
        Ok(msg) => Some(msg),
        Err(e) => {
            debug!("malformed frame from {}:{}: {e}", peer.host, peer.port);
            None
        }
    }
}

/// Manages peer connections, gossip, and chain sync.
pub struct P2pServer<N: LocalNode> {
    node: Arc<N>,
    host: String,
    port: u16,
    peers: Mutex<HashMap<(String, u16), Arc<Peer>>>,
    known_addresses: Mutex<HashSet<(String, u16)>>,
    seen_tx_hashes: Mutex<HashSet<String>>,
    seen_block_hashes: Mutex<HashSet<String>>,
    syncing: AtomicBool,
    next_peer_id: AtomicU64,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<N: LocalNode> P2pServer<N> {
    pub fn new(node: Arc<N>, host: impl Into<String>, port: u16) -> Arc<Self> {
        Arc::new(Self {
            node,
            host: host.into(),
            port,
            peers: Mutex::new(HashMap::new()),
            known_addresses: Mutex::new(HashSet::new()),
            seen_tx_hashes: Mutex::new(HashSet::new()),
            seen_block_hashes: Mutex::new(HashSet::new()),
            syncing: AtomicBool::new(false),
            next_peer_id: AtomicU64::new(1),
            listener_task: Mutex::new(None),
            local_addr: Mutex::new(None),
        })
    }

    // -- Lifecycle --

    pub async fn start(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);
        info!("P2P server listening on {addr}");

        let server = Arc::clone(&self);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let server = Arc::clone(&server);
                        tokio::spawn(async move {
                            server.handle_inbound(stream, peer_addr).await;
                        });
                    }
                    Err(e) => {
                        debug!("accept error: {e}");
                        break;
                    }
                }
            }
        });
        *self.listener_task.lock() = Some(task);
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(task) = self.listener_task.lock().take() {
            task.abort();
        }
        let peers: Vec<Arc<Peer>> = self.peers.lock().drain().map(|(_, peer)| peer).collect();
        for peer in peers {
            peer.close().await;
        }
    }

    /// The bound listen address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    fn next_id(&self) -> u64 {
        self.next_peer_id.fetch_add(1, Ordering::SeqCst)
    }

    fn peer_list(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().values().cloned().collect()
    }

    // -- Connection management --

    pub async fn connect_to_peer(self: Arc<Self>, host: &str, port: u16) -> bool {
        if self.peers.lock().contains_key(&(host.to_string(), port)) {
            return true;
        }
        if self.peer_count() >= MAX_PEERS {
            return false;
        }
        let connect = TcpStream::connect((host, port));
        let stream = match timeout(Duration::from_secs(HANDSHAKE_TIMEOUT), connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("failed to connect to {host}:{port}: {e}");
                return false;
            }
            Err(_) => {
                debug!("connection to {host}:{port} timed out");
                return false;
            }
        };
        let (mut reader, writer) = stream.into_split();
        let peer = Arc::new(Peer::new(
            self.next_id(),
            host.to_string(),
            port,
            false,
            writer,
        ));
        if !self.perform_handshake(&peer, &mut reader).await {
            peer.close().await;
            return false;
        }
        self.peers.lock().insert(peer.address(), Arc::clone(&peer));
        info!("connected to peer {host}:{port}");
        tokio::spawn(async move {
            self.peer_loop(peer, reader).await;
        });
        true
    }

    async fn handle_inbound(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        if self.peer_count() >= MAX_PEERS {
            return;
        }
        let (mut reader, writer) = stream.into_split();
        let peer = Arc::new(Peer::new(
            self.next_id(),
            peer_addr.ip().to_string(),
            peer_addr.port(),
            true,
            writer,
        ));
        let receive = read_frame(&peer, &mut reader);
        let msg = match timeout(Duration::from_secs(HANDSHAKE_TIMEOUT), receive).await {
            Ok(Some(msg)) if msg.msg_type == MessageType::Handshake => msg,
            _ => {
                peer.close().await;
                return;
            }
        };
        self.record_handshake(&peer, &msg);
        self.send_handshake(&peer).await;
        peer.meta.lock().handshake_done = true;
        self.peers.lock().insert(peer.address(), Arc::clone(&peer));
        info!("inbound peer connected: {}:{}", peer.host, peer.port);
        self.peer_loop(peer, reader).await;
    }

    // -- Handshake --

    async fn perform_handshake(&self, peer: &Arc<Peer>, reader: &mut OwnedReadHalf) -> bool {
        self.send_handshake(peer).await;
        let receive = read_frame(peer, reader);
        let msg = match timeout(Duration::from_secs(HANDSHAKE_TIMEOUT), receive).await {
            Ok(Some(msg)) if msg.msg_type == MessageType::Handshake => msg,
            _ => return false,
        };
        self.record_handshake(peer, &msg);
        // a node that already has a genesis refuses peers on another one
        if let Some(genesis) = self.node.genesis_hash() {
            let ours = hex::encode(genesis);
            if peer.genesis_hash().as_deref() != Some(ours.as_str()) {
                warn!("genesis mismatch with {}:{}", peer.host, peer.port);
                return false;
            }
        }
        peer.meta.lock().handshake_done = true;
        true
    }

    async fn send_handshake(&self, peer: &Peer) {
        let genesis_hash = self
            .node
            .genesis_hash()
            .map(hex::encode)
            .unwrap_or_default();
        let msg = Message::handshake(PROTOCOL_VERSION, self.node.chain_height(), &genesis_hash);
        peer.send(&msg).await;
    }

    fn record_handshake(&self, peer: &Peer, msg: &Message) {
        let mut meta = peer.meta.lock();
        meta.version = msg
            .payload
            .get("version")
            .and_then(Value::as_u64)
            .map(|v| v as u32);
        meta.peer_height = msg
            .payload
            .get("height")
            .and_then(Value::as_i64)
            .unwrap_or(-1);
        meta.genesis_hash = msg
            .payload
            .get("genesis_hash")
            .and_then(Value::as_str)
            .map(str::to_string);
    }

    // -- Message loop --

    async fn peer_loop(self: Arc<Self>, peer: Arc<Peer>, mut reader: OwnedReadHalf) {
        // a freshly handshaken peer that is ahead triggers catch-up sync
        if peer.peer_height() > self.node.chain_height() {
            self.start_sync(&peer).await;
        }
        while !peer.is_closed() {
            let Some(msg) = read_frame(&peer, &mut reader).await else {
                break;
            };
            self.handle_message(&peer, msg).await;
        }
        self.peers.lock().remove(&peer.address());
        peer.close().await;
    }

    async fn handle_message(&self, peer: &Arc<Peer>, msg: Message) {
        match msg.msg_type {
            MessageType::Handshake => {}
            MessageType::PeersRequest => self.on_peers_request(peer).await,
            MessageType::PeersResponse => self.on_peers_response(&msg),
            MessageType::TxAnnounce => self.on_tx_announce(peer, &msg).await,
            MessageType::TxRequest => self.on_tx_request(peer, &msg).await,
            MessageType::TxResponse => self.on_tx_response(peer, &msg).await,
            MessageType::BlockAnnounce => self.on_block_announce(peer, &msg).await,
            MessageType::BlockRequest => self.on_block_request(peer, &msg).await,
            MessageType::BlockResponse => self.on_block_response(peer, &msg).await,
            MessageType::SyncRequest => self.on_sync_request(peer, &msg).await,
            MessageType::SyncResponse => self.on_sync_response(peer, &msg).await,
        }
    }

    // -- Peers --

    async fn on_peers_request(&self, peer: &Peer) {
        let addrs: Vec<(String, u16)> = self
            .peers
            .lock()
            .keys()
            .filter(|addr| **addr != peer.address())
            .cloned()
            .collect();
        peer.send(&Message::peers_response(&addrs)).await;
    }

    fn on_peers_response(&self, msg: &Message) {
        let Some(entries) = msg.payload.get("peers").and_then(Value::as_array) else {
            return;
        };
        let mut known = self.known_addresses.lock();
        for entry in entries {
            let host = entry.get("host").and_then(Value::as_str);
            let port = entry.get("port").and_then(Value::as_u64);
            if let (Some(host), Some(port)) = (host, port) {
                if port <= u16::MAX as u64 {
                    known.insert((host.to_string(), port as u16));
                }
            }
        }
    }

    // -- Transaction gossip --

    async fn on_tx_announce(&self, peer: &Peer, msg: &Message) {
        let Some(hash_hex) = msg.payload.get("tx_hash").and_then(Value::as_str) else {
            return;
        };
        if !self.seen_tx_hashes.lock().insert(hash_hex.to_string()) {
            return;
        }
        let Some(hash) = parse_hash(hash_hex) else {
            return;
        };
        if self.node.knows_transaction(&hash) {
            return;
        }
        peer.send(&Message::tx_request(hash_hex)).await;
    }

    async fn on_tx_request(&self, peer: &Peer, msg: &Message) {
        let tx = msg
            .payload
            .get("tx_hash")
            .and_then(Value::as_str)
            .and_then(parse_hash)
            .and_then(|hash| self.node.find_transaction(&hash));
        let value = tx.map(|tx| serde_json::to_value(&tx).unwrap());
        peer.send(&Message::tx_response(value)).await;
    }

    async fn on_tx_response(&self, peer: &Arc<Peer>, msg: &Message) {
        let Some(value) = msg.payload.get("transaction") else {
            return;
        };
        if value.is_null() {
            return;
        }
        let tx: Transaction = match serde_json::from_value(value.clone()) {
            Ok(tx) => tx,
            Err(e) => {
                debug!("undecodable tx from {}:{}: {e}", peer.host, peer.port);
                return;
            }
        };
        match self.node.accept_transaction(tx).await {
            Ok(hash) => {
                self.broadcast_tx(&hex::encode(hash), Some(peer.id())).await;
            }
            Err(e) => debug!("rejected tx from {}:{}: {e}", peer.host, peer.port),
        }
    }

    // -- Block gossip --

    async fn on_block_announce(&self, peer: &Arc<Peer>, msg: &Message) {
        let Some(hash_hex) = msg.payload.get("block_hash").and_then(Value::as_str) else {
            return;
        };
        let Some(height) = msg.payload.get("height").and_then(Value::as_i64) else {
            return;
        };
        if !self.seen_block_hashes.lock().insert(hash_hex.to_string()) {
            return;
        }
        let Some(hash) = parse_hash(hash_hex) else {
            return;
        };
        if self.node.has_block(&hash) {
            return;
        }
        let local_height = self.node.chain_height();
        if height == local_height + 1 {
            peer.send(&Message::block_request_by_hash(hash_hex)).await;
        } else if height > local_height + 1 {
            self.start_sync(peer).await;
        }
    }

    async fn on_block_request(&self, peer: &Peer, msg: &Message) {
        let block = if let Some(hash_hex) = msg.payload.get("block_hash").and_then(Value::as_str) {
            parse_hash(hash_hex).and_then(|hash| self.node.block_by_hash(&hash))
        } else if let Some(height) = msg.payload.get("height").and_then(Value::as_u64) {
            self.node.block_by_height(height)
        } else {
            None
        };
        let value = block.map(|block| serde_json::to_value(&block).unwrap());
        peer.send(&Message::block_response(value)).await;
    }

    async fn on_block_response(&self, peer: &Arc<Peer>, msg: &Message) {
        let Some(value) = msg.payload.get("block") else {
            return;
        };
        if value.is_null() {
            return;
        }
        let block: Block = match serde_json::from_value(value.clone()) {
            Ok(block) => block,
            Err(e) => {
                debug!("undecodable block from {}:{}: {e}", peer.host, peer.port);
                return;
            }
        };
        if let Err(e) = self.ingest_block(peer, block).await {
            warn!("rejected block from {}:{}: {e}", peer.host, peer.port);
        }
    }

    /// Hand a block to the node; on acceptance clear the sync gate and
    /// announce it to everyone but the source.
    async fn ingest_block(
        &self,
        peer: &Arc<Peer>,
        block: Block,
    ) -> Result<BlockIngest, ValidationError> {
        let hash_hex = hex::encode(block.block_hash());
        let height = block.header.height;
        let outcome = self.node.accept_block(block).await?;
        if outcome == BlockIngest::Accepted {
            self.syncing.store(false, Ordering::SeqCst);
            self.broadcast_block(&hash_hex, height, Some(peer.id())).await;
        }
        Ok(outcome)
    }

    // -- Sync --

    async fn on_sync_request(&self, peer: &Peer, msg: &Message) {
        let Some(start) = msg.payload.get("start_height").and_then(Value::as_u64) else {
            return;
        };
        let Some(end) = msg.payload.get("end_height").and_then(Value::as_u64) else {
            return;
        };
        let end = end.min(start + SYNC_BATCH_SIZE as u64 - 1);
        let mut blocks = Vec::new();
        for height in start..=end {
            match self.node.block_by_height(height) {
                Some(block) => blocks.push(serde_json::to_value(&block).unwrap()),
                None => break,
            }
        }
        peer.send(&Message::sync_response(blocks)).await;
    }

    async fn on_sync_response(&self, peer: &Arc<Peer>, msg: &Message) {
        let Some(entries) = msg.payload.get("blocks").and_then(Value::as_array) else {
            return;
        };
        let mut aborted = false;
        for value in entries {
            let block: Block = match serde_json::from_value(value.clone()) {
                Ok(block) => block,
                Err(e) => {
                    debug!("sync block undecodable: {e}");
                    aborted = true;
                    break;
                }
            };
            if let Err(e) = self.ingest_block(peer, block).await {
                debug!("sync block rejected: {e}");
                aborted = true;
                break;
            }
        }
        if aborted {
            self.syncing.store(false, Ordering::SeqCst);
            return;
        }
        // a full batch from a peer that is still ahead rolls the window
        if entries.len() == SYNC_BATCH_SIZE {
            let last_height = entries
                .last()
                .and_then(|b| b.get("header"))
                .and_then(|h| h.get("height"))
                .and_then(Value::as_i64);
            if let Some(last_height) = last_height {
                if last_height < peer.peer_height() {
                    let next = last_height as u64 + 1;
                    peer.send(&Message::sync_request(
                        next,
                        next + SYNC_BATCH_SIZE as u64 - 1,
                    ))
                    .await;
                    return;
                }
            }
        }
        self.syncing.store(false, Ordering::SeqCst);
    }

    async fn start_sync(&self, peer: &Peer) {
        if self.syncing.swap(true, Ordering::SeqCst) {
            return;
        }
        let start = (self.node.chain_height() + 1).max(0) as u64;
        let end = start + SYNC_BATCH_SIZE as u64 - 1;
        info!(
            "syncing from {}:{}, requesting blocks {start}-{end}",
            peer.host, peer.port
        );
        peer.send(&Message::sync_request(start, end)).await;
    }

    // -- Broadcasting --

    pub async fn broadcast_tx(&self, tx_hash_hex: &str, exclude: Option<u64>) {
        self.seen_tx_hashes.lock().insert(tx_hash_hex.to_string());
        let msg = Message::tx_announce(tx_hash_hex);
        for peer in self.peer_list() {
            if Some(peer.id()) != exclude && !peer.is_closed() {
                peer.send(&msg).await;
            }
        }
    }

    pub async fn broadcast_block(&self, block_hash_hex: &str, height: u64, exclude: Option<u64>) {
        self.seen_block_hashes
            .lock()
            .insert(block_hash_hex.to_string());
        let msg = Message::block_announce(block_hash_hex, height);
        for peer in self.peer_list() {
            if Some(peer.id()) != exclude && !peer.is_closed() {
                peer.send(&msg).await;
            }
        }
    }

    // -- Peer exchange background task --

    /// Every `PEER_EXCHANGE_INTERVAL` seconds, ask peers for their address
    /// books and dial anything new while below the peer cap.
    pub async fn peer_exchange_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(Duration::from_secs(PEER_EXCHANGE_INTERVAL)).await;
            for peer in self.peer_list() {
                if !peer.is_closed() {
                    peer.send(&Message::peers_request()).await;
                }
            }
            let addrs: Vec<(String, u16)> = self.known_addresses.lock().iter().cloned().collect();
            for (host, port) in addrs {
                let connected = self.peers.lock().contains_key(&(host.clone(), port));
                if !connected && self.peer_count() < MAX_PEERS {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.connect_to_peer(&host, port).await;
                    });
                }
            }
        }
    }
}
