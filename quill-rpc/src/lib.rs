use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use quill_core::{parse_hash, Hash, Transaction};
use quill_merkle::merkle_proof;
use quill_node::Node;

/// Requests that stall longer than this are answered with a timeout.
const REQUEST_TIMEOUT: u64 = 10;

enum RpcError {
    UnknownMethod,
    App(String),
}

fn app_err(e: impl std::fmt::Display) -> RpcError {
    RpcError::App(e.to_string())
}

/// JSON-RPC 2.0 endpoint over HTTP. Method dispatch lives here; transport
/// framing is axum's.
pub struct RpcServer {
    node: Arc<Node>,
    host: String,
    port: u16,
    handle: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl RpcServer {
    pub fn new(node: Arc<Node>, host: impl Into<String>, port: u16) -> Self {
        Self {
            node,
            host: host.into(),
            port,
            handle: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);
        info!("RPC server listening on {addr}");

        let app = router(Arc::clone(&self.node));
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                debug!("rpc server exited: {e}");
            }
        });
        *self.handle.lock() = Some(task);
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(task) = self.handle.lock().take() {
            task.abort();
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/", post(handle_rpc))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT)))
        .with_state(node)
}

async fn handle_rpc(State(node): State<Arc<Node>>, body: String) -> Json<Value> {
    let request: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(_) => return Json(error_body(Value::Null, -32700, "Parse error")),
    };
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let params = request.get("params").cloned().unwrap_or_else(|| json!({}));

    match dispatch(&node, &method, &params).await {
        Ok(result) => Json(json!({"jsonrpc": "2.0", "id": id, "result": result})),
        Err(RpcError::UnknownMethod) => {
            Json(error_body(id, -32601, &format!("Method not found: {method}")))
        }
        Err(RpcError::App(message)) => Json(error_body(id, -32000, &message)),
    }
}

fn error_body(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message},
    })
}

async fn dispatch(node: &Node, method: &str, params: &Value) -> Result<Value, RpcError> {
    match method {
        "submit_transaction" => submit_transaction(node, params).await,
        "get_block" => get_block(node, params),
        "get_transaction" => get_transaction(node, params),
        "get_account" => get_account(node, params),
        "get_latest_block" => get_latest_block(node),
        "get_mempool" => get_mempool(node),
        "get_merkle_proof" => get_merkle_proof(node, params),
        "get_node_info" => get_node_info(node),
        _ => Err(RpcError::UnknownMethod),
    }
}

fn hash_param(params: &Value, key: &str) -> Result<Hash, RpcError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .and_then(parse_hash)
        .ok_or_else(|| RpcError::App(format!("missing or invalid '{key}' parameter")))
}

async fn submit_transaction(node: &Node, params: &Value) -> Result<Value, RpcError> {
    let tx_value = params
        .get("transaction")
        .ok_or_else(|| RpcError::App("missing 'transaction' parameter".into()))?;
    let tx: Transaction = serde_json::from_value(tx_value.clone())
        .map_err(|e| RpcError::App(format!("invalid transaction: {e}")))?;
    let tx_hash = node.state().lock().accept_transaction(tx).map_err(app_err)?;
    let tx_hash_hex = hex::encode(tx_hash);
    node.p2p().broadcast_tx(&tx_hash_hex, None).await;
    Ok(json!({"tx_hash": tx_hash_hex}))
}

fn get_block(node: &Node, params: &Value) -> Result<Value, RpcError> {
    let state = node.state().lock();
    let block = if let Some(height) = params.get("height").and_then(Value::as_u64) {
        state.chain.block_by_height(height)
    } else if params.get("hash").is_some() {
        let hash = hash_param(params, "hash")?;
        state.chain.block_by_hash(&hash)
    } else {
        return Err(RpcError::App("must specify 'height' or 'hash'".into()));
    };
    let block = block.ok_or_else(|| RpcError::App("block not found".into()))?;
    Ok(serde_json::to_value(block).unwrap())
}

fn get_transaction(node: &Node, params: &Value) -> Result<Value, RpcError> {
    let tx_hash = hash_param(params, "tx_hash")?;
    let state = node.state().lock();
    let tx = state
        .chain
        .transaction_by_hash(&tx_hash)
        .or_else(|| state.mempool.get_by_hash(&tx_hash))
        .ok_or_else(|| RpcError::App("transaction not found".into()))?;
    Ok(serde_json::to_value(tx).unwrap())
}

fn get_account(node: &Node, params: &Value) -> Result<Value, RpcError> {
    let pubkey = hash_param(params, "pubkey")?;
    let state = node.state().lock();
    let account = state.chain.state().get_account(&pubkey);
    let (balance, nonce) = account.map(|a| (a.balance, a.nonce)).unwrap_or((0, 0));
    Ok(json!({"balance": balance, "nonce": nonce}))
}

fn get_latest_block(node: &Node) -> Result<Value, RpcError> {
    let state = node.state().lock();
    let tip = state
        .chain
        .tip()
        .ok_or_else(|| RpcError::App("chain not initialized".into()))?;
    Ok(serde_json::to_value(tip).unwrap())
}

fn get_mempool(node: &Node) -> Result<Value, RpcError> {
    let state = node.state().lock();
    let hashes: Vec<String> = state
        .mempool
        .get_pending(None)
        .iter()
        .map(|tx| hex::encode(tx.tx_hash()))
        .collect();
    Ok(json!({"transactions": hashes}))
}

fn get_merkle_proof(node: &Node, params: &Value) -> Result<Value, RpcError> {
    let tx_hash = hash_param(params, "tx_hash")?;
    let state = node.state().lock();
    let block = state
        .chain
        .transaction_block(&tx_hash)
        .ok_or_else(|| RpcError::App("transaction not in any confirmed block".into()))?;

    let tx_hashes: Vec<Hash> = block.transactions.iter().map(|tx| tx.tx_hash()).collect();
    let index = tx_hashes
        .iter()
        .position(|hash| *hash == tx_hash)
        .ok_or_else(|| RpcError::App("transaction missing from its block".into()))?;
    let proof = merkle_proof(&tx_hashes, index).map_err(app_err)?;

    Ok(json!({
        "tx_hash": hex::encode(tx_hash),
        "block_hash": hex::encode(block.block_hash()),
        "index": index,
        "proof": proof
            .iter()
            .map(|step| json!({"hash": hex::encode(step.hash), "is_left": step.is_left}))
            .collect::<Vec<Value>>(),
        "root": hex::encode(block.header.tx_merkle_root),
    }))
}

fn get_node_info(node: &Node) -> Result<Value, RpcError> {
    let state = node.state().lock();
    Ok(json!({
        "height": state.chain.height(),
        "peer_count": node.p2p().peer_count(),
        "mempool_size": state.mempool.len(),
    }))
}
