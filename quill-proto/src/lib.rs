use serde_json::{json, Value};
use thiserror::Error;

use quill_codec::canonicalize;
use quill_core::MAX_MESSAGE_SIZE;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("message too large: {0} bytes")]
    Oversize(usize),
    #[error("unknown message type: {0}")]
    UnknownType(u64),
    #[error("malformed message: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Handshake = 0,
    PeersRequest = 1,
    PeersResponse = 2,
    TxAnnounce = 3,
    TxRequest = 4,
    TxResponse = 5,
    BlockAnnounce = 6,
    BlockRequest = 7,
    BlockResponse = 8,
    SyncRequest = 9,
    SyncResponse = 10,
}

impl MessageType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Self::Handshake),
            1 => Some(Self::PeersRequest),
            2 => Some(Self::PeersResponse),
            3 => Some(Self::TxAnnounce),
            4 => Some(Self::TxRequest),
            5 => Some(Self::TxResponse),
            6 => Some(Self::BlockAnnounce),
            7 => Some(Self::BlockRequest),
            8 => Some(Self::BlockResponse),
            9 => Some(Self::SyncRequest),
            10 => Some(Self::SyncResponse),
            _ => None,
        }
    }
}

/// A P2P protocol message: an integer type code and a JSON payload.
#[derive(Debug, Clone)]
pub struct Message {
    pub msg_type: MessageType,
    pub payload: Value,
}

impl Message {
    pub fn new(msg_type: MessageType, payload: Value) -> Self {
        Self { msg_type, payload }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "type": self.msg_type.code(),
            "payload": self.payload,
        })
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtoError> {
        let object = value
            .as_object()
            .ok_or_else(|| ProtoError::Malformed("message is not an object".into()))?;
        let code = object
            .get("type")
            .and_then(Value::as_u64)
            .ok_or_else(|| ProtoError::Malformed("missing message type".into()))?;
        let msg_type = MessageType::from_code(code).ok_or(ProtoError::UnknownType(code))?;
        let payload = object
            .get("payload")
            .cloned()
            .ok_or_else(|| ProtoError::Malformed("missing payload".into()))?;
        Ok(Self { msg_type, payload })
    }

    // -- Factories --

    pub fn handshake(version: u32, height: i64, genesis_hash: &str) -> Self {
        Self::new(
            MessageType::Handshake,
            json!({"version": version, "height": height, "genesis_hash": genesis_hash}),
        )
    }

    pub fn peers_request() -> Self {
        Self::new(MessageType::PeersRequest, json!({}))
    }

    pub fn peers_response(peers: &[(String, u16)]) -> Self {
        let entries: Vec<Value> = peers
            .iter()
            .map(|(host, port)| json!({"host": host, "port": port}))
            .collect();
        Self::new(MessageType::PeersResponse, json!({"peers": entries}))
    }

    pub fn tx_announce(tx_hash: &str) -> Self {
        Self::new(MessageType::TxAnnounce, json!({"tx_hash": tx_hash}))
    }

    pub fn tx_request(tx_hash: &str) -> Self {
        Self::new(MessageType::TxRequest, json!({"tx_hash": tx_hash}))
    }

    pub fn tx_response(transaction: Option<Value>) -> Self {
        Self::new(MessageType::TxResponse, json!({"transaction": transaction}))
    }

    pub fn block_announce(block_hash: &str, height: u64) -> Self {
        Self::new(
            MessageType::BlockAnnounce,
            json!({"block_hash": block_hash, "height": height}),
        )
    }

    pub fn block_request_by_hash(block_hash: &str) -> Self {
        Self::new(MessageType::BlockRequest, json!({"block_hash": block_hash}))
    }

    pub fn block_request_by_height(height: u64) -> Self {
        Self::new(MessageType::BlockRequest, json!({"height": height}))
    }

    pub fn block_response(block: Option<Value>) -> Self {
        Self::new(MessageType::BlockResponse, json!({"block": block}))
    }

    pub fn sync_request(start_height: u64, end_height: u64) -> Self {
        Self::new(
            MessageType::SyncRequest,
            json!({"start_height": start_height, "end_height": end_height}),
        )
    }

    pub fn sync_response(blocks: Vec<Value>) -> Self {
        Self::new(MessageType::SyncResponse, json!({"blocks": blocks}))
    }
}

// Wire format: 4-byte big-endian length, then that many bytes of canonical
// JSON.

/// Serialize a message to a length-prefixed frame.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, ProtoError> {
    let body = canonicalize(&msg.to_value(), &[]);
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(ProtoError::Oversize(body.len()));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode the 4-byte big-endian length prefix.
pub fn decode_length_prefix(header: [u8; 4]) -> usize {
    u32::from_be_bytes(header) as usize
}

/// Deserialize a frame body (without the length prefix) into a message.
pub fn decode_message(data: &[u8]) -> Result<Message, ProtoError> {
    let value: Value =
        serde_json::from_slice(data).map_err(|e| ProtoError::Malformed(e.to_string()))?;
    Message::from_value(&value)
}
