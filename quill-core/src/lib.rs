use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use primitive_types::U256;
use serde::{Deserialize, Serialize};

use quill_codec::{canonicalize, hash_value, sha256};
use quill_merkle::merkle_root;

pub use quill_codec::Hash;

/// Ed25519 public key; doubles as the account identifier.
pub type PubKey = [u8; 32];

// -- Protocol parameters --

pub const PROTOCOL_VERSION: u32 = 1;

// Block timing
pub const BLOCK_TIME_TARGET: u64 = 15;
pub const DIFFICULTY_ADJUSTMENT_WINDOW: u64 = 100;
pub const MAX_DIFFICULTY_ADJUSTMENT: f64 = 4.0;

// Block limits
pub const MAX_BLOCK_SIZE: usize = 262_144;

// Transaction limits
pub const POST_BODY_LIMIT: usize = 300;
pub const ENDORSE_MESSAGE_LIMIT: usize = 150;
pub const MINIMUM_GAS_FEE: u64 = 1;

// Token economics
pub const INITIAL_BLOCK_REWARD: u64 = 50;
pub const HALVING_INTERVAL: u64 = 210_000;

// Mempool
pub const MAX_MEMPOOL_SIZE: usize = 10_000;

// Timestamps
pub const MAX_FUTURE_TIMESTAMP: u64 = 120;
pub const MEDIAN_TIME_BLOCK_COUNT: usize = 11;

// Genesis
pub const GENESIS_DIFFICULTY: u64 = 1;

// Networking
pub const DEFAULT_P2P_PORT: u16 = 9333;
pub const DEFAULT_RPC_PORT: u16 = 9332;
pub const MAX_PEERS: usize = 50;
pub const SYNC_BATCH_SIZE: usize = 50;
pub const PEER_EXCHANGE_INTERVAL: u64 = 60;
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
pub const HANDSHAKE_TIMEOUT: u64 = 10;

const SIGNATURE_FIELD: &str = "signature";

/// Block reward at a given height under the halving schedule.
pub fn block_reward(height: u64) -> u64 {
    let halvings = height / HALVING_INTERVAL;
    if halvings >= 64 {
        return 0;
    }
    INITIAL_BLOCK_REWARD >> halvings
}

/// Current wall-clock time as Unix seconds.
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Parse a lowercase-hex 32-byte identifier.
pub fn parse_hash(text: &str) -> Option<Hash> {
    let bytes = hex::decode(text).ok()?;
    bytes.as_slice().try_into().ok()
}

/// Serde helper for fixed 32-byte fields as lowercase hex.
pub mod hex_bytes {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(D::Error::custom)?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| D::Error::custom("expected 32 bytes"))
    }
}

/// Serde helper for variable-length byte strings (signatures).
pub mod hex_vec {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(&text).map_err(D::Error::custom)
    }
}

/// Serde helper for `Option<[u8; 32]>` as hex-or-null.
pub mod hex_opt {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<[u8; 32]>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<[u8; 32]>, D::Error> {
        let text: Option<String> = Option::deserialize(deserializer)?;
        match text {
            None => Ok(None),
            Some(text) => {
                let bytes = hex::decode(&text).map_err(D::Error::custom)?;
                bytes
                    .as_slice()
                    .try_into()
                    .map(Some)
                    .map_err(|_| D::Error::custom("expected 32 bytes"))
            }
        }
    }
}

// -- Transactions --

/// Block reward transaction. Validity comes from the block, not a signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coinbase {
    #[serde(with = "hex_bytes")]
    pub recipient: PubKey,
    pub amount: u64,
    pub height: u64,
}

/// A text post on the network, optionally threaded under another post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    #[serde(with = "hex_bytes")]
    pub author: PubKey,
    pub nonce: u64,
    pub timestamp: u64,
    pub body: String,
    #[serde(default, with = "hex_opt")]
    pub reply_to: Option<Hash>,
    pub gas_fee: u64,
    #[serde(default, with = "hex_vec")]
    pub signature: Vec<u8>,
}

/// An endorsement of an existing post, optionally with a tip and message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endorse {
    #[serde(with = "hex_bytes")]
    pub author: PubKey,
    pub nonce: u64,
    #[serde(with = "hex_bytes")]
    pub target: Hash,
    pub amount: u64,
    #[serde(default)]
    pub message: String,
    pub gas_fee: u64,
    #[serde(default, with = "hex_vec")]
    pub signature: Vec<u8>,
}

/// A token transfer between accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    #[serde(with = "hex_bytes")]
    pub sender: PubKey,
    #[serde(with = "hex_bytes")]
    pub recipient: PubKey,
    pub amount: u64,
    pub nonce: u64,
    pub gas_fee: u64,
    #[serde(default, with = "hex_vec")]
    pub signature: Vec<u8>,
}

/// The closed set of transaction kinds. The JSON discriminator is `tx_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tx_type", rename_all = "lowercase")]
pub enum Transaction {
    Coinbase(Coinbase),
    Post(Post),
    Endorse(Endorse),
    Transfer(Transfer),
}

impl Transaction {
    /// Content address: SHA-256 of the canonical serialization with the
    /// `signature` field excluded. Coinbase hashes over all fields.
    pub fn tx_hash(&self) -> Hash {
        let value = serde_json::to_value(self).unwrap();
        match self {
            Transaction::Coinbase(_) => hash_value(&value, &[]),
            _ => hash_value(&value, &[SIGNATURE_FIELD]),
        }
    }

    fn signing_payload(&self) -> Vec<u8> {
        let value = serde_json::to_value(self).unwrap();
        canonicalize(&value, &[SIGNATURE_FIELD])
    }

    /// Sign a post, endorsement, or transfer in place.
    pub fn sign(&mut self, secret: &[u8; 32]) {
        let signature = quill_crypto::sign_message(secret, &self.signing_payload());
        match self {
            Transaction::Post(tx) => tx.signature = signature,
            Transaction::Endorse(tx) => tx.signature = signature,
            Transaction::Transfer(tx) => tx.signature = signature,
            Transaction::Coinbase(_) => unreachable!("coinbase transactions are unsigned"),
        }
    }

    /// Verify the signature against the signer's public key. Returns false
    /// for missing or malformed signatures and for coinbase transactions.
    pub fn verify_signature(&self) -> bool {
        let (signer, signature) = match self {
            Transaction::Post(tx) => (&tx.author, &tx.signature),
            Transaction::Endorse(tx) => (&tx.author, &tx.signature),
            Transaction::Transfer(tx) => (&tx.sender, &tx.signature),
            Transaction::Coinbase(_) => return false,
        };
        if signature.is_empty() {
            return false;
        }
        quill_crypto::verify_signature(signer, &self.signing_payload(), signature)
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self, Transaction::Coinbase(_))
    }

    /// Fee paid to the miner; zero for coinbase.
    pub fn gas_fee(&self) -> u64 {
        match self {
            Transaction::Post(tx) => tx.gas_fee,
            Transaction::Endorse(tx) => tx.gas_fee,
            Transaction::Transfer(tx) => tx.gas_fee,
            Transaction::Coinbase(_) => 0,
        }
    }
}

// -- Blocks --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub height: u64,
    #[serde(with = "hex_bytes")]
    pub prev_hash: Hash,
    pub timestamp: u64,
    #[serde(with = "hex_bytes")]
    pub miner: PubKey,
    pub difficulty: u64,
    pub nonce: u64,
    #[serde(with = "hex_bytes")]
    pub tx_merkle_root: Hash,
    #[serde(with = "hex_bytes")]
    pub state_root: Hash,
    pub tx_count: u64,
}

impl BlockHeader {
    /// SHA-256 of the canonical header serialization, nonce included.
    pub fn block_hash(&self) -> Hash {
        hash_value(&serde_json::to_value(self).unwrap(), &[])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn block_hash(&self) -> Hash {
        self.header.block_hash()
    }

    /// Merkle root over the content addresses of the block's transactions.
    pub fn compute_tx_merkle_root(&self) -> Hash {
        let hashes: Vec<Hash> = self.transactions.iter().map(|tx| tx.tx_hash()).collect();
        merkle_root(&hashes)
    }

    /// Canonical serialized size in bytes.
    pub fn serialized_size(&self) -> usize {
        canonicalize(&serde_json::to_value(self).unwrap(), &[]).len()
    }

    /// Proof-of-work predicate: the block hash, read as a big-endian 256-bit
    /// integer, must not exceed `(2^256 - 1) / difficulty`.
    pub fn meets_difficulty(&self) -> bool {
        if self.header.difficulty == 0 {
            return false;
        }
        let hash_int = U256::from_big_endian(&self.block_hash());
        let target = U256::MAX / U256::from(self.header.difficulty);
        hash_int <= target
    }
}

// -- World state --

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub balance: u64,
    pub nonce: u64,
}

/// All account balances and nonces. Exclusively owned by the chain; cloned
/// into a working copy for block validation.
#[derive(Debug, Clone, Default)]
pub struct WorldState {
    accounts: HashMap<PubKey, Account>,
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_account(&self, pubkey: &PubKey) -> Option<&Account> {
        self.accounts.get(pubkey)
    }

    pub fn get_or_create(&mut self, pubkey: &PubKey) -> &mut Account {
        self.accounts.entry(*pubkey).or_default()
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    /// Sum of all balances; used to check conservation in tests.
    pub fn total_balance(&self) -> u64 {
        self.accounts.values().map(|a| a.balance).sum()
    }

    /// Apply a single transaction. Callers must have validated the
    /// transition; preconditions are not re-checked here.
    pub fn apply_transaction(
        &mut self,
        tx: &Transaction,
        miner: &PubKey,
        target_author: Option<&PubKey>,
    ) {
        match tx {
            Transaction::Coinbase(tx) => {
                self.get_or_create(&tx.recipient).balance += tx.amount;
            }
            Transaction::Post(tx) => {
                let author = self.get_or_create(&tx.author);
                author.balance -= tx.gas_fee;
                author.nonce += 1;
                self.get_or_create(miner).balance += tx.gas_fee;
            }
            Transaction::Endorse(tx) => {
                let author = self.get_or_create(&tx.author);
                author.balance -= tx.gas_fee + tx.amount;
                author.nonce += 1;
                self.get_or_create(miner).balance += tx.gas_fee;
                if tx.amount > 0 {
                    if let Some(recipient) = target_author {
                        self.get_or_create(recipient).balance += tx.amount;
                    }
                }
            }
            Transaction::Transfer(tx) => {
                let sender = self.get_or_create(&tx.sender);
                sender.balance -= tx.amount + tx.gas_fee;
                sender.nonce += 1;
                self.get_or_create(&tx.recipient).balance += tx.amount;
                self.get_or_create(miner).balance += tx.gas_fee;
            }
        }
    }

    /// Merkle root over the canonical account records, sorted by pubkey.
    /// An empty state hashes to `sha256("")`.
    pub fn state_root(&self) -> Hash {
        if self.accounts.is_empty() {
            return sha256(b"");
        }
        let mut keys: Vec<&PubKey> = self.accounts.keys().collect();
        keys.sort();
        let leaves: Vec<Hash> = keys
            .iter()
            .map(|pubkey| {
                let account = &self.accounts[*pubkey];
                let leaf = serde_json::json!({
                    "pubkey": hex::encode(pubkey),
                    "balance": account.balance,
                    "nonce": account.nonce,
                });
                hash_value(&leaf, &[])
            })
            .collect();
        merkle_root(&leaves)
    }
}
