use std::collections::{HashMap, HashSet};

use thiserror::Error;

use quill_core::{
    block_reward, unix_time, Block, BlockHeader, Coinbase, Hash, PubKey, Transaction, WorldState,
    BLOCK_TIME_TARGET, DIFFICULTY_ADJUSTMENT_WINDOW, ENDORSE_MESSAGE_LIMIT, GENESIS_DIFFICULTY,
    MAX_BLOCK_SIZE, MAX_DIFFICULTY_ADJUSTMENT, MAX_FUTURE_TIMESTAMP, MEDIAN_TIME_BLOCK_COUNT,
    MINIMUM_GAS_FEE, POST_BODY_LIMIT, PROTOCOL_VERSION,
};

/// The single validation-error kind: a human-readable reason. Handlers
/// decide what to do with it (drop a transaction, reject a block, ...).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(String);

impl ValidationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }

    pub fn reason(&self) -> &str {
        &self.0
    }
}

// -- Transaction format validation --

/// Validate coinbase structure and reward amount.
pub fn validate_coinbase_format(tx: &Coinbase, expected_height: u64) -> Result<(), ValidationError> {
    if tx.height != expected_height {
        return Err(ValidationError::new("coinbase height mismatch"));
    }
    let expected_reward = block_reward(expected_height);
    if tx.amount != expected_reward {
        return Err(ValidationError::new(format!(
            "coinbase amount {} != expected {}",
            tx.amount, expected_reward
        )));
    }
    Ok(())
}

/// Stateless checks: structural limits and the signature. Key widths and
/// non-negativity are enforced by the types at the codec boundary.
pub fn validate_transaction_format(
    tx: &Transaction,
    expected_height: u64,
) -> Result<(), ValidationError> {
    match tx {
        Transaction::Post(post) => {
            if post.body.is_empty() {
                return Err(ValidationError::new("post body must be a non-empty string"));
            }
            if post.body.chars().count() > POST_BODY_LIMIT {
                return Err(ValidationError::new(format!(
                    "post body exceeds {POST_BODY_LIMIT} chars"
                )));
            }
            if post.gas_fee < MINIMUM_GAS_FEE {
                return Err(ValidationError::new(format!(
                    "gas fee below minimum ({MINIMUM_GAS_FEE})"
                )));
            }
            if !tx.verify_signature() {
                return Err(ValidationError::new("invalid post signature"));
            }
            Ok(())
        }
        Transaction::Endorse(endorse) => {
            if endorse.message.chars().count() > ENDORSE_MESSAGE_LIMIT {
                return Err(ValidationError::new(format!(
                    "message exceeds {ENDORSE_MESSAGE_LIMIT} chars"
                )));
            }
            if endorse.gas_fee < MINIMUM_GAS_FEE {
                return Err(ValidationError::new(format!(
                    "gas fee below minimum ({MINIMUM_GAS_FEE})"
                )));
            }
            if !tx.verify_signature() {
                return Err(ValidationError::new("invalid endorsement signature"));
            }
            Ok(())
        }
        Transaction::Transfer(transfer) => {
            if transfer.sender == transfer.recipient {
                return Err(ValidationError::new("sender and recipient must differ"));
            }
            if transfer.amount == 0 {
                return Err(ValidationError::new("transfer amount must be positive"));
            }
            if transfer.gas_fee < MINIMUM_GAS_FEE {
                return Err(ValidationError::new(format!(
                    "gas fee below minimum ({MINIMUM_GAS_FEE})"
                )));
            }
            if !tx.verify_signature() {
                return Err(ValidationError::new("invalid transfer signature"));
            }
            Ok(())
        }
        Transaction::Coinbase(coinbase) => validate_coinbase_format(coinbase, expected_height),
    }
}

// -- Transaction state validation --

/// Validate balances, nonces, and post references against a world state.
pub fn validate_transaction_state(
    tx: &Transaction,
    state: &WorldState,
    known_posts: &HashSet<Hash>,
) -> Result<(), ValidationError> {
    match tx {
        Transaction::Post(post) => {
            let account = state
                .get_account(&post.author)
                .ok_or_else(|| ValidationError::new("author account does not exist"))?;
            if post.nonce != account.nonce {
                return Err(ValidationError::new(format!(
                    "nonce mismatch: tx={}, expected={}",
                    post.nonce, account.nonce
                )));
            }
            if account.balance < post.gas_fee {
                return Err(ValidationError::new("insufficient balance for gas fee"));
            }
            if let Some(reply_to) = &post.reply_to {
                if !known_posts.contains(reply_to) {
                    return Err(ValidationError::new("reply_to references unknown post"));
                }
            }
            Ok(())
        }
        Transaction::Endorse(endorse) => {
            let account = state
                .get_account(&endorse.author)
                .ok_or_else(|| ValidationError::new("author account does not exist"))?;
            if endorse.nonce != account.nonce {
                return Err(ValidationError::new(format!(
                    "nonce mismatch: tx={}, expected={}",
                    endorse.nonce, account.nonce
                )));
            }
            let total_cost = endorse
                .gas_fee
                .checked_add(endorse.amount)
                .ok_or_else(|| ValidationError::new("insufficient balance for gas + tip"))?;
            if account.balance < total_cost {
                return Err(ValidationError::new("insufficient balance for gas + tip"));
            }
            if !known_posts.contains(&endorse.target) {
                return Err(ValidationError::new(
                    "endorsement target is not a known post",
                ));
            }
            Ok(())
        }
        Transaction::Transfer(transfer) => {
            let account = state
                .get_account(&transfer.sender)
                .ok_or_else(|| ValidationError::new("sender account does not exist"))?;
            if transfer.nonce != account.nonce {
                return Err(ValidationError::new(format!(
                    "nonce mismatch: tx={}, expected={}",
                    transfer.nonce, account.nonce
                )));
            }
            let total_cost = transfer
                .amount
                .checked_add(transfer.gas_fee)
                .ok_or_else(|| ValidationError::new("insufficient balance for transfer + gas"))?;
            if account.balance < total_cost {
                return Err(ValidationError::new(
                    "insufficient balance for transfer + gas",
                ));
            }
            Ok(())
        }
        Transaction::Coinbase(_) => Ok(()),
    }
}

// -- Difficulty --

/// Statistical median (mean of the middle pair for even counts).
pub fn median(values: &[u64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] as f64 + sorted[mid] as f64) / 2.0
    } else {
        sorted[mid] as f64
    }
}

/// Expected difficulty for a block at the given height: retargets every
/// `DIFFICULTY_ADJUSTMENT_WINDOW` blocks, ratio clamped to [1/4, 4].
pub fn compute_expected_difficulty(chain: &Chain, height: u64) -> u64 {
    if height == 0 {
        return GENESIS_DIFFICULTY;
    }
    if height % DIFFICULTY_ADJUSTMENT_WINDOW != 0 {
        return chain
            .block_by_height(height - 1)
            .map(|b| b.header.difficulty)
            .unwrap_or(GENESIS_DIFFICULTY);
    }

    let window_end = chain.block_by_height(height - 1);
    let window_start = chain.block_by_height(height - DIFFICULTY_ADJUSTMENT_WINDOW);
    let (Some(start), Some(end)) = (window_start, window_end) else {
        return GENESIS_DIFFICULTY;
    };

    let actual_time = end
        .header
        .timestamp
        .saturating_sub(start.header.timestamp)
        .max(1);
    let expected_time = DIFFICULTY_ADJUSTMENT_WINDOW * BLOCK_TIME_TARGET;

    let ratio = (expected_time as f64 / actual_time as f64)
        .clamp(1.0 / MAX_DIFFICULTY_ADJUSTMENT, MAX_DIFFICULTY_ADJUSTMENT);
    ((end.header.difficulty as f64 * ratio) as u64).max(1)
}

// -- Block validation --

/// Full block validation against the chain. Runs atomically on a cloned
/// working state; the real chain and state are never mutated here.
pub fn validate_block(block: &Block, chain: &Chain, current_time: u64) -> Result<(), ValidationError> {
    let header = &block.header;

    if header.version != PROTOCOL_VERSION {
        return Err(ValidationError::new(format!(
            "unsupported version: {}",
            header.version
        )));
    }

    let expected_height = chain.height() + 1;
    if header.height as i64 != expected_height {
        return Err(ValidationError::new(format!(
            "height mismatch: got {}, expected {}",
            header.height, expected_height
        )));
    }

    let expected_prev = chain.tip().map(|b| b.block_hash()).unwrap_or([0u8; 32]);
    if header.prev_hash != expected_prev {
        return Err(ValidationError::new("prev_hash does not match tip"));
    }

    // Timestamp: must exceed the median of recent blocks
    if chain.height() >= 0 {
        let recent = chain.recent_timestamps(MEDIAN_TIME_BLOCK_COUNT);
        if !recent.is_empty() && header.timestamp as f64 <= median(&recent) {
            return Err(ValidationError::new(
                "timestamp not above median of recent blocks",
            ));
        }
    }

    // Timestamp: not too far in the future
    if header.timestamp > current_time + MAX_FUTURE_TIMESTAMP {
        return Err(ValidationError::new("timestamp too far in the future"));
    }

    let expected_difficulty = compute_expected_difficulty(chain, header.height);
    if header.difficulty != expected_difficulty {
        return Err(ValidationError::new(format!(
            "difficulty mismatch: got {}, expected {}",
            header.difficulty, expected_difficulty
        )));
    }

    if !block.meets_difficulty() {
        return Err(ValidationError::new("block does not meet difficulty target"));
    }

    if header.tx_count as usize != block.transactions.len() {
        return Err(ValidationError::new("tx_count does not match transaction list"));
    }

    let Some(first) = block.transactions.first() else {
        return Err(ValidationError::new("block has no transactions"));
    };
    let Transaction::Coinbase(coinbase) = first else {
        return Err(ValidationError::new("first transaction must be coinbase"));
    };
    validate_coinbase_format(coinbase, header.height)?;
    if coinbase.recipient != header.miner {
        return Err(ValidationError::new(
            "coinbase recipient must match block miner",
        ));
    }
    if block.transactions[1..].iter().any(|tx| tx.is_coinbase()) {
        return Err(ValidationError::new("only one coinbase per block"));
    }

    // Validate and apply each transaction on a working copy of the state,
    // tracking posts created earlier in the same block.
    let mut working_state = chain.state().clone();
    let mut working_posts = chain.known_posts().clone();
    let mut working_authors = chain.post_authors().clone();
    let mut seen_hashes: HashSet<Hash> = HashSet::new();

    for (index, tx) in block.transactions.iter().enumerate() {
        let tx_hash = tx.tx_hash();

        if seen_hashes.contains(&tx_hash) || chain.contains_transaction(&tx_hash) {
            return Err(ValidationError::new(format!(
                "duplicate transaction at index {index}"
            )));
        }
        seen_hashes.insert(tx_hash);

        validate_transaction_format(tx, header.height)?;

        if !tx.is_coinbase() {
            validate_transaction_state(tx, &working_state, &working_posts)?;
        }

        let target_author = match tx {
            Transaction::Endorse(endorse) if endorse.amount > 0 => {
                working_authors.get(&endorse.target).copied()
            }
            _ => None,
        };
        working_state.apply_transaction(tx, &header.miner, target_author.as_ref());

        if let Transaction::Post(post) = tx {
            working_posts.insert(tx_hash);
            working_authors.insert(tx_hash, post.author);
        }
    }

    if header.tx_merkle_root != block.compute_tx_merkle_root() {
        return Err(ValidationError::new("tx_merkle_root mismatch"));
    }

    if header.state_root != working_state.state_root() {
        return Err(ValidationError::new("state_root mismatch"));
    }

    if block.serialized_size() > MAX_BLOCK_SIZE {
        return Err(ValidationError::new("block exceeds maximum size"));
    }

    Ok(())
}

// -- Chain --

/// The chain of blocks, the world state derived from them, and the lookup
/// indices. Only ever extends its current tip; forks are rejected.
#[derive(Debug, Default)]
pub struct Chain {
    blocks: HashMap<Hash, Block>,
    main_chain: Vec<Hash>,
    state: WorldState,
    tx_index: HashMap<Hash, Hash>,
    known_posts: HashSet<Hash>,
    post_authors: HashMap<Hash, PubKey>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current chain height (-1 if empty).
    pub fn height(&self) -> i64 {
        self.main_chain.len() as i64 - 1
    }

    /// The latest block on the main chain.
    pub fn tip(&self) -> Option<&Block> {
        self.main_chain.last().map(|hash| &self.blocks[hash])
    }

    pub fn genesis_hash(&self) -> Option<Hash> {
        self.main_chain.first().copied()
    }

    pub fn block_by_height(&self, height: u64) -> Option<&Block> {
        self.main_chain
            .get(height as usize)
            .map(|hash| &self.blocks[hash])
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Option<&Block> {
        self.blocks.get(hash)
    }

    pub fn contains_transaction(&self, tx_hash: &Hash) -> bool {
        self.tx_index.contains_key(tx_hash)
    }

    /// The block containing a confirmed transaction.
    pub fn transaction_block(&self, tx_hash: &Hash) -> Option<&Block> {
        self.tx_index.get(tx_hash).map(|hash| &self.blocks[hash])
    }

    /// Look up a confirmed transaction by content address.
    pub fn transaction_by_hash(&self, tx_hash: &Hash) -> Option<&Transaction> {
        self.transaction_block(tx_hash)?
            .transactions
            .iter()
            .find(|tx| tx.tx_hash() == *tx_hash)
    }

    /// Timestamps of the last `count` blocks, oldest first.
    pub fn recent_timestamps(&self, count: usize) -> Vec<u64> {
        let start = self.main_chain.len().saturating_sub(count);
        self.main_chain[start..]
            .iter()
            .map(|hash| self.blocks[hash].header.timestamp)
            .collect()
    }

    pub fn state(&self) -> &WorldState {
        &self.state
    }

    pub fn known_posts(&self) -> &HashSet<Hash> {
        &self.known_posts
    }

    pub fn post_authors(&self) -> &HashMap<Hash, PubKey> {
        &self.post_authors
    }

    /// Validate and append a block extending the current tip.
    pub fn add_block(&mut self, block: Block, current_time: Option<u64>) -> Result<(), ValidationError> {
        let current_time = current_time.unwrap_or_else(unix_time);
        validate_block(&block, self, current_time)?;
        self.apply_block(block);
        Ok(())
    }

    /// Create, trivially mine, and apply the genesis block.
    pub fn initialize_genesis(
        &mut self,
        miner_pubkey: &PubKey,
        timestamp: Option<u64>,
    ) -> Result<Block, ValidationError> {
        if !self.main_chain.is_empty() {
            return Err(ValidationError::new("chain already initialized"));
        }
        let timestamp = timestamp.unwrap_or_else(unix_time);

        let coinbase = Transaction::Coinbase(Coinbase {
            recipient: *miner_pubkey,
            amount: block_reward(0),
            height: 0,
        });

        let mut genesis_state = WorldState::new();
        genesis_state.apply_transaction(&coinbase, miner_pubkey, None);

        let header = BlockHeader {
            version: PROTOCOL_VERSION,
            height: 0,
            prev_hash: [0u8; 32],
            timestamp,
            miner: *miner_pubkey,
            difficulty: GENESIS_DIFFICULTY,
            nonce: 0,
            tx_merkle_root: [0u8; 32],
            state_root: genesis_state.state_root(),
            tx_count: 1,
        };
        let mut block = Block {
            header,
            transactions: vec![coinbase],
        };
        block.header.tx_merkle_root = block.compute_tx_merkle_root();

        // at GENESIS_DIFFICULTY=1, any hash works
        while !block.meets_difficulty() {
            block.header.nonce += 1;
        }

        self.apply_block(block.clone());
        Ok(block)
    }

    /// Adopt an externally produced genesis block (joining a network whose
    /// genesis was minted elsewhere).
    pub fn install_genesis(&mut self, block: Block) -> Result<(), ValidationError> {
        if !self.main_chain.is_empty() {
            return Err(ValidationError::new("chain already initialized"));
        }
        if block.header.height != 0 {
            return Err(ValidationError::new("genesis block must be at height 0"));
        }
        self.apply_block(block);
        Ok(())
    }

    /// Commit a validated block: indices first, then the real state, so
    /// endorsements resolve against posts confirmed earlier in the block.
    fn apply_block(&mut self, block: Block) {
        let block_hash = block.block_hash();
        let miner = block.header.miner;
        self.main_chain.push(block_hash);

        for tx in &block.transactions {
            let tx_hash = tx.tx_hash();
            self.tx_index.insert(tx_hash, block_hash);

            if let Transaction::Post(post) = tx {
                self.known_posts.insert(tx_hash);
                self.post_authors.insert(tx_hash, post.author);
            }

            let target_author = match tx {
                Transaction::Endorse(endorse) if endorse.amount > 0 => {
                    self.post_authors.get(&endorse.target).copied()
                }
                _ => None,
            };
            self.state.apply_transaction(tx, &miner, target_author.as_ref());
        }

        self.blocks.insert(block_hash, block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_codec::sha256;
    use quill_core::{Endorse, Post, Transfer};
    use quill_crypto::{generate_keypair, KeyMaterial};

    const GENESIS_TIME: u64 = 1_700_000_000;

    fn new_chain() -> (Chain, KeyMaterial) {
        let miner = generate_keypair();
        let mut chain = Chain::new();
        chain
            .initialize_genesis(&miner.public_key, Some(GENESIS_TIME))
            .unwrap();
        (chain, miner)
    }

    fn next_timestamp(chain: &Chain) -> u64 {
        chain.tip().map(|b| b.header.timestamp + 1).unwrap_or(GENESIS_TIME)
    }

    /// Assemble a valid block on top of the chain carrying `txs`.
    fn build_block(chain: &Chain, txs: Vec<Transaction>, miner: &PubKey, timestamp: u64) -> Block {
        let height = (chain.height() + 1) as u64;
        let coinbase = Transaction::Coinbase(Coinbase {
            recipient: *miner,
            amount: block_reward(height),
            height,
        });
        let mut transactions = vec![coinbase];
        transactions.extend(txs);

        let mut working_state = chain.state().clone();
        let mut working_authors = chain.post_authors().clone();
        for tx in &transactions {
            let target = match tx {
                Transaction::Endorse(e) if e.amount > 0 => {
                    working_authors.get(&e.target).copied()
                }
                _ => None,
            };
            working_state.apply_transaction(tx, miner, target.as_ref());
            if let Transaction::Post(post) = tx {
                working_authors.insert(tx.tx_hash(), post.author);
            }
        }

        let header = BlockHeader {
            version: PROTOCOL_VERSION,
            height,
            prev_hash: chain.tip().map(|b| b.block_hash()).unwrap_or([0u8; 32]),
            timestamp,
            miner: *miner,
            difficulty: compute_expected_difficulty(chain, height),
            nonce: 0,
            tx_merkle_root: [0u8; 32],
            state_root: working_state.state_root(),
            tx_count: transactions.len() as u64,
        };
        let mut block = Block {
            header,
            transactions,
        };
        block.header.tx_merkle_root = block.compute_tx_merkle_root();
        while !block.meets_difficulty() {
            block.header.nonce += 1;
        }
        block
    }

    fn add_empty_blocks(chain: &mut Chain, miner: &PubKey, count: usize, spacing: u64) {
        for _ in 0..count {
            let timestamp = chain.tip().unwrap().header.timestamp + spacing;
            let block = build_block(chain, vec![], miner, timestamp);
            chain.add_block(block, Some(timestamp)).unwrap();
        }
    }

    fn signed_transfer(
        from: &KeyMaterial,
        to: &PubKey,
        amount: u64,
        nonce: u64,
        gas_fee: u64,
    ) -> Transaction {
        let mut tx = Transaction::Transfer(Transfer {
            sender: from.public_key,
            recipient: *to,
            amount,
            nonce,
            gas_fee,
            signature: Vec::new(),
        });
        tx.sign(&from.secret_key);
        tx
    }

    fn signed_post(author: &KeyMaterial, body: &str, nonce: u64) -> Transaction {
        let mut tx = Transaction::Post(Post {
            author: author.public_key,
            nonce,
            timestamp: GENESIS_TIME,
            body: body.to_string(),
            reply_to: None,
            gas_fee: 1,
            signature: Vec::new(),
        });
        tx.sign(&author.secret_key);
        tx
    }

    fn signed_endorse(
        author: &KeyMaterial,
        target: Hash,
        amount: u64,
        nonce: u64,
    ) -> Transaction {
        let mut tx = Transaction::Endorse(Endorse {
            author: author.public_key,
            nonce,
            target,
            amount,
            message: "well said".into(),
            gas_fee: 1,
            signature: Vec::new(),
        });
        tx.sign(&author.secret_key);
        tx
    }

    #[test]
    fn genesis_initializes_height_zero_and_pays_miner() {
        let (chain, miner) = new_chain();
        assert_eq!(chain.height(), 0);
        let genesis = chain.block_by_height(0).unwrap();
        assert_eq!(genesis.header.prev_hash, [0u8; 32]);
        assert_eq!(
            chain.state().get_account(&miner.public_key).unwrap().balance,
            50
        );
    }

    #[test]
    fn genesis_cannot_be_initialized_twice() {
        let (mut chain, miner) = new_chain();
        assert!(chain
            .initialize_genesis(&miner.public_key, Some(GENESIS_TIME))
            .is_err());
    }

    #[test]
    fn transfer_block_settles_balances() {
        // Genesis pays the miner 50; the miner sends 10 to A with gas 1,
        // then collects reward 50 and the fee back in the same block.
        let (mut chain, miner) = new_chain();
        let recipient = generate_keypair();
        let tx = signed_transfer(&miner, &recipient.public_key, 10, 0, 1);
        let timestamp = next_timestamp(&chain);
        let block = build_block(&chain, vec![tx], &miner.public_key, timestamp);
        chain.add_block(block, Some(timestamp)).unwrap();

        assert_eq!(chain.height(), 1);
        assert_eq!(
            chain.state().get_account(&miner.public_key).unwrap().balance,
            90
        );
        assert_eq!(
            chain
                .state()
                .get_account(&recipient.public_key)
                .unwrap()
                .balance,
            10
        );
    }

    #[test]
    fn chain_links_and_monotonic_height() {
        let (mut chain, miner) = new_chain();
        add_empty_blocks(&mut chain, &miner.public_key, 3, 1);
        assert_eq!(chain.height(), 3);
        for height in 1..=3u64 {
            let block = chain.block_by_height(height).unwrap();
            let prev = chain.block_by_height(height - 1).unwrap();
            assert_eq!(block.header.prev_hash, prev.block_hash());
        }
    }

    #[test]
    fn post_then_endorsement_with_tip_in_one_block() {
        let (mut chain, miner) = new_chain();
        let alice = generate_keypair();
        let bob = generate_keypair();

        // fund A=15 and B=10 from the miner's genesis reward
        let funding = vec![
            signed_transfer(&miner, &alice.public_key, 15, 0, 1),
            signed_transfer(&miner, &bob.public_key, 10, 1, 1),
        ];
        let t1 = next_timestamp(&chain);
        let block = build_block(&chain, funding, &miner.public_key, t1);
        chain.add_block(block, Some(t1)).unwrap();

        let post = signed_post(&alice, "first!", 0);
        let post_hash = post.tx_hash();
        let endorse = signed_endorse(&bob, post_hash, 3, 0);
        let t2 = next_timestamp(&chain);
        let block = build_block(&chain, vec![post, endorse], &miner.public_key, t2);
        chain.add_block(block, Some(t2)).unwrap();

        assert_eq!(
            chain.state().get_account(&alice.public_key).unwrap().balance,
            17
        );
        assert_eq!(
            chain.state().get_account(&bob.public_key).unwrap().balance,
            6
        );
        assert!(chain.known_posts().contains(&post_hash));
        assert_eq!(chain.post_authors()[&post_hash], alice.public_key);
    }

    #[test]
    fn duplicate_transaction_in_block_is_rejected() {
        let (mut chain, miner) = new_chain();
        let alice = generate_keypair();
        let funding = signed_transfer(&miner, &alice.public_key, 10, 0, 1);
        let t1 = next_timestamp(&chain);
        let block = build_block(&chain, vec![funding], &miner.public_key, t1);
        chain.add_block(block, Some(t1)).unwrap();

        let post = signed_post(&alice, "once", 0);
        let t2 = next_timestamp(&chain);
        let block = build_block(
            &chain,
            vec![post.clone(), post],
            &miner.public_key,
            t2,
        );
        let err = chain.add_block(block, Some(t2)).unwrap_err();
        assert!(err.reason().contains("duplicate"));
        assert_eq!(chain.height(), 1);
    }

    #[test]
    fn wrong_coinbase_amount_is_rejected() {
        let (mut chain, miner) = new_chain();
        let timestamp = next_timestamp(&chain);
        let mut block = build_block(&chain, vec![], &miner.public_key, timestamp);
        if let Transaction::Coinbase(coinbase) = &mut block.transactions[0] {
            coinbase.amount = 9999;
        }
        let err = chain.add_block(block, Some(timestamp)).unwrap_err();
        assert!(err.reason().contains("coinbase amount"));
        assert_eq!(chain.height(), 0);
    }

    #[test]
    fn wrong_prev_hash_is_rejected() {
        let (mut chain, miner) = new_chain();
        let timestamp = next_timestamp(&chain);
        let mut block = build_block(&chain, vec![], &miner.public_key, timestamp);
        block.header.prev_hash = sha256(b"somewhere else");
        block.header.nonce = 0;
        while !block.meets_difficulty() {
            block.header.nonce += 1;
        }
        let err = chain.add_block(block, Some(timestamp)).unwrap_err();
        assert!(err.reason().contains("prev_hash"));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let (mut chain, miner) = new_chain();
        let timestamp = next_timestamp(&chain);
        let mut block = build_block(&chain, vec![], &miner.public_key, timestamp);
        block.header.version = 9;
        let err = chain.add_block(block, Some(timestamp)).unwrap_err();
        assert!(err.reason().contains("version"));
    }

    #[test]
    fn skipped_height_is_rejected() {
        let (mut chain, miner) = new_chain();
        let timestamp = next_timestamp(&chain);
        let mut block = build_block(&chain, vec![], &miner.public_key, timestamp);
        block.header.height = 5;
        let err = chain.add_block(block, Some(timestamp)).unwrap_err();
        assert!(err.reason().contains("height mismatch"));
    }

    #[test]
    fn future_timestamp_is_rejected() {
        let (mut chain, miner) = new_chain();
        let timestamp = next_timestamp(&chain);
        let block = build_block(&chain, vec![], &miner.public_key, timestamp);
        let err = chain
            .add_block(block, Some(timestamp - MAX_FUTURE_TIMESTAMP - 1))
            .unwrap_err();
        assert!(err.reason().contains("future"));
    }

    #[test]
    fn timestamp_at_or_below_median_is_rejected() {
        let (mut chain, miner) = new_chain();
        add_empty_blocks(&mut chain, &miner.public_key, 4, 10);
        let recent = chain.recent_timestamps(MEDIAN_TIME_BLOCK_COUNT);
        let stale = median(&recent) as u64;
        let block = build_block(&chain, vec![], &miner.public_key, stale);
        let err = chain.add_block(block, Some(stale + 1000)).unwrap_err();
        assert!(err.reason().contains("median"));
    }

    #[test]
    fn stale_nonce_is_rejected() {
        let (mut chain, miner) = new_chain();
        let alice = generate_keypair();
        let t1 = next_timestamp(&chain);
        let block = build_block(
            &chain,
            vec![signed_transfer(&miner, &alice.public_key, 10, 0, 1)],
            &miner.public_key,
            t1,
        );
        chain.add_block(block, Some(t1)).unwrap();

        // reuse nonce 0 for the miner
        let t2 = next_timestamp(&chain);
        let block = build_block(
            &chain,
            vec![signed_transfer(&miner, &alice.public_key, 5, 0, 1)],
            &miner.public_key,
            t2,
        );
        let err = chain.add_block(block, Some(t2)).unwrap_err();
        assert!(err.reason().contains("nonce mismatch"));
    }

    #[test]
    fn endorsing_an_unknown_post_is_rejected() {
        let (mut chain, miner) = new_chain();
        let alice = generate_keypair();
        let t1 = next_timestamp(&chain);
        let block = build_block(
            &chain,
            vec![signed_transfer(&miner, &alice.public_key, 10, 0, 1)],
            &miner.public_key,
            t1,
        );
        chain.add_block(block, Some(t1)).unwrap();

        let endorse = signed_endorse(&alice, sha256(b"no such post"), 2, 0);
        let t2 = next_timestamp(&chain);
        let block = build_block(&chain, vec![endorse], &miner.public_key, t2);
        let err = chain.add_block(block, Some(t2)).unwrap_err();
        assert!(err.reason().contains("not a known post"));
    }

    #[test]
    fn balance_is_conserved_per_block() {
        let (mut chain, miner) = new_chain();
        let alice = generate_keypair();
        let before = chain.state().total_balance();
        let timestamp = next_timestamp(&chain);
        let block = build_block(
            &chain,
            vec![signed_transfer(&miner, &alice.public_key, 10, 0, 1)],
            &miner.public_key,
            timestamp,
        );
        chain.add_block(block, Some(timestamp)).unwrap();
        assert_eq!(chain.state().total_balance(), before + block_reward(1));
    }

    #[test]
    fn difficulty_is_carried_between_windows() {
        let (mut chain, miner) = new_chain();
        add_empty_blocks(&mut chain, &miner.public_key, 5, 1);
        assert_eq!(compute_expected_difficulty(&chain, 6), GENESIS_DIFFICULTY);
    }

    #[test]
    fn fast_window_quadruples_difficulty() {
        let (mut chain, miner) = new_chain();
        // 1-second spacing is far below the 15-second target; the ratio
        // clamps at 4x.
        add_empty_blocks(&mut chain, &miner.public_key, 100, 1);
        assert_eq!(compute_expected_difficulty(&chain, 100), 4);
        assert_eq!(
            chain.block_by_height(100).unwrap().header.difficulty,
            4
        );
    }

    #[test]
    fn slow_window_quarters_difficulty() {
        let (mut chain, miner) = new_chain();
        add_empty_blocks(&mut chain, &miner.public_key, 100, 1);
        assert_eq!(chain.block_by_height(100).unwrap().header.difficulty, 4);
        // 10000-second spacing clamps the ratio at 1/4: 4 -> 1.
        add_empty_blocks(&mut chain, &miner.public_key, 100, 10_000);
        assert_eq!(compute_expected_difficulty(&chain, 200), 1);
        assert_eq!(chain.block_by_height(200).unwrap().header.difficulty, 1);
    }

    #[test]
    fn transaction_lookup_and_index() {
        let (mut chain, miner) = new_chain();
        let alice = generate_keypair();
        let tx = signed_transfer(&miner, &alice.public_key, 10, 0, 1);
        let tx_hash = tx.tx_hash();
        let timestamp = next_timestamp(&chain);
        let block = build_block(&chain, vec![tx], &miner.public_key, timestamp);
        let block_hash = block.block_hash();
        chain.add_block(block, Some(timestamp)).unwrap();

        assert!(chain.contains_transaction(&tx_hash));
        assert_eq!(
            chain.transaction_block(&tx_hash).unwrap().block_hash(),
            block_hash
        );
        assert_eq!(
            chain.transaction_by_hash(&tx_hash).unwrap().tx_hash(),
            tx_hash
        );
        assert!(chain.transaction_by_hash(&sha256(b"missing")).is_none());
    }

    #[test]
    fn post_body_limits() {
        let alice = generate_keypair();
        let ok = signed_post(&alice, &"x".repeat(POST_BODY_LIMIT), 0);
        assert!(validate_transaction_format(&ok, 0).is_ok());
        let long = signed_post(&alice, &"x".repeat(POST_BODY_LIMIT + 1), 0);
        assert!(validate_transaction_format(&long, 0).is_err());
        let empty = signed_post(&alice, "", 0);
        assert!(validate_transaction_format(&empty, 0).is_err());
    }

    #[test]
    fn endorse_message_limits() {
        let alice = generate_keypair();
        let mut ok = Transaction::Endorse(Endorse {
            author: alice.public_key,
            nonce: 0,
            target: sha256(b"post"),
            amount: 0,
            message: "y".repeat(ENDORSE_MESSAGE_LIMIT),
            gas_fee: 1,
            signature: Vec::new(),
        });
        ok.sign(&alice.secret_key);
        assert!(validate_transaction_format(&ok, 0).is_ok());

        let mut long = Transaction::Endorse(Endorse {
            author: alice.public_key,
            nonce: 0,
            target: sha256(b"post"),
            amount: 0,
            message: "y".repeat(ENDORSE_MESSAGE_LIMIT + 1),
            gas_fee: 1,
            signature: Vec::new(),
        });
        long.sign(&alice.secret_key);
        assert!(validate_transaction_format(&long, 0).is_err());
    }

    #[test]
    fn gas_fee_boundary() {
        let alice = generate_keypair();
        let mut free = Transaction::Post(Post {
            author: alice.public_key,
            nonce: 0,
            timestamp: 0,
            body: "cheap".into(),
            reply_to: None,
            gas_fee: 0,
            signature: Vec::new(),
        });
        free.sign(&alice.secret_key);
        let err = validate_transaction_format(&free, 0).unwrap_err();
        assert!(err.reason().contains("gas fee"));

        let paid = signed_post(&alice, "paid", 0);
        assert!(validate_transaction_format(&paid, 0).is_ok());
    }

    #[test]
    fn self_transfer_and_zero_amount_are_rejected() {
        let alice = generate_keypair();
        let mut self_send = Transaction::Transfer(Transfer {
            sender: alice.public_key,
            recipient: alice.public_key,
            amount: 5,
            nonce: 0,
            gas_fee: 1,
            signature: Vec::new(),
        });
        self_send.sign(&alice.secret_key);
        assert!(validate_transaction_format(&self_send, 0).is_err());

        let mut zero = Transaction::Transfer(Transfer {
            sender: alice.public_key,
            recipient: [7u8; 32],
            amount: 0,
            nonce: 0,
            gas_fee: 1,
            signature: Vec::new(),
        });
        zero.sign(&alice.secret_key);
        assert!(validate_transaction_format(&zero, 0).is_err());
    }

    #[test]
    fn tampered_signature_fails_format_validation() {
        let alice = generate_keypair();
        let mut tx = signed_post(&alice, "authentic", 0);
        if let Transaction::Post(post) = &mut tx {
            post.body = "forged".into();
        }
        let err = validate_transaction_format(&tx, 0).unwrap_err();
        assert!(err.reason().contains("signature"));
    }

    #[test]
    fn install_genesis_adopts_foreign_block() {
        let (chain_a, _) = new_chain();
        let genesis = chain_a.block_by_height(0).unwrap().clone();
        let mut chain_b = Chain::new();
        chain_b.install_genesis(genesis.clone()).unwrap();
        assert_eq!(chain_b.genesis_hash(), chain_a.genesis_hash());
        assert!(chain_b.install_genesis(genesis).is_err());
    }
}
