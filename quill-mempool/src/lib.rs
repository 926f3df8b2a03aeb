use std::collections::HashMap;

use quill_chain::{validate_transaction_format, validate_transaction_state, Chain, ValidationError};
use quill_core::{Block, Hash, Transaction, MAX_MEMPOOL_SIZE};

/// Unconfirmed transaction pool with validation, fee-priority ordering, and
/// fee-based eviction. Reads chain state, never writes it.
#[derive(Debug)]
pub struct Mempool {
    max_size: usize,
    txs: HashMap<Hash, Transaction>,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

impl Mempool {
    pub fn new() -> Self {
        Self::with_max_size(MAX_MEMPOOL_SIZE)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            max_size,
            txs: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn contains(&self, tx_hash: &Hash) -> bool {
        self.txs.contains_key(tx_hash)
    }

    pub fn get_by_hash(&self, tx_hash: &Hash) -> Option<&Transaction> {
        self.txs.get(tx_hash)
    }

    /// Validate and admit a transaction. When the pool is full, the
    /// minimum-fee entry is evicted only for a strictly higher fee.
    pub fn add(&mut self, tx: Transaction, chain: &Chain) -> Result<Hash, ValidationError> {
        if tx.is_coinbase() {
            return Err(ValidationError::new(
                "coinbase transactions cannot be added to mempool",
            ));
        }

        let tx_hash = tx.tx_hash();
        if self.txs.contains_key(&tx_hash) {
            return Err(ValidationError::new("transaction already in mempool"));
        }
        if chain.contains_transaction(&tx_hash) {
            return Err(ValidationError::new("transaction already confirmed"));
        }

        validate_transaction_format(&tx, 0)?;
        validate_transaction_state(&tx, chain.state(), chain.known_posts())?;

        if self.txs.len() >= self.max_size {
            match self.find_lowest_fee() {
                Some((lowest_hash, lowest_fee)) if tx.gas_fee() > lowest_fee => {
                    self.txs.remove(&lowest_hash);
                }
                _ => {
                    return Err(ValidationError::new(
                        "mempool full and fee too low for eviction",
                    ));
                }
            }
        }

        self.txs.insert(tx_hash, tx);
        Ok(tx_hash)
    }

    pub fn remove(&mut self, tx_hash: &Hash) {
        self.txs.remove(tx_hash);
    }

    /// Drop every transaction confirmed by the given block.
    pub fn remove_confirmed(&mut self, block: &Block) {
        for tx in &block.transactions {
            self.txs.remove(&tx.tx_hash());
        }
    }

    /// Re-run state validation against the current chain state and purge
    /// transactions that no longer apply. Returns the dropped hashes.
    pub fn revalidate(&mut self, chain: &Chain) -> Vec<Hash> {
        let stale: Vec<Hash> = self
            .txs
            .iter()
            .filter(|(_, tx)| {
                validate_transaction_state(tx, chain.state(), chain.known_posts()).is_err()
            })
            .map(|(hash, _)| *hash)
            .collect();
        for hash in &stale {
            self.txs.remove(hash);
        }
        stale
    }

    /// Pending transactions sorted by gas fee descending; ties break on the
    /// content address so the order is deterministic.
    pub fn get_pending(&self, limit: Option<usize>) -> Vec<Transaction> {
        let mut entries: Vec<(&Hash, &Transaction)> = self.txs.iter().collect();
        entries.sort_by(|a, b| {
            b.1.gas_fee()
                .cmp(&a.1.gas_fee())
                .then_with(|| a.0.cmp(b.0))
        });
        let limit = limit.unwrap_or(entries.len());
        entries
            .into_iter()
            .take(limit)
            .map(|(_, tx)| tx.clone())
            .collect()
    }

    fn find_lowest_fee(&self) -> Option<(Hash, u64)> {
        self.txs
            .iter()
            .map(|(hash, tx)| (*hash, tx.gas_fee()))
            .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_chain::Chain;
    use quill_core::{Coinbase, Transfer};
    use quill_crypto::{generate_keypair, KeyMaterial};

    const GENESIS_TIME: u64 = 1_700_000_000;

    fn funded_chain() -> (Chain, KeyMaterial) {
        let miner = generate_keypair();
        let mut chain = Chain::new();
        chain
            .initialize_genesis(&miner.public_key, Some(GENESIS_TIME))
            .unwrap();
        (chain, miner)
    }

    fn transfer(from: &KeyMaterial, to: [u8; 32], amount: u64, nonce: u64, gas_fee: u64) -> Transaction {
        let mut tx = Transaction::Transfer(Transfer {
            sender: from.public_key,
            recipient: to,
            amount,
            nonce,
            gas_fee,
            signature: Vec::new(),
        });
        tx.sign(&from.secret_key);
        tx
    }

    #[test]
    fn admits_a_valid_transaction() {
        let (chain, miner) = funded_chain();
        let mut pool = Mempool::new();
        let tx = transfer(&miner, [7u8; 32], 10, 0, 1);
        let hash = pool.add(tx, &chain).unwrap();
        assert!(pool.contains(&hash));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn rejects_coinbase() {
        let (chain, miner) = funded_chain();
        let mut pool = Mempool::new();
        let tx = Transaction::Coinbase(Coinbase {
            recipient: miner.public_key,
            amount: 50,
            height: 1,
        });
        let err = pool.add(tx, &chain).unwrap_err();
        assert!(err.reason().contains("coinbase"));
    }

    #[test]
    fn rejects_duplicates() {
        let (chain, miner) = funded_chain();
        let mut pool = Mempool::new();
        let tx = transfer(&miner, [7u8; 32], 10, 0, 1);
        pool.add(tx.clone(), &chain).unwrap();
        let err = pool.add(tx, &chain).unwrap_err();
        assert!(err.reason().contains("already in mempool"));
    }

    #[test]
    fn rejects_unknown_sender() {
        let (chain, _) = funded_chain();
        let stranger = generate_keypair();
        let mut pool = Mempool::new();
        let err = pool
            .add(transfer(&stranger, [7u8; 32], 1, 0, 1), &chain)
            .unwrap_err();
        assert!(err.reason().contains("does not exist"));
    }

    #[test]
    fn evicts_lowest_fee_when_full() {
        let (chain, miner) = funded_chain();
        let mut pool = Mempool::with_max_size(2);
        let cheap = transfer(&miner, [1u8; 32], 1, 0, 1);
        let cheap_hash = pool.add(cheap, &chain).unwrap();
        // same sender, same nonce: distinct recipients make distinct hashes
        pool.add(transfer(&miner, [2u8; 32], 1, 0, 3), &chain).unwrap();

        let rich = transfer(&miner, [3u8; 32], 1, 0, 5);
        let rich_hash = pool.add(rich, &chain).unwrap();
        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(&cheap_hash));
        assert!(pool.contains(&rich_hash));
    }

    #[test]
    fn rejects_low_fee_when_full() {
        let (chain, miner) = funded_chain();
        let mut pool = Mempool::with_max_size(1);
        pool.add(transfer(&miner, [1u8; 32], 1, 0, 2), &chain).unwrap();
        let err = pool
            .add(transfer(&miner, [2u8; 32], 1, 0, 2), &chain)
            .unwrap_err();
        assert!(err.reason().contains("fee too low"));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn pending_is_sorted_by_fee_descending() {
        let (chain, miner) = funded_chain();
        let mut pool = Mempool::new();
        pool.add(transfer(&miner, [1u8; 32], 1, 0, 2), &chain).unwrap();
        pool.add(transfer(&miner, [2u8; 32], 1, 0, 7), &chain).unwrap();
        pool.add(transfer(&miner, [3u8; 32], 1, 0, 4), &chain).unwrap();

        let fees: Vec<u64> = pool
            .get_pending(None)
            .iter()
            .map(|tx| tx.gas_fee())
            .collect();
        assert_eq!(fees, vec![7, 4, 2]);

        let limited = pool.get_pending(Some(2));
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].gas_fee(), 7);
    }

    #[test]
    fn remove_confirmed_purges_block_transactions() {
        let (chain, miner) = funded_chain();
        let mut pool = Mempool::new();
        let tx = transfer(&miner, [7u8; 32], 10, 0, 1);
        let tx_hash = pool.add(tx.clone(), &chain).unwrap();

        let block = Block {
            header: chain.block_by_height(0).unwrap().header.clone(),
            transactions: vec![tx],
        };
        pool.remove_confirmed(&block);
        assert!(!pool.contains(&tx_hash));
    }

    #[test]
    fn revalidate_drops_stale_transactions() {
        let (mut chain, miner) = funded_chain();
        let mut pool = Mempool::new();
        // two competing nonce-0 spends; only one can ever confirm
        let loser = transfer(&miner, [7u8; 32], 5, 0, 1);
        let winner = transfer(&miner, [8u8; 32], 10, 0, 2);
        let loser_hash = pool.add(loser, &chain).unwrap();
        pool.add(winner.clone(), &chain).unwrap();

        let height = 1u64;
        let coinbase = Transaction::Coinbase(Coinbase {
            recipient: miner.public_key,
            amount: quill_core::block_reward(height),
            height,
        });
        let mut working = chain.state().clone();
        working.apply_transaction(&coinbase, &miner.public_key, None);
        working.apply_transaction(&winner, &miner.public_key, None);
        let mut block = Block {
            header: quill_core::BlockHeader {
                version: quill_core::PROTOCOL_VERSION,
                height,
                prev_hash: chain.tip().unwrap().block_hash(),
                timestamp: GENESIS_TIME + 1,
                miner: miner.public_key,
                difficulty: 1,
                nonce: 0,
                tx_merkle_root: [0u8; 32],
                state_root: working.state_root(),
                tx_count: 2,
            },
            transactions: vec![coinbase, winner],
        };
        block.header.tx_merkle_root = block.compute_tx_merkle_root();
        while !block.meets_difficulty() {
            block.header.nonce += 1;
        }
        chain.add_block(block.clone(), Some(GENESIS_TIME + 1)).unwrap();
        pool.remove_confirmed(&block);

        // the miner's nonce advanced, so the losing nonce-0 spend is stale
        let dropped = pool.revalidate(&chain);
        assert_eq!(dropped, vec![loser_hash]);
        assert!(!pool.contains(&loser_hash));
        assert!(pool.is_empty());
    }
}
