use quill_chain::{
    compute_expected_difficulty, median, validate_transaction_format, validate_transaction_state,
    Chain, ValidationError,
};
use quill_codec::canonicalize;
use quill_core::{
    block_reward, unix_time, Block, BlockHeader, Coinbase, PubKey, Transaction,
    MAX_BLOCK_SIZE, MEDIAN_TIME_BLOCK_COUNT, PROTOCOL_VERSION,
};
use quill_mempool::Mempool;

/// Assembles candidate blocks from the mempool and grinds nonces.
#[derive(Debug, Clone)]
pub struct Miner {
    pubkey: PubKey,
}

impl Miner {
    pub fn new(pubkey: PubKey) -> Self {
        Self { pubkey }
    }

    pub fn pubkey(&self) -> &PubKey {
        &self.pubkey
    }

    /// Build a candidate block from pending transactions, ready for PoW.
    ///
    /// Candidates are re-validated against a working state as they are
    /// selected, so nonce chains across a single block assemble correctly
    /// and stale entries are skipped rather than poisoning the template.
    pub fn create_block_template(&self, chain: &Chain, mempool: &Mempool) -> Block {
        let height = (chain.height() + 1) as u64;
        let prev_hash = chain.tip().map(|b| b.block_hash()).unwrap_or([0u8; 32]);
        let difficulty = compute_expected_difficulty(chain, height);

        // timestamp must exceed the median of recent blocks
        let mut timestamp = unix_time();
        let recent = chain.recent_timestamps(MEDIAN_TIME_BLOCK_COUNT);
        if !recent.is_empty() {
            timestamp = timestamp.max(median(&recent) as u64 + 1);
        }

        let coinbase = Transaction::Coinbase(Coinbase {
            recipient: self.pubkey,
            amount: block_reward(height),
            height,
        });

        let mut working_state = chain.state().clone();
        working_state.apply_transaction(&coinbase, &self.pubkey, None);
        let mut working_posts = chain.known_posts().clone();
        let mut working_authors = chain.post_authors().clone();

        let mut selected = vec![coinbase];
        let mut size_estimate = estimate_size(&selected);

        for tx in mempool.get_pending(None) {
            // nonces and balances may have shifted under earlier selections
            if validate_transaction_format(&tx, height).is_err() {
                continue;
            }
            if validate_transaction_state(&tx, &working_state, &working_posts).is_err() {
                continue;
            }

            let tx_size = canonical_len(&tx);
            if size_estimate + tx_size > MAX_BLOCK_SIZE {
                break;
            }
            size_estimate += tx_size;

            let target_author = match &tx {
                Transaction::Endorse(endorse) if endorse.amount > 0 => {
                    working_authors.get(&endorse.target).copied()
                }
                _ => None,
            };
            working_state.apply_transaction(&tx, &self.pubkey, target_author.as_ref());

            if let Transaction::Post(post) = &tx {
                let tx_hash = tx.tx_hash();
                working_posts.insert(tx_hash);
                working_authors.insert(tx_hash, post.author);
            }
            selected.push(tx);
        }

        let header = BlockHeader {
            version: PROTOCOL_VERSION,
            height,
            prev_hash,
            timestamp,
            miner: self.pubkey,
            difficulty,
            nonce: 0,
            tx_merkle_root: [0u8; 32],
            state_root: working_state.state_root(),
            tx_count: selected.len() as u64,
        };
        let mut block = Block {
            header,
            transactions: selected,
        };
        block.header.tx_merkle_root = block.compute_tx_merkle_root();
        block
    }

    /// Template, grind, append, purge: the synchronous mining convenience.
    pub fn mine_next(&self, chain: &mut Chain, mempool: &mut Mempool) -> Result<Block, ValidationError> {
        let mut block = self.create_block_template(chain, mempool);
        mine_block(&mut block, 0);
        chain.add_block(block.clone(), Some(block.header.timestamp + 1))?;
        mempool.remove_confirmed(&block);
        mempool.revalidate(chain);
        Ok(block)
    }
}

/// Grind the nonce until the difficulty target is met. A `max_iterations`
/// of zero grinds without bound; otherwise returns false when the budget is
/// exhausted, leaving the nonce where it stopped so grinding can resume.
pub fn mine_block(block: &mut Block, max_iterations: u64) -> bool {
    let mut iterations = 0u64;
    while !block.meets_difficulty() {
        block.header.nonce = block.header.nonce.wrapping_add(1);
        iterations += 1;
        if max_iterations > 0 && iterations >= max_iterations {
            return false;
        }
    }
    true
}

fn canonical_len(tx: &Transaction) -> usize {
    canonicalize(&serde_json::to_value(tx).unwrap(), &[]).len()
}

/// Rough byte estimate for a block carrying these transactions.
fn estimate_size(txs: &[Transaction]) -> usize {
    // header overhead estimate
    200 + txs.iter().map(canonical_len).sum::<usize>()
}
