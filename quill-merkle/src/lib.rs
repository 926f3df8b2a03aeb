use quill_codec::{sha256, Hash};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid index for merkle proof")]
pub struct ProofIndexError;

/// One level of an inclusion proof: the sibling hash and whether it sits on
/// the left side of the concatenation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofStep {
    pub hash: Hash,
    pub is_left: bool,
}

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    sha256(&buf)
}

/// Compute the Merkle root of a list of leaf hashes.
///
/// An empty list hashes to `sha256("")`; a single leaf is its own root; at
/// each level an odd count duplicates the last element.
pub fn merkle_root(hashes: &[Hash]) -> Hash {
    if hashes.is_empty() {
        return sha256(b"");
    }
    let mut level = hashes.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = level[level.len() - 1];
            level.push(last);
        }
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }
    level[0]
}

/// Generate an inclusion proof for the leaf at `index`.
pub fn merkle_proof(hashes: &[Hash], index: usize) -> Result<Vec<ProofStep>, ProofIndexError> {
    if hashes.is_empty() || index >= hashes.len() {
        return Err(ProofIndexError);
    }
    let mut proof = Vec::new();
    let mut level = hashes.to_vec();
    let mut idx = index;
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = level[level.len() - 1];
            level.push(last);
        }
        if idx % 2 == 0 {
            proof.push(ProofStep {
                hash: level[idx + 1],
                is_left: false,
            });
        } else {
            proof.push(ProofStep {
                hash: level[idx - 1],
                is_left: true,
            });
        }
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
        idx /= 2;
    }
    Ok(proof)
}

/// Rebuild the candidate root from a leaf and its proof, and compare.
pub fn verify_merkle_proof(leaf: &Hash, proof: &[ProofStep], root: &Hash) -> bool {
    let mut current = *leaf;
    for step in proof {
        current = if step.is_left {
            hash_pair(&step.hash, &current)
        } else {
            hash_pair(&current, &step.hash)
        };
    }
    current == *root
}
