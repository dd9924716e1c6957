//! # Merkle Checksums
//!
//! Binary Merkle tree over fragment chunks. Leaves are SHA-256 digests of
//! the chunk data; internal nodes hash the concatenation of their children's
//! hex digests; an odd trailing node is paired with itself. The root is the
//! full 64-character hex digest carried by every fragment as a whole-message
//! integrity token.
//!
//! The tree is rebuilt on every insertion — fragment counts are small.

use sha2::{Digest, Sha256};

fn sha256_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

/// Incremental Merkle tree over fragment chunks.
#[derive(Debug, Default)]
pub struct MerkleTree {
    leaves: Vec<String>,
    root: Option<String>,
}

impl MerkleTree {
    pub fn new() -> Self {
        MerkleTree::default()
    }

    /// Add a chunk as a leaf and rebuild.
    pub fn add_leaf(&mut self, data: &str) {
        self.leaves.push(sha256_hex(data));
        self.rebuild();
    }

    /// The current root, `None` while the tree is empty.
    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    fn rebuild(&mut self) {
        if self.leaves.is_empty() {
            self.root = None;
            return;
        }

        let mut level = self.leaves.clone();
        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(2));
            for pair in level.chunks(2) {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                next.push(sha256_hex(&format!("{left}{right}")));
            }
            level = next;
        }
        self.root = level.into_iter().next();
    }
}

/// Merkle root for `data` split into chunks of `fragment_size` code units.
/// Empty data hashes the empty string.
pub fn merkle_root_for(data: &str, fragment_size: usize) -> String {
    if data.is_empty() {
        return sha256_hex("");
    }

    let mut tree = MerkleTree::new();
    let chars: Vec<char> = data.chars().collect();
    for chunk in chars.chunks(fragment_size.max(1)) {
        tree.add_leaf(&chunk.iter().collect::<String>());
    }
    tree.root().unwrap_or_default().to_string()
}
