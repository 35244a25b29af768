//! Precomputed empty-subtree hashes.
//!
//! `zeros[0]` is the empty leaf and `zeros[i] = H(zeros[i-1], zeros[i-1])`.
//! The pool contract derives its table the same way, so the empty root and
//! every partially filled subtree line up bit for bit.

use once_cell::sync::Lazy;
use std::sync::Arc;

use crate::{hasher::Poseidon, MerkleHasher, TreeError};

/// Deepest tree supported. Leaf indices are `u64`, proofs are built level by level.
pub const MAX_DEPTH: usize = 32;

static POSEIDON_ZEROS: Lazy<Result<Arc<ZeroHashes<Poseidon>>, TreeError>> =
    Lazy::new(|| ZeroHashes::new(MAX_DEPTH).map(Arc::new));

/// Per-level hash of an all-empty subtree, for levels `0..=depth`.
#[derive(Debug, Clone)]
pub struct ZeroHashes<H: MerkleHasher> {
    levels: Vec<H::Hash>,
}

impl<H: MerkleHasher> ZeroHashes<H> {
    /// Compute the table for a tree of `depth` levels.
    pub fn new(depth: usize) -> Result<Self, TreeError> {
        if depth == 0 || depth > MAX_DEPTH {
            return Err(TreeError::InvalidDepth(depth));
        }

        let mut levels = Vec::with_capacity(depth + 1);
        let mut current = H::zero_leaf();
        levels.push(current);
        for _ in 0..depth {
            current = H::hash(&current, &current)?;
            levels.push(current);
        }

        Ok(Self { levels })
    }

    /// Deepest level covered by this table.
    pub fn depth(&self) -> usize {
        self.levels.len() - 1
    }

    /// Empty-subtree hash at `level` (0 = leaf).
    ///
    /// # Panics
    /// Panics if `level > self.depth()`; trees never ask for levels above their own depth.
    pub fn get(&self, level: usize) -> H::Hash {
        self.levels[level]
    }

    /// Root of an empty tree of the given depth.
    pub fn empty_root(&self, depth: usize) -> Option<H::Hash> {
        self.levels.get(depth).copied()
    }

    pub fn as_slice(&self) -> &[H::Hash] {
        &self.levels
    }
}

/// Process-wide Poseidon table, computed on first use for `MAX_DEPTH` levels.
pub fn poseidon_zeros() -> Result<Arc<ZeroHashes<Poseidon>>, TreeError> {
    (*POSEIDON_ZEROS).clone()
}
