//! zkpool-tree
//!
//! Fixed-depth append-only Merkle tree used by the zkpool relayer to mirror the
//! pool contract's commitment tree.
//!
//! The tree keeps the same `filled_subtrees` bookkeeping as the on-chain
//! contract so both sides produce bit-identical roots for the same leaf
//! sequence, plus enough node history to hand out inclusion proofs for any
//! inserted leaf.

pub mod hasher;
pub mod tree;
pub mod zeros;

pub use hasher::{is_canonical, MerkleHasher, Poseidon, FIELD_MODULUS_BE};
pub use tree::{IncrementalMerkleTree, MerkleProof, DEFAULT_ROOT_HISTORY};
pub use zeros::{poseidon_zeros, ZeroHashes, MAX_DEPTH};

use thiserror::Error;

/// Errors raised by the commitment tree.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TreeError {
    /// Depth outside `1..=MAX_DEPTH`.
    #[error("invalid tree depth {0}, expected 1..=32")]
    InvalidDepth(usize),

    /// All `2^depth` leaf slots are used.
    #[error("merkle tree is full ({capacity} leaves)")]
    TreeFull { capacity: u64 },

    /// Requested leaf has not been inserted (or lies beyond the requested tree size).
    #[error("leaf index {index} out of range (tree size {size})")]
    IndexOutOfRange { index: u64, size: u64 },

    /// The hash primitive rejected its inputs.
    #[error("hash error: {0}")]
    Hash(String),
}
