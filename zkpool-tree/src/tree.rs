//! Incremental Merkle tree with bounded root history.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::{MerkleHasher, TreeError, ZeroHashes};

/// Number of roots the pool contract accepts as "known".
pub const DEFAULT_ROOT_HISTORY: usize = 100;

/// Fixed-depth, append-only Merkle tree.
///
/// Insertion follows the contract algorithm (`filled_subtrees` + zero hashes).
/// On top of that every node's latest value is retained per level, which is
/// what makes inclusion proofs for old indices and historical roots cheap:
/// a complete subtree never changes once its last leaf lands, and an empty
/// subtree is always the zero hash for its level.
#[derive(Debug, Clone)]
pub struct IncrementalMerkleTree<H: MerkleHasher> {
    depth: usize,
    zeros: Arc<ZeroHashes<H>>,
    filled_subtrees: Vec<H::Hash>,
    next_index: u64,
    roots: VecDeque<H::Hash>,
    history_capacity: usize,
    /// `nodes[level][i]` is the current value of node `i` at `level`; level 0 holds the leaves.
    nodes: Vec<Vec<H::Hash>>,
}

impl<H: MerkleHasher> IncrementalMerkleTree<H> {
    /// Empty tree with the default root history.
    pub fn new(depth: usize) -> Result<Self, TreeError> {
        Self::with_history(depth, DEFAULT_ROOT_HISTORY)
    }

    /// Empty tree keeping the last `history_capacity` roots.
    pub fn with_history(depth: usize, history_capacity: usize) -> Result<Self, TreeError> {
        let zeros = Arc::new(ZeroHashes::new(depth)?);
        Self::with_zeros(zeros, depth, history_capacity)
    }

    /// Empty tree sharing a precomputed zero table.
    ///
    /// The table may be deeper than the tree; only levels `0..=depth` are used.
    pub fn with_zeros(
        zeros: Arc<ZeroHashes<H>>,
        depth: usize,
        history_capacity: usize,
    ) -> Result<Self, TreeError> {
        if depth == 0 || depth > zeros.depth() {
            return Err(TreeError::InvalidDepth(depth));
        }

        let filled_subtrees = (0..depth).map(|level| zeros.get(level)).collect();
        let mut roots = VecDeque::with_capacity(history_capacity.max(1) + 1);
        roots.push_back(zeros.get(depth));

        Ok(Self {
            depth,
            zeros,
            filled_subtrees,
            next_index: 0,
            roots,
            history_capacity: history_capacity.max(1),
            nodes: vec![Vec::new(); depth + 1],
        })
    }

    /// Rebuild a tree from an ordered leaf list (cold start).
    ///
    /// Builds each level once instead of replaying per-leaf paths, then
    /// reconstructs the tail of the root history from the node layers. The
    /// result is identical to inserting the leaves one by one.
    pub fn from_leaves(
        zeros: Arc<ZeroHashes<H>>,
        depth: usize,
        history_capacity: usize,
        leaves: &[H::Hash],
    ) -> Result<Self, TreeError> {
        let mut tree = Self::with_zeros(zeros, depth, history_capacity)?;
        let size = leaves.len() as u64;
        if size > tree.capacity() {
            return Err(TreeError::TreeFull {
                capacity: tree.capacity(),
            });
        }
        if size == 0 {
            return Ok(tree);
        }

        tree.nodes[0] = leaves.to_vec();
        for level in 1..=depth {
            let below = &tree.nodes[level - 1];
            let zero = tree.zeros.get(level - 1);
            let layer = below
                .chunks(2)
                .map(|pair| H::hash(&pair[0], pair.get(1).unwrap_or(&zero)))
                .collect::<Result<Vec<_>, _>>()?;
            tree.nodes[level] = layer;
        }

        let last = size - 1;
        for level in 0..depth {
            let k = (last >> level) as usize;
            let left = if k % 2 == 0 { k } else { k - 1 };
            tree.filled_subtrees[level] = tree.nodes[level][left];
        }
        tree.next_index = size;

        let first = size.saturating_sub(tree.history_capacity as u64 - 1);
        tree.roots.clear();
        for tree_size in first..=size {
            let root = tree.node_at(depth, 0, tree_size)?;
            tree.roots.push_back(root);
        }

        Ok(tree)
    }

    /// Append a leaf and return its index.
    pub fn insert(&mut self, leaf: H::Hash) -> Result<u64, TreeError> {
        let index = self.next_index;
        if index >= self.capacity() {
            return Err(TreeError::TreeFull {
                capacity: self.capacity(),
            });
        }

        // Hash the whole path before touching any state so a hash failure leaves the tree intact.
        let mut path = Vec::with_capacity(self.depth + 1);
        let mut current = leaf;
        let mut current_index = index;
        for level in 0..self.depth {
            path.push(current);
            current = if current_index % 2 == 0 {
                H::hash(&current, &self.zeros.get(level))?
            } else {
                H::hash(&self.filled_subtrees[level], &current)?
            };
            current_index >>= 1;
        }
        path.push(current);

        for (level, node) in path.into_iter().enumerate() {
            let k = (index >> level) as usize;
            if level < self.depth && k % 2 == 0 {
                self.filled_subtrees[level] = node;
            }
            let layer = &mut self.nodes[level];
            if k < layer.len() {
                layer[k] = node;
            } else {
                layer.push(node);
            }
        }

        self.roots.push_back(current);
        if self.roots.len() > self.history_capacity {
            self.roots.pop_front();
        }
        self.next_index += 1;

        Ok(index)
    }

    /// Current root (last entry of the history).
    pub fn root(&self) -> H::Hash {
        *self
            .roots
            .back()
            .unwrap_or(&self.zeros.get(self.depth))
    }

    /// Root history, oldest first.
    pub fn roots(&self) -> impl Iterator<Item = &H::Hash> {
        self.roots.iter()
    }

    pub fn is_known_root(&self, root: &H::Hash) -> bool {
        self.roots.iter().rev().any(|known| known == root)
    }

    /// Inclusion proof for `index` against the current root.
    pub fn proof(&self, index: u64) -> Result<MerkleProof<H::Hash>, TreeError> {
        self.proof_at(index, self.next_index)
    }

    /// Inclusion proof for `index` against the root the tree had when it held
    /// `tree_size` leaves.
    pub fn proof_at(&self, index: u64, tree_size: u64) -> Result<MerkleProof<H::Hash>, TreeError> {
        if index >= tree_size || tree_size > self.next_index {
            return Err(TreeError::IndexOutOfRange {
                index,
                size: tree_size.min(self.next_index),
            });
        }

        let mut siblings = Vec::with_capacity(self.depth);
        let mut k = index;
        for level in 0..self.depth {
            siblings.push(self.node_at(level, k ^ 1, tree_size)?);
            k >>= 1;
        }

        Ok(MerkleProof {
            leaf: self.nodes[0][index as usize],
            index,
            siblings,
        })
    }

    /// Root of the tree as it was with `tree_size` leaves.
    pub fn root_at(&self, tree_size: u64) -> Result<H::Hash, TreeError> {
        if tree_size > self.next_index {
            return Err(TreeError::IndexOutOfRange {
                index: tree_size,
                size: self.next_index,
            });
        }
        self.node_at(self.depth, 0, tree_size)
    }

    fn node_at(&self, level: usize, k: u64, tree_size: u64) -> Result<H::Hash, TreeError> {
        let span = 1u64 << level;
        let start = k * span;
        if start >= tree_size {
            return Ok(self.zeros.get(level));
        }
        if start + span <= tree_size || tree_size == self.next_index {
            return Ok(self.nodes[level][k as usize]);
        }
        let left = self.node_at(level - 1, 2 * k, tree_size)?;
        let right = self.node_at(level - 1, 2 * k + 1, tree_size)?;
        H::hash(&left, &right)
    }

    pub fn leaf(&self, index: u64) -> Option<H::Hash> {
        self.nodes[0].get(index as usize).copied()
    }

    pub fn leaves(&self) -> &[H::Hash] {
        &self.nodes[0]
    }

    /// Number of leaves inserted so far (the next free index).
    pub fn len(&self) -> u64 {
        self.next_index
    }

    pub fn is_empty(&self) -> bool {
        self.next_index == 0
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Maximum number of leaves, `2^depth`.
    pub fn capacity(&self) -> u64 {
        1u64 << self.depth
    }

    pub fn history_capacity(&self) -> usize {
        self.history_capacity
    }
}

/// Sibling path from a leaf up to the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof<T> {
    pub leaf: T,
    pub index: u64,
    /// Siblings ordered from the leaf level upwards.
    pub siblings: Vec<T>,
}

impl<T: Copy + Eq> MerkleProof<T> {
    /// Fold the path back into a root.
    pub fn compute_root<H>(&self) -> Result<T, TreeError>
    where
        H: MerkleHasher<Hash = T>,
    {
        let mut current = self.leaf;
        let mut k = self.index;
        for sibling in &self.siblings {
            current = if k % 2 == 0 {
                H::hash(&current, sibling)?
            } else {
                H::hash(sibling, &current)?
            };
            k >>= 1;
        }
        Ok(current)
    }

    pub fn verify<H>(&self, root: &T) -> bool
    where
        H: MerkleHasher<Hash = T>,
    {
        matches!(self.compute_root::<H>(), Ok(computed) if computed == *root)
    }

    /// Left/right position bits, leaf level first (0 = node is the left child).
    pub fn path_indices(&self) -> Vec<u8> {
        (0..self.siblings.len())
            .map(|level| ((self.index >> level) & 1) as u8)
            .collect()
    }
}
