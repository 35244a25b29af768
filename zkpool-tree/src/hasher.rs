//! Two-to-one hash primitives for the commitment tree.

use ark_bn254::Fr;
use light_poseidon::{Poseidon as LightPoseidon, PoseidonBytesHasher};
use std::fmt::Debug;

use crate::TreeError;

/// BN254 scalar field modulus, big-endian.
pub const FIELD_MODULUS_BE: [u8; 32] = [
    0x30, 0x64, 0x4e, 0x72, 0xe1, 0x31, 0xa0, 0x29, 0xb8, 0x50, 0x45, 0xb6, 0x81, 0x81, 0x58, 0x5d,
    0x28, 0x33, 0xe8, 0x48, 0x79, 0xb9, 0x70, 0x91, 0x43, 0xe1, 0xf5, 0x93, 0xf0, 0x00, 0x00, 0x01,
];

/// A hash function the tree can be built over.
///
/// `zero_leaf` is the value of an empty leaf slot; every zero-subtree hash is
/// derived from it. Implementations must be deterministic.
pub trait MerkleHasher {
    type Hash: Copy + Eq + Debug + Send + Sync + 'static;

    fn zero_leaf() -> Self::Hash;

    fn hash(left: &Self::Hash, right: &Self::Hash) -> Result<Self::Hash, TreeError>;
}

/// Circom-compatible Poseidon over the BN254 scalar field with arity 2.
///
/// Hashes are big-endian 32-byte encodings of field elements, which is also
/// how the pool contract stores them as `bytes32`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Poseidon;

impl MerkleHasher for Poseidon {
    type Hash = [u8; 32];

    fn zero_leaf() -> Self::Hash {
        [0u8; 32]
    }

    fn hash(left: &Self::Hash, right: &Self::Hash) -> Result<Self::Hash, TreeError> {
        let mut poseidon = LightPoseidon::<Fr>::new_circom(2)
            .map_err(|e| TreeError::Hash(e.to_string()))?;
        poseidon
            .hash_bytes_be(&[left.as_slice(), right.as_slice()])
            .map_err(|e| TreeError::Hash(e.to_string()))
    }
}

/// Returns true when the big-endian value is a canonical field element.
pub fn is_canonical(value: &[u8; 32]) -> bool {
    value < &FIELD_MODULUS_BE
}
