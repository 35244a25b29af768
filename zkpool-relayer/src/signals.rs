//! Public signals of a pool transaction proof.
//!
//! The circuit exposes nine public values in a fixed order. Everything the
//! relayer checks before touching the chain is derived from them.

use ethers::{
    abi::{self, Token},
    types::{Address, U256},
    utils::keccak256,
};
use once_cell::sync::Lazy;
use zkpool_tree::FIELD_MODULUS_BE;

use crate::error::RelayerError;

/// Number of public signals emitted by the transaction circuit.
pub const SIGNAL_COUNT: usize = 9;

/// Serialized Groth16 proof: `a` (2 words), `b` (4 words), `c` (2 words).
pub const PROOF_LEN: usize = 256;

/// BN254 scalar field modulus.
pub static FIELD_MODULUS: Lazy<U256> = Lazy::new(|| U256::from_big_endian(&FIELD_MODULUS_BE));

/// Decoded public signals, in circuit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicSignals {
    pub merkle_root: U256,
    pub nullifier0: U256,
    /// Zero when the transaction spends a single note.
    pub nullifier1: U256,
    pub out_commitment0: U256,
    pub out_commitment1: U256,
    pub public_amount: U256,
    pub public_asset: U256,
    pub recipient: U256,
    pub chain_id: U256,
}

impl PublicSignals {
    /// Build from the raw signal list, enforcing count and field bounds.
    pub fn from_values(values: &[U256]) -> Result<Self, RelayerError> {
        if values.len() != SIGNAL_COUNT {
            return Err(RelayerError::Validation(format!(
                "expected {} public signals, got {}",
                SIGNAL_COUNT,
                values.len()
            )));
        }
        if let Some(position) = values.iter().position(|v| *v >= *FIELD_MODULUS) {
            return Err(RelayerError::Validation(format!(
                "public signal {} is not a field element",
                position
            )));
        }

        Ok(Self {
            merkle_root: values[0],
            nullifier0: values[1],
            nullifier1: values[2],
            out_commitment0: values[3],
            out_commitment1: values[4],
            public_amount: values[5],
            public_asset: values[6],
            recipient: values[7],
            chain_id: values[8],
        })
    }

    /// Nullifiers that must be locked, in acquisition order.
    pub fn nullifiers(&self) -> Vec<U256> {
        if self.nullifier1.is_zero() {
            vec![self.nullifier0]
        } else {
            vec![self.nullifier0, self.nullifier1]
        }
    }

    /// Chain id signal, if it fits a `u64`.
    pub fn chain_id(&self) -> Option<u64> {
        (self.chain_id <= U256::from(u64::MAX)).then(|| self.chain_id.low_u64())
    }

    pub fn recipient_address(&self) -> Result<Address, RelayerError> {
        if self.recipient.bits() > 160 {
            return Err(RelayerError::Validation(
                "recipient signal is wider than an address".into(),
            ));
        }
        Ok(Address::from_slice(&field_to_bytes(self.recipient)[12..]))
    }
}

/// Parse a field element given as decimal (snarkjs output) or `0x` hex.
pub fn parse_field(raw: &str) -> Result<U256, RelayerError> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(digits) => U256::from_str_radix(digits, 16).ok(),
        None => U256::from_dec_str(raw).ok(),
    };
    let value = parsed
        .ok_or_else(|| RelayerError::Validation(format!("invalid field element {:?}", raw)))?;
    if value >= *FIELD_MODULUS {
        return Err(RelayerError::Validation(format!(
            "value {} exceeds the field modulus",
            raw
        )));
    }
    Ok(value)
}

/// Deterministic asset id binding a token to a chain:
/// `keccak256(abi.encode(uint256 chainId, address token)) mod p`.
pub fn asset_id(chain_id: u64, token: Address) -> U256 {
    let encoded = abi::encode(&[Token::Uint(U256::from(chain_id)), Token::Address(token)]);
    U256::from_big_endian(&keccak256(encoded)) % *FIELD_MODULUS
}

pub fn field_to_bytes(value: U256) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    value.to_big_endian(&mut bytes);
    bytes
}

pub fn bytes_to_field(bytes: &[u8; 32]) -> U256 {
    U256::from_big_endian(bytes)
}

/// Canonical `0x`-prefixed, 64-digit hex form used as the nullifier key.
pub fn field_hex(value: U256) -> String {
    bytes_hex(&field_to_bytes(value))
}

pub fn bytes_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}
