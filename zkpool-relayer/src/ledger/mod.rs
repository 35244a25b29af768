//! The pool contract as seen by the relayer.
//!
//! Everything chain-facing goes through [`Ledger`], so the replayer and the
//! submission pipeline can be driven by the EVM client in production and by
//! scripted ledgers in tests.

mod evm;

pub use evm::{EvmLedger, LEAF_QUEUED_SIGNATURE};

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use std::time::Duration;
use thiserror::Error;

use crate::signals::{field_to_bytes, PublicSignals};

pub type TxHash = H256;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("transaction reverted: {}", .0.as_deref().unwrap_or("no reason given"))]
    Reverted(Option<String>),

    #[error("confirmation timed out for {0:?}")]
    Timeout(TxHash),

    #[error("transaction {0:?} dropped from the mempool")]
    Dropped(TxHash),

    #[error("decode error: {0}")]
    Decode(String),
}

/// A leaf appended to the pool's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafEvent {
    pub commitment: [u8; 32],
    /// Index emitted by the contract, when the event carries one.
    pub leaf_index: Option<u64>,
    pub block_number: u64,
    pub tx_index: u64,
    pub log_index: u64,
}

impl LeafEvent {
    /// Chain order of the event. Log indices are unique per block.
    pub fn ordering_key(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

/// Arguments of the pool's `withdraw` entry point.
///
/// Transfers use the same call with `public_amount == 0` and the zero
/// address as token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawCall {
    pub proof: Bytes,
    pub merkle_root: [u8; 32],
    pub nullifier0: [u8; 32],
    pub nullifier1: [u8; 32],
    pub out_commitment0: [u8; 32],
    pub out_commitment1: [u8; 32],
    pub public_amount: U256,
    pub public_asset: U256,
    pub recipient: Address,
    pub token: Address,
}

impl WithdrawCall {
    pub fn new(proof: Bytes, signals: &PublicSignals, recipient: Address, token: Address) -> Self {
        Self {
            proof,
            merkle_root: field_to_bytes(signals.merkle_root),
            nullifier0: field_to_bytes(signals.nullifier0),
            nullifier1: field_to_bytes(signals.nullifier1),
            out_commitment0: field_to_bytes(signals.out_commitment0),
            out_commitment1: field_to_bytes(signals.out_commitment1),
            public_amount: signals.public_amount,
            public_asset: signals.public_asset,
            recipient,
            token,
        }
    }
}

/// Receipt summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub success: bool,
}

/// Read and write surface of one pool deployment on one chain.
#[async_trait]
pub trait Ledger: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Current chain head.
    async fn block_number(&self) -> Result<u64, LedgerError>;

    async fn current_root_index(&self) -> Result<u64, LedgerError>;

    async fn root_at(&self, index: u64) -> Result<[u8; 32], LedgerError>;

    /// Root the pool currently treats as latest.
    async fn current_root(&self) -> Result<[u8; 32], LedgerError> {
        let index = self.current_root_index().await?;
        self.root_at(index).await
    }

    async fn deposit_queue_tail(&self) -> Result<u64, LedgerError>;

    /// Queued-leaf events in `from_block..=to_block`, in any order.
    async fn leaf_events(&self, from_block: u64, to_block: u64) -> Result<Vec<LeafEvent>, LedgerError>;

    /// Publish a root computed off-chain so proofs against it become valid.
    async fn post_root(&self, root: [u8; 32]) -> Result<TxHash, LedgerError>;

    async fn submit_withdraw(&self, call: &WithdrawCall) -> Result<TxHash, LedgerError>;

    /// Wait for inclusion. Elapsing `timeout` yields [`LedgerError::Timeout`];
    /// the transaction itself is left alone.
    async fn wait_for_confirmation(
        &self,
        tx_hash: TxHash,
        timeout: Duration,
    ) -> Result<Confirmation, LedgerError>;
}
