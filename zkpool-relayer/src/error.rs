//! Relayer error taxonomy.

use thiserror::Error;
use zkpool_tree::TreeError;

use crate::ledger::{LedgerError, TxHash};
use crate::store::StoreError;

/// Error surfaced by the relayer to its callers.
#[derive(Debug, Error)]
pub enum RelayerError {
    /// Malformed request; rejected before any lock or I/O.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("chain {0} is not served by this relayer")]
    UnknownChain(u64),

    /// Another submission holds this nullifier.
    #[error("nullifier {nullifier} is already being processed")]
    Conflict { nullifier: String },

    #[error("rate limited, retry in {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    /// The pool still rejected the merkle root after one resync and resubmit.
    #[error("merkle root is not known to the pool")]
    StaleRoot,

    #[error("{}", .0.message())]
    ChainSubmission(RevertReason),

    /// The transaction was sent but its fate is unknown.
    #[error("transaction {tx_hash:?} was not confirmed in time")]
    Timeout { tx_hash: TxHash },

    /// Sent, but the receipt could not be obtained. Check `tx_hash` before resubmitting.
    #[error("transaction {tx_hash:?} was sent but its receipt could not be read: {reason}")]
    Unconfirmed { tx_hash: TxHash, reason: String },

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("sync error: {0}")]
    Sync(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("tree error: {0}")]
    Tree(#[from] TreeError),
}

impl RelayerError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            RelayerError::Validation(_) => "VALIDATION_FAILED",
            RelayerError::UnknownChain(_) => "CHAIN_UNKNOWN",
            RelayerError::Conflict { .. } => "NULLIFIER_IN_FLIGHT",
            RelayerError::RateLimited { .. } => "RATE_LIMITED",
            RelayerError::StaleRoot => "STALE_ROOT",
            RelayerError::ChainSubmission(reason) => reason.code(),
            RelayerError::Timeout { .. } => "CONFIRMATION_TIMEOUT",
            RelayerError::Unconfirmed { .. } => "CONFIRMATION_UNKNOWN",
            RelayerError::Ledger(_) => "LEDGER_UNAVAILABLE",
            RelayerError::Sync(_) => "SYNC_FAILED",
            RelayerError::Store(_) => "STORE_ERROR",
            RelayerError::Tree(_) => "TREE_ERROR",
        }
    }

    /// Whether the caller may simply try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::Conflict { .. }
                | RelayerError::RateLimited { .. }
                | RelayerError::Ledger(_)
                | RelayerError::Sync(_)
        )
    }
}

/// Known pool contract revert reasons, mapped to stable user-facing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertReason {
    NullifierSpent,
    UnknownRoot,
    InvalidProof,
    InsufficientPoolBalance,
    InvalidAsset,
    InvalidChain,
    Unknown,
}

const REVERT_PATTERNS: &[(&str, RevertReason)] = &[
    ("unknown root", RevertReason::UnknownRoot),
    ("unknown merkle root", RevertReason::UnknownRoot),
    ("invalid merkle root", RevertReason::UnknownRoot),
    ("root not known", RevertReason::UnknownRoot),
    ("already spent", RevertReason::NullifierSpent),
    ("nullifier spent", RevertReason::NullifierSpent),
    ("nullifier used", RevertReason::NullifierSpent),
    ("invalid proof", RevertReason::InvalidProof),
    ("invalid transaction proof", RevertReason::InvalidProof),
    ("verification failed", RevertReason::InvalidProof),
    ("insufficient", RevertReason::InsufficientPoolBalance),
    ("exceeds balance", RevertReason::InsufficientPoolBalance),
    ("invalid asset", RevertReason::InvalidAsset),
    ("asset mismatch", RevertReason::InvalidAsset),
    ("invalid chain", RevertReason::InvalidChain),
    ("wrong chain", RevertReason::InvalidChain),
];

impl RevertReason {
    /// Classify a raw revert string; anything unrecognized is `Unknown`.
    pub fn classify(raw: &str) -> Self {
        let lower = raw.to_ascii_lowercase();
        REVERT_PATTERNS
            .iter()
            .find(|(pattern, _)| lower.contains(pattern))
            .map(|(_, reason)| *reason)
            .unwrap_or(RevertReason::Unknown)
    }

    pub fn message(&self) -> &'static str {
        match self {
            RevertReason::NullifierSpent => "this note has already been spent",
            RevertReason::UnknownRoot => "the merkle root is not known to the pool",
            RevertReason::InvalidProof => "the proof was rejected by the verifier",
            RevertReason::InsufficientPoolBalance => "the pool does not hold enough funds for this withdrawal",
            RevertReason::InvalidAsset => "the proof does not match the requested asset",
            RevertReason::InvalidChain => "the proof was generated for a different chain",
            RevertReason::Unknown => "the transaction was reverted",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RevertReason::NullifierSpent => "NULLIFIER_SPENT",
            RevertReason::UnknownRoot => "UNKNOWN_ROOT",
            RevertReason::InvalidProof => "PROOF_INVALID",
            RevertReason::InsufficientPoolBalance => "POOL_BALANCE_INSUFFICIENT",
            RevertReason::InvalidAsset => "ASSET_INVALID",
            RevertReason::InvalidChain => "CHAIN_INVALID",
            RevertReason::Unknown => "TRANSACTION_REVERTED",
        }
    }
}
