//! zkpool-relayer
//!
//! Relayer for the zkpool shielded pool. It mirrors the pool's Merkle tree
//! from queued-leaf events, serves inclusion proofs, and submits users'
//! withdraw/transfer proofs so they never pay gas from a linked address.
//!
//! Architecture:
//! 1. [`replayer::EventReplayer`] keeps one tree per chain in step with the pool
//! 2. [`pipeline::SubmissionPipeline`] validates, deduplicates and relays proofs
//! 3. [`health::HealthReporter`] compares local state with the pool
//! 4. [`api`] exposes all of it over HTTP

pub mod api;
pub mod chains;
pub mod config;
pub mod cooldown;
pub mod error;
pub mod guard;
pub mod health;
pub mod ledger;
pub mod pipeline;
pub mod replayer;
pub mod signals;
pub mod store;

pub use api::{app_router, AppState};
pub use chains::{ChainContext, ChainRegistry};
pub use config::{ChainConfig, RelayerConfig};
pub use cooldown::{CooldownDecision, CooldownStore};
pub use error::{RelayerError, RevertReason};
pub use guard::{NullifierGuard, NullifierLease};
pub use health::{HealthReport, HealthReporter};
pub use ledger::{Confirmation, EvmLedger, LeafEvent, Ledger, LedgerError, TxHash, WithdrawCall};
pub use pipeline::{PipelineConfig, RequestKind, SubmissionPipeline, SubmitOutcome, SubmitRequest};
pub use replayer::{EventReplayer, ReplayerConfig, SyncSnapshot};
pub use signals::PublicSignals;
pub use store::{SyncState, SyncStore};
