//! Tree vs. pool consistency report.

use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::{
    chains::{ChainContext, ChainRegistry},
    error::RelayerError,
    ledger::LedgerError,
    signals::bytes_hex,
};

/// Default lag, in blocks, at which a chain stops being healthy. The gap must stay strictly below it.
pub const DEFAULT_MAX_SYNC_GAP: u64 = 10;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TreeHealth {
    pub leaf_count: u64,
    pub root: String,
    pub last_synced_block: Option<u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OnChainHealth {
    pub current_root: String,
    pub deposit_queue_tail: u64,
    pub head_block: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub chain_id: u64,
    pub ok: bool,
    pub tree: TreeHealth,
    /// `None` when the ledger could not be read.
    pub on_chain: Option<OnChainHealth>,
    pub root_match: bool,
    pub sync_gap: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct HealthReporter {
    chains: Arc<ChainRegistry>,
    max_sync_gap: u64,
}

impl HealthReporter {
    pub fn new(chains: Arc<ChainRegistry>, max_sync_gap: u64) -> Self {
        Self {
            chains,
            max_sync_gap,
        }
    }

    /// Report for one chain. Ledger failures degrade the report instead of failing it.
    pub async fn report(&self, chain_id: u64) -> Result<HealthReport, RelayerError> {
        let chain = self.chains.get(chain_id)?;
        Ok(self.report_chain(chain).await)
    }

    pub async fn report_all(&self) -> Vec<HealthReport> {
        let reports = self.chains.iter().map(|chain| self.report_chain(chain));
        futures::future::join_all(reports).await
    }

    async fn report_chain(&self, chain: &ChainContext) -> HealthReport {
        let snapshot = chain.replayer.snapshot().await;
        let tree = TreeHealth {
            leaf_count: snapshot.leaf_count,
            root: bytes_hex(&snapshot.root),
            last_synced_block: snapshot.last_synced_block,
        };

        match read_on_chain(chain).await {
            Ok((current_root, on_chain)) => {
                let root_match = current_root == snapshot.root;
                // Blocks up to and including the head that are not yet applied.
                let sync_gap = on_chain
                    .head_block
                    .saturating_add(1)
                    .saturating_sub(snapshot.next_block);
                HealthReport {
                    chain_id: chain.chain_id,
                    ok: root_match && sync_gap < self.max_sync_gap,
                    tree,
                    on_chain: Some(on_chain),
                    root_match,
                    sync_gap,
                    error: None,
                }
            }
            Err(e) => {
                warn!("Health check could not read chain {}: {}", chain.chain_id, e);
                HealthReport {
                    chain_id: chain.chain_id,
                    ok: false,
                    tree,
                    on_chain: None,
                    root_match: false,
                    sync_gap: 0,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

async fn read_on_chain(chain: &ChainContext) -> Result<([u8; 32], OnChainHealth), LedgerError> {
    let current_root = chain.ledger.current_root().await?;
    let deposit_queue_tail = chain.ledger.deposit_queue_tail().await?;
    let head_block = chain.ledger.block_number().await?;
    Ok((
        current_root,
        OnChainHealth {
            current_root: bytes_hex(&current_root),
            deposit_queue_tail,
            head_block,
        },
    ))
}
