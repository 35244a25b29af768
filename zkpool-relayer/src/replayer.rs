//! Rebuilds the pool's Merkle tree from queued-leaf events.

use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zkpool_tree::{
    is_canonical, poseidon_zeros, IncrementalMerkleTree, MerkleProof, Poseidon, DEFAULT_ROOT_HISTORY,
};

use crate::{
    error::RelayerError,
    ledger::{LeafEvent, Ledger, TxHash},
    signals::bytes_hex,
    store::{SyncState, SyncStore},
};

pub type PoolTree = IncrementalMerkleTree<Poseidon>;

#[derive(Debug, Clone)]
pub struct ReplayerConfig {
    pub tree_depth: usize,
    pub root_history: usize,
    /// Deployment block of the pool; nothing before it is scanned.
    pub start_block: u64,
    /// Largest block span requested per `leaf_events` call.
    pub max_block_range: u64,
    pub confirmation_timeout: Duration,
}

impl Default for ReplayerConfig {
    fn default() -> Self {
        Self {
            tree_depth: 20,
            root_history: DEFAULT_ROOT_HISTORY,
            start_block: 0,
            max_block_range: 2_000,
            confirmation_timeout: Duration::from_secs(120),
        }
    }
}

/// Point-in-time view of the local tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSnapshot {
    pub chain_id: u64,
    pub leaf_count: u64,
    pub root: [u8; 32],
    pub last_synced_block: Option<u64>,
    /// First block the next sync will scan.
    pub next_block: u64,
}

struct ReplayState {
    tree: PoolTree,
    sync: SyncState,
}

/// Per-chain tree synchronizer.
///
/// All mutation happens under one async mutex, so a background poll and a
/// pre-submission sync never interleave their inserts.
pub struct EventReplayer {
    chain_id: u64,
    ledger: Arc<dyn Ledger>,
    store: SyncStore,
    config: ReplayerConfig,
    state: Mutex<ReplayState>,
}

impl EventReplayer {
    /// Restore the tree from the store, or start empty at `start_block`.
    pub fn open(
        ledger: Arc<dyn Ledger>,
        store: SyncStore,
        config: ReplayerConfig,
    ) -> Result<Self, RelayerError> {
        let chain_id = ledger.chain_id();
        let state = load_state(&store, chain_id, &config)?;

        info!(
            "Replayer for chain {} restored {} leaves, resuming at block {}",
            chain_id,
            state.sync.leaf_count,
            state.sync.next_block(config.start_block)
        );

        Ok(Self {
            chain_id,
            ledger,
            store,
            config,
            state: Mutex::new(state),
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Pull every event up to the current head into the tree.
    pub async fn sync(&self) -> Result<SyncSnapshot, RelayerError> {
        let mut state = self.state.lock().await;
        self.sync_locked(&mut state).await?;
        Ok(self.snapshot_of(&state))
    }

    /// Sync, then make sure the pool knows the resulting root.
    pub async fn sync_and_publish(&self) -> Result<SyncSnapshot, RelayerError> {
        let mut state = self.state.lock().await;
        self.sync_locked(&mut state).await?;
        self.publish_locked(&state).await?;
        Ok(self.snapshot_of(&state))
    }

    /// Post the local root if the pool's current root differs.
    ///
    /// Returns the `postRoot` transaction when one was sent.
    pub async fn publish_root_if_stale(&self) -> Result<Option<TxHash>, RelayerError> {
        let state = self.state.lock().await;
        self.publish_locked(&state).await
    }

    pub async fn snapshot(&self) -> SyncSnapshot {
        let state = self.state.lock().await;
        self.snapshot_of(&state)
    }

    pub async fn root(&self) -> [u8; 32] {
        self.state.lock().await.tree.root()
    }

    pub async fn is_known_root(&self, root: &[u8; 32]) -> bool {
        self.state.lock().await.tree.is_known_root(root)
    }

    /// Inclusion proof for `index` against the current root.
    pub async fn proof(&self, index: u64) -> Result<(MerkleProof<[u8; 32]>, [u8; 32]), RelayerError> {
        let state = self.state.lock().await;
        let proof = state.tree.proof(index)?;
        Ok((proof, state.tree.root()))
    }

    /// Background loop: sync every `poll_interval` until the task is dropped.
    pub async fn run(self: Arc<Self>, poll_interval: Duration) {
        info!(
            "Starting sync loop for chain {} every {:?}",
            self.chain_id, poll_interval
        );
        loop {
            match self.sync().await {
                Ok(snapshot) => debug!(
                    "Chain {} synced to block {:?} ({} leaves)",
                    snapshot.chain_id, snapshot.last_synced_block, snapshot.leaf_count
                ),
                Err(e) => warn!("Sync failed for chain {}: {}", self.chain_id, e),
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn sync_locked(&self, state: &mut ReplayState) -> Result<(), RelayerError> {
        let head = self.ledger.block_number().await?;
        let mut from = state.sync.next_block(self.config.start_block);
        if head < from {
            return Ok(());
        }

        let range = self.config.max_block_range.max(1);
        while from <= head {
            let to = head.min(from.saturating_add(range - 1));
            let mut events = self.ledger.leaf_events(from, to).await?;
            events.sort_by_key(LeafEvent::ordering_key);

            if let Err(e) = self.apply_chunk(state, &events, to).await {
                self.rollback(state)?;
                return Err(e);
            }
            from = to + 1;
        }
        Ok(())
    }

    async fn apply_chunk(
        &self,
        state: &mut ReplayState,
        events: &[LeafEvent],
        to_block: u64,
    ) -> Result<(), RelayerError> {
        let first_index = state.tree.len();
        validate_chunk(events, first_index, state.tree.capacity())?;

        let leaves: Vec<[u8; 32]> = events.iter().map(|e| e.commitment).collect();
        for leaf in &leaves {
            state.tree.insert(*leaf)?;
        }

        let sync = SyncState {
            last_synced_block: Some(to_block),
            leaf_count: state.tree.len(),
        };
        self.store
            .commit(self.chain_id, first_index, &leaves, &sync)
            .await?;
        state.sync = sync;

        if !leaves.is_empty() {
            info!(
                "Chain {}: inserted {} leaves up to block {}, root {}",
                self.chain_id,
                leaves.len(),
                to_block,
                bytes_hex(&state.tree.root())
            );
        }
        Ok(())
    }

    /// Discard in-memory progress that did not reach the store.
    fn rollback(&self, state: &mut ReplayState) -> Result<(), RelayerError> {
        warn!(
            "Chain {}: rolling tree back to last committed state",
            self.chain_id
        );
        *state = load_state(&self.store, self.chain_id, &self.config)?;
        Ok(())
    }

    async fn publish_locked(&self, state: &ReplayState) -> Result<Option<TxHash>, RelayerError> {
        if state.tree.is_empty() {
            return Ok(None);
        }
        let local = state.tree.root();
        let on_chain = self.ledger.current_root().await?;
        if on_chain == local {
            return Ok(None);
        }

        info!(
            "Chain {}: posting root {} (pool has {})",
            self.chain_id,
            bytes_hex(&local),
            bytes_hex(&on_chain)
        );
        let tx_hash = self.ledger.post_root(local).await?;
        let confirmation = self
            .ledger
            .wait_for_confirmation(tx_hash, self.config.confirmation_timeout)
            .await?;
        if !confirmation.success {
            return Err(RelayerError::Sync(format!(
                "postRoot {:?} reverted on chain {}",
                tx_hash, self.chain_id
            )));
        }
        Ok(Some(tx_hash))
    }

    fn snapshot_of(&self, state: &ReplayState) -> SyncSnapshot {
        SyncSnapshot {
            chain_id: self.chain_id,
            leaf_count: state.tree.len(),
            root: state.tree.root(),
            last_synced_block: state.sync.last_synced_block,
            next_block: state.sync.next_block(self.config.start_block),
        }
    }
}

fn load_state(
    store: &SyncStore,
    chain_id: u64,
    config: &ReplayerConfig,
) -> Result<ReplayState, RelayerError> {
    let leaves = store.load_leaves(chain_id)?;
    let sync = match store.load_state(chain_id)? {
        Some(sync) => sync,
        None if leaves.is_empty() => SyncState::fresh(),
        None => {
            return Err(RelayerError::Sync(format!(
                "chain {}: {} leaves stored without a sync state",
                chain_id,
                leaves.len()
            )))
        }
    };
    if sync.leaf_count != leaves.len() as u64 {
        return Err(RelayerError::Sync(format!(
            "chain {}: sync state records {} leaves but {} are stored",
            chain_id,
            sync.leaf_count,
            leaves.len()
        )));
    }

    let zeros = poseidon_zeros()?;
    let tree = IncrementalMerkleTree::from_leaves(zeros, config.tree_depth, config.root_history, &leaves)?;
    Ok(ReplayState { tree, sync })
}

/// Reject a chunk before any of it touches the tree.
fn validate_chunk(events: &[LeafEvent], first_index: u64, capacity: u64) -> Result<(), RelayerError> {
    if first_index + events.len() as u64 > capacity {
        return Err(RelayerError::Sync(format!(
            "{} new leaves exceed tree capacity {}",
            events.len(),
            capacity
        )));
    }
    for (offset, event) in events.iter().enumerate() {
        let expected = first_index + offset as u64;
        if let Some(index) = event.leaf_index {
            if index != expected {
                return Err(RelayerError::Sync(format!(
                    "leaf index gap at block {}: event says {}, tree expects {}",
                    event.block_number, index, expected
                )));
            }
        }
        if !is_canonical(&event.commitment) {
            return Err(RelayerError::Sync(format!(
                "commitment {} at block {} is not a field element",
                bytes_hex(&event.commitment),
                event.block_number
            )));
        }
    }
    Ok(())
}
