//! Durable sync progress.
//!
//! Each chain gets its own sled tree holding every inserted leaf under
//! `leaf/<big-endian index>` plus a `state` record with the block watermark.
//! Leaves and watermark are always written in one batch.

use serde::{Deserialize, Serialize};
use sled::{Batch, Db, Tree};
use std::{fs, path::Path};
use thiserror::Error;
use tracing::debug;

const LEAF_PREFIX: &[u8] = b"leaf/";
const STATE_KEY: &[u8] = b"state";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("corrupt store: {0}")]
    Corrupt(String),

    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Watermark persisted alongside the leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Last block whose events are fully applied; `None` before the first chunk.
    pub last_synced_block: Option<u64>,
    pub leaf_count: u64,
}

impl SyncState {
    /// State of a chain that has never been scanned.
    pub fn fresh() -> Self {
        Self {
            last_synced_block: None,
            leaf_count: 0,
        }
    }

    /// First block not yet applied, given the deployment block.
    pub fn next_block(&self, start_block: u64) -> u64 {
        self.last_synced_block
            .map_or(start_block, |block| block.saturating_add(1))
    }
}

/// Open (or create) the relayer database.
pub fn open_db(path: impl AsRef<Path>) -> Result<Db, StoreError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(sled::open(path)?)
}

#[derive(Clone)]
pub struct SyncStore {
    db: Db,
}

impl SyncStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Throwaway database, removed on drop.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    fn chain_tree(&self, chain_id: u64) -> Result<Tree, StoreError> {
        Ok(self.db.open_tree(format!("chain/{}", chain_id))?)
    }

    pub fn load_state(&self, chain_id: u64) -> Result<Option<SyncState>, StoreError> {
        let tree = self.chain_tree(chain_id)?;
        match tree.get(STATE_KEY)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// All persisted leaves in index order. Gaps are reported as corruption.
    pub fn load_leaves(&self, chain_id: u64) -> Result<Vec<[u8; 32]>, StoreError> {
        let tree = self.chain_tree(chain_id)?;
        let mut leaves = Vec::new();
        for entry in tree.scan_prefix(LEAF_PREFIX) {
            let (key, value) = entry?;
            let index = decode_index(&key)?;
            if index != leaves.len() as u64 {
                return Err(StoreError::Corrupt(format!(
                    "chain {}: expected leaf {}, found {}",
                    chain_id,
                    leaves.len(),
                    index
                )));
            }
            let leaf: [u8; 32] = value.as_ref().try_into().map_err(|_| {
                StoreError::Corrupt(format!("chain {}: leaf {} is not 32 bytes", chain_id, index))
            })?;
            leaves.push(leaf);
        }
        Ok(leaves)
    }

    /// Append `leaves` starting at `first_index` and move the watermark, atomically.
    pub async fn commit(
        &self,
        chain_id: u64,
        first_index: u64,
        leaves: &[[u8; 32]],
        state: &SyncState,
    ) -> Result<(), StoreError> {
        let tree = self.chain_tree(chain_id)?;
        let mut batch = Batch::default();
        for (offset, leaf) in leaves.iter().enumerate() {
            batch.insert(leaf_key(first_index + offset as u64), leaf.as_slice());
        }
        batch.insert(STATE_KEY, serde_json::to_vec(state)?);
        tree.apply_batch(batch)?;
        self.db.flush_async().await?;

        debug!(
            "Committed {} leaves for chain {} (watermark {:?})",
            leaves.len(),
            chain_id,
            state.last_synced_block
        );
        Ok(())
    }
}

fn leaf_key(index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(LEAF_PREFIX.len() + 8);
    key.extend_from_slice(LEAF_PREFIX);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn decode_index(key: &[u8]) -> Result<u64, StoreError> {
    key.strip_prefix(LEAF_PREFIX)
        .and_then(|raw| <[u8; 8]>::try_from(raw).ok())
        .map(u64::from_be_bytes)
        .ok_or_else(|| StoreError::Corrupt(format!("bad leaf key {}", hex::encode(key))))
}
