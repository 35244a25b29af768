//! Chains served by this relayer.

use std::{collections::BTreeMap, sync::Arc};

use crate::{error::RelayerError, ledger::Ledger, replayer::EventReplayer};

/// Everything the relayer needs to act on one chain.
#[derive(Clone)]
pub struct ChainContext {
    pub chain_id: u64,
    pub ledger: Arc<dyn Ledger>,
    pub replayer: Arc<EventReplayer>,
}

impl ChainContext {
    pub fn new(ledger: Arc<dyn Ledger>, replayer: Arc<EventReplayer>) -> Self {
        Self {
            chain_id: ledger.chain_id(),
            ledger,
            replayer,
        }
    }
}

#[derive(Clone, Default)]
pub struct ChainRegistry {
    chains: BTreeMap<u64, ChainContext>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, context: ChainContext) {
        self.chains.insert(context.chain_id, context);
    }

    pub fn with_chain(mut self, context: ChainContext) -> Self {
        self.insert(context);
        self
    }

    pub fn get(&self, chain_id: u64) -> Result<&ChainContext, RelayerError> {
        self.chains
            .get(&chain_id)
            .ok_or(RelayerError::UnknownChain(chain_id))
    }

    pub fn contains(&self, chain_id: u64) -> bool {
        self.chains.contains_key(&chain_id)
    }

    pub fn chain_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.chains.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChainContext> {
        self.chains.values()
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}
