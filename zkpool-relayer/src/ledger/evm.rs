//! EVM pool client.

use async_trait::async_trait;
use ethers::{
    contract::{abigen, ContractError},
    prelude::*,
    types::{Address, Filter, Log, U256},
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use super::{Confirmation, LeafEvent, Ledger, LedgerError, TxHash, WithdrawCall};
use crate::config::ChainConfig;

/// Event emitted by the pool for every queued leaf.
pub const LEAF_QUEUED_SIGNATURE: &str = "LeafQueued(uint256,bytes32)";

abigen!(
    ShieldedPool,
    r#"[
        function currentRootIndex() external view returns (uint32)
        function roots(uint256 index) external view returns (bytes32)
        function depositQueueTail() external view returns (uint256)
        function leaves(uint256 index) external view returns (bytes32)
        function postRoot(bytes32 root) external
        function withdraw(bytes proof, bytes32 root, bytes32 nullifier0, bytes32 nullifier1, bytes32 outCommitment0, bytes32 outCommitment1, uint256 publicAmount, uint256 publicAsset, address recipient, address token) external
        event LeafQueued(uint256 indexed index, bytes32 commitment)
    ]"#
);

type EvmClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// One way of pulling the commitment out of a log.
type CommitmentStrategy = fn(&Log) -> Option<[u8; 32]>;

/// Tried in order; the contract read-back runs only when all of them fail.
const COMMITMENT_STRATEGIES: &[(&str, CommitmentStrategy)] = &[
    ("log data", commitment_from_data),
    ("indexed topic", commitment_from_topic),
];

/// Pool deployment on an EVM chain.
pub struct EvmLedger {
    chain_id: u64,
    client: Arc<EvmClient>,
    pool: ShieldedPool<EvmClient>,
    pool_address: Address,
}

impl EvmLedger {
    pub fn new(chain: &ChainConfig, private_key: &str) -> Result<Self, LedgerError> {
        let provider = Provider::<Http>::try_from(chain.rpc_url.as_str())
            .map_err(|e| LedgerError::Rpc(format!("invalid RPC URL {}: {}", chain.rpc_url, e)))?;

        let wallet = private_key
            .parse::<LocalWallet>()
            .map_err(|e| LedgerError::Rpc(format!("invalid relayer key: {}", e)))?
            .with_chain_id(chain.chain_id);

        info!(
            "EVM ledger for chain {} at {:?}, relayer {:?}",
            chain.chain_id,
            chain.pool_address,
            wallet.address()
        );

        let client = Arc::new(SignerMiddleware::new(provider, wallet));
        let pool = ShieldedPool::new(chain.pool_address, client.clone());

        Ok(Self {
            chain_id: chain.chain_id,
            client,
            pool,
            pool_address: chain.pool_address,
        })
    }

    async fn decode_event(&self, log: &Log) -> Result<LeafEvent, LedgerError> {
        let block_number = log
            .block_number
            .ok_or_else(|| LedgerError::Decode("log without block number".into()))?
            .as_u64();
        let log_index = log
            .log_index
            .ok_or_else(|| LedgerError::Decode("log without log index".into()))?
            .low_u64();
        let tx_index = log.transaction_index.map(|i| i.as_u64()).unwrap_or_default();
        let leaf_index = leaf_index_from_log(log);

        let commitment = match COMMITMENT_STRATEGIES
            .iter()
            .find_map(|(name, strategy)| strategy(log).map(|c| (*name, c)))
        {
            Some((name, commitment)) => {
                debug!("Decoded commitment at block {} via {}", block_number, name);
                commitment
            }
            None => self.commitment_from_contract(leaf_index, block_number).await?,
        };

        Ok(LeafEvent {
            commitment,
            leaf_index,
            block_number,
            tx_index,
            log_index,
        })
    }

    async fn commitment_from_contract(
        &self,
        leaf_index: Option<u64>,
        block_number: u64,
    ) -> Result<[u8; 32], LedgerError> {
        let index = leaf_index.ok_or_else(|| {
            LedgerError::Decode(format!(
                "leaf event at block {} has neither commitment nor index",
                block_number
            ))
        })?;
        warn!("Reading leaf {} back from the pool contract", index);
        self.pool
            .leaves(U256::from(index))
            .call()
            .await
            .map_err(contract_error)
    }
}

#[async_trait]
impl Ledger for EvmLedger {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn block_number(&self) -> Result<u64, LedgerError> {
        self.client
            .get_block_number()
            .await
            .map(|n| n.as_u64())
            .map_err(|e| LedgerError::Rpc(e.to_string()))
    }

    async fn current_root_index(&self) -> Result<u64, LedgerError> {
        self.pool
            .current_root_index()
            .call()
            .await
            .map(u64::from)
            .map_err(contract_error)
    }

    async fn root_at(&self, index: u64) -> Result<[u8; 32], LedgerError> {
        self.pool
            .roots(U256::from(index))
            .call()
            .await
            .map_err(contract_error)
    }

    async fn deposit_queue_tail(&self) -> Result<u64, LedgerError> {
        self.pool
            .deposit_queue_tail()
            .call()
            .await
            .map(|tail| tail.low_u64())
            .map_err(contract_error)
    }

    async fn leaf_events(&self, from_block: u64, to_block: u64) -> Result<Vec<LeafEvent>, LedgerError> {
        let filter = Filter::new()
            .address(self.pool_address)
            .event(LEAF_QUEUED_SIGNATURE)
            .from_block(from_block)
            .to_block(to_block);

        let logs = self
            .client
            .get_logs(&filter)
            .await
            .map_err(|e| LedgerError::Rpc(format!("eth_getLogs {}..={}: {}", from_block, to_block, e)))?;

        debug!(
            "Fetched {} leaf logs for blocks {}..={} on chain {}",
            logs.len(),
            from_block,
            to_block,
            self.chain_id
        );

        let mut events = Vec::with_capacity(logs.len());
        for log in logs.iter().filter(|log| log.removed != Some(true)) {
            events.push(self.decode_event(log).await?);
        }
        Ok(events)
    }

    async fn post_root(&self, root: [u8; 32]) -> Result<TxHash, LedgerError> {
        let call = self.pool.post_root(root);
        let pending = call.send().await.map_err(contract_error)?;
        let tx_hash = pending.tx_hash();
        info!("postRoot sent on chain {}: {:?}", self.chain_id, tx_hash);
        Ok(tx_hash)
    }

    async fn submit_withdraw(&self, call: &WithdrawCall) -> Result<TxHash, LedgerError> {
        let tx = self.pool.withdraw(
            call.proof.clone(),
            call.merkle_root,
            call.nullifier0,
            call.nullifier1,
            call.out_commitment0,
            call.out_commitment1,
            call.public_amount,
            call.public_asset,
            call.recipient,
            call.token,
        );
        let pending = tx.send().await.map_err(contract_error)?;
        let tx_hash = pending.tx_hash();
        info!("withdraw sent on chain {}: {:?}", self.chain_id, tx_hash);
        Ok(tx_hash)
    }

    async fn wait_for_confirmation(
        &self,
        tx_hash: TxHash,
        timeout: Duration,
    ) -> Result<Confirmation, LedgerError> {
        let pending = PendingTransaction::new(tx_hash, self.client.provider()).confirmations(1);

        let receipt = match tokio::time::timeout(timeout, pending).await {
            Err(_) => return Err(LedgerError::Timeout(tx_hash)),
            Ok(result) => result
                .map_err(|e| LedgerError::Rpc(e.to_string()))?
                .ok_or(LedgerError::Dropped(tx_hash))?,
        };

        Ok(Confirmation {
            tx_hash,
            block_number: receipt.block_number.map(|n| n.as_u64()).unwrap_or_default(),
            success: receipt.status == Some(1u64.into()),
        })
    }
}

fn contract_error<M: Middleware>(err: ContractError<M>) -> LedgerError {
    if let Some(reason) = err.decode_revert::<String>() {
        return LedgerError::Reverted(Some(reason));
    }
    if err.as_revert().is_some() {
        return LedgerError::Reverted(None);
    }
    let message = err.to_string();
    if message.contains("execution reverted") {
        // Some nodes only report the reason inside the JSON-RPC error message.
        return LedgerError::Reverted(Some(message));
    }
    LedgerError::Rpc(message)
}

fn commitment_from_data(log: &Log) -> Option<[u8; 32]> {
    let data = log.data.as_ref();
    let word = match data.len() {
        32 => &data[..32],
        // (index, commitment) both unindexed
        64 => &data[32..64],
        _ => return None,
    };
    word.try_into().ok()
}

fn commitment_from_topic(log: &Log) -> Option<[u8; 32]> {
    log.topics.get(2).map(|topic| topic.to_fixed_bytes())
}

fn leaf_index_from_log(log: &Log) -> Option<u64> {
    let word = match log.topics.get(1) {
        Some(topic) => U256::from_big_endian(topic.as_bytes()),
        None if log.data.len() == 64 => U256::from_big_endian(&log.data[..32]),
        None => return None,
    };
    (word <= U256::from(u64::MAX)).then(|| word.low_u64())
}
