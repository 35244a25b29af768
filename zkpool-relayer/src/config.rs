//! Relayer configuration.

use anyhow::{bail, Context, Result};
use ethers::types::Address;
use std::{env, fmt, path::PathBuf, str::FromStr, time::Duration};

use crate::{health::DEFAULT_MAX_SYNC_GAP, replayer::ReplayerConfig};

/// One pool deployment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub pool_address: Address,
    /// Block the pool was deployed in.
    pub start_block: u64,
}

/// Relayer configuration.
#[derive(Clone)]
pub struct RelayerConfig {
    pub chains: Vec<ChainConfig>,
    /// Hex private key used to sign every relayed transaction.
    pub relayer_private_key: String,
    pub db_path: PathBuf,
    pub tree_depth: usize,
    pub root_history: usize,
    /// Per-nullifier cooldown; zero disables it.
    pub cooldown: Duration,
    pub confirmation_timeout: Duration,
    pub max_sync_gap: u64,
    pub max_block_range: u64,
    pub poll_interval: Duration,
    pub port: u16,
    pub log_json: bool,
}

impl fmt::Debug for RelayerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayerConfig")
            .field("chains", &self.chains)
            .field("relayer_private_key", &"<redacted>")
            .field("db_path", &self.db_path)
            .field("tree_depth", &self.tree_depth)
            .field("root_history", &self.root_history)
            .field("cooldown", &self.cooldown)
            .field("confirmation_timeout", &self.confirmation_timeout)
            .field("max_sync_gap", &self.max_sync_gap)
            .field("max_block_range", &self.max_block_range)
            .field("poll_interval", &self.poll_interval)
            .field("port", &self.port)
            .field("log_json", &self.log_json)
            .finish()
    }
}

impl RelayerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_source(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_source(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let chain_ids: Vec<u64> = lookup("ZKPOOL_CHAINS")
            .context("ZKPOOL_CHAINS must be set")?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<u64>().with_context(|| format!("invalid chain id {:?}", s)))
            .collect::<Result<_>>()?;
        if chain_ids.is_empty() {
            bail!("ZKPOOL_CHAINS lists no chains");
        }

        let chains = chain_ids
            .into_iter()
            .map(|chain_id| chain_config(&lookup, chain_id))
            .collect::<Result<Vec<_>>>()?;

        let relayer_private_key = lookup("ZKPOOL_RELAYER_PRIVATE_KEY")
            .context("ZKPOOL_RELAYER_PRIVATE_KEY must be set")?;

        let db_path = lookup("ZKPOOL_DB_PATH")
            .unwrap_or_else(|| "data/relayer.db".to_string())
            .into();

        let tree_depth = parse_or(&lookup, "ZKPOOL_TREE_DEPTH", 20usize)?;
        if tree_depth == 0 || tree_depth > zkpool_tree::MAX_DEPTH {
            bail!("ZKPOOL_TREE_DEPTH must be between 1 and {}", zkpool_tree::MAX_DEPTH);
        }

        Ok(Self {
            chains,
            relayer_private_key,
            db_path,
            tree_depth,
            root_history: parse_or(&lookup, "ZKPOOL_ROOT_HISTORY", zkpool_tree::DEFAULT_ROOT_HISTORY)?,
            cooldown: Duration::from_millis(parse_or(&lookup, "ZKPOOL_COOLDOWN_MS", 10_000u64)?),
            confirmation_timeout: Duration::from_secs(parse_or(
                &lookup,
                "ZKPOOL_CONFIRMATION_TIMEOUT_SECS",
                120u64,
            )?),
            max_sync_gap: parse_or(&lookup, "ZKPOOL_MAX_SYNC_GAP", DEFAULT_MAX_SYNC_GAP)?,
            max_block_range: parse_or(&lookup, "ZKPOOL_MAX_BLOCK_RANGE", 2_000u64)?.max(1),
            poll_interval: Duration::from_secs(parse_or(&lookup, "ZKPOOL_POLL_INTERVAL_SECS", 15u64)?),
            port: parse_or(&lookup, "PORT", 3000u16)?,
            log_json: lookup("ZKPOOL_LOG_JSON")
                .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
                .unwrap_or(false),
        })
    }

    /// Replayer settings for `chain`.
    pub fn replayer_config(&self, chain: &ChainConfig) -> ReplayerConfig {
        ReplayerConfig {
            tree_depth: self.tree_depth,
            root_history: self.root_history,
            start_block: chain.start_block,
            max_block_range: self.max_block_range,
            confirmation_timeout: self.confirmation_timeout,
        }
    }
}

fn chain_config(lookup: &impl Fn(&str) -> Option<String>, chain_id: u64) -> Result<ChainConfig> {
    let rpc_key = format!("ZKPOOL_{}_RPC_URL", chain_id);
    let pool_key = format!("ZKPOOL_{}_POOL_ADDRESS", chain_id);

    let rpc_url = lookup(&rpc_key).with_context(|| format!("{} must be set", rpc_key))?;
    let pool_address = lookup(&pool_key)
        .with_context(|| format!("{} must be set", pool_key))?
        .trim()
        .parse::<Address>()
        .with_context(|| format!("{} is not an address", pool_key))?;
    let start_block = parse_or(lookup, &format!("ZKPOOL_{}_START_BLOCK", chain_id), 0u64)?;

    Ok(ChainConfig {
        chain_id,
        rpc_url,
        pool_address,
        start_block,
    })
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value {:?}", key, raw)),
        None => Ok(default),
    }
}
