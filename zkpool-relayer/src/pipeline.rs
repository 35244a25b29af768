//! Proof submission pipeline.
//!
//! Every relay request goes through the same stages:
//! validate, cooldown, lock nullifiers, sync tree, submit, await
//! confirmation, resync, release. Validation does no I/O and takes no lock,
//! so malformed requests never reach the ledger.

use ethers::types::{Address, Bytes};
use std::{fmt, sync::Arc, time::Duration};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    chains::{ChainContext, ChainRegistry},
    cooldown::{CooldownDecision, CooldownStore},
    error::{RelayerError, RevertReason},
    guard::NullifierGuard,
    ledger::{LedgerError, TxHash, WithdrawCall},
    signals::{asset_id, field_hex, parse_field, PublicSignals, PROOF_LEN, SIGNAL_COUNT},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Withdraw,
    Transfer,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Withdraw => write!(f, "withdraw"),
            RequestKind::Transfer => write!(f, "transfer"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub kind: RequestKind,
    pub proof: Vec<u8>,
    /// Raw public signals as produced by the prover (decimal or hex).
    pub public_signals: Vec<String>,
    /// Required for withdrawals, absent (or zero) for transfers.
    pub token: Option<Address>,
    pub target_chain_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub tx_hash: TxHash,
    pub chain_id: u64,
    pub block_number: u64,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub confirmation_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout: Duration::from_secs(120),
        }
    }
}

/// A request that passed every local check.
struct Validated {
    chain: ChainContext,
    call: WithdrawCall,
    nullifiers: Vec<String>,
}

pub struct SubmissionPipeline {
    chains: Arc<ChainRegistry>,
    guard: Arc<NullifierGuard>,
    cooldown: CooldownStore,
    config: PipelineConfig,
}

impl SubmissionPipeline {
    pub fn new(
        chains: Arc<ChainRegistry>,
        guard: Arc<NullifierGuard>,
        cooldown: CooldownStore,
        config: PipelineConfig,
    ) -> Self {
        Self {
            chains,
            guard,
            cooldown,
            config,
        }
    }

    pub fn guard(&self) -> &Arc<NullifierGuard> {
        &self.guard
    }

    pub fn chains(&self) -> &Arc<ChainRegistry> {
        &self.chains
    }

    /// Relay one proof to its target chain.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome, RelayerError> {
        let request_id = Uuid::new_v4();
        let span = info_span!(
            "relay",
            %request_id,
            kind = %request.kind,
            chain_id = request.target_chain_id
        );
        self.process(request).instrument(span).await
    }

    async fn process(&self, request: SubmitRequest) -> Result<SubmitOutcome, RelayerError> {
        let Validated {
            chain,
            call,
            nullifiers,
        } = self.validate(&request)?;

        if let CooldownDecision::Limited { retry_after_ms } = self.cooldown.check(&nullifiers[0])? {
            info!("Nullifier {} is cooling down", nullifiers[0]);
            return Err(RelayerError::RateLimited { retry_after_ms });
        }

        // Held until this function returns, whichever way it does.
        let _lease = self.guard.lock(&nullifiers)?;

        chain.replayer.sync_and_publish().await?;
        let tx_hash = self.submit_with_root_retry(&chain, &call).await?;
        let block_number = self.await_confirmation(&chain, tx_hash).await?;

        if let Err(e) = chain.replayer.sync().await {
            warn!("Post-submission sync failed: {}", e);
        }

        info!("Relayed {:?} in block {}", tx_hash, block_number);
        Ok(SubmitOutcome {
            tx_hash,
            chain_id: chain.chain_id,
            block_number,
        })
    }

    fn validate(&self, request: &SubmitRequest) -> Result<Validated, RelayerError> {
        if request.proof.len() != PROOF_LEN {
            return Err(RelayerError::Validation(format!(
                "proof must be {} bytes, got {}",
                PROOF_LEN,
                request.proof.len()
            )));
        }
        if request.public_signals.len() != SIGNAL_COUNT {
            return Err(RelayerError::Validation(format!(
                "expected {} public signals, got {}",
                SIGNAL_COUNT,
                request.public_signals.len()
            )));
        }
        let values = request
            .public_signals
            .iter()
            .map(|raw| parse_field(raw))
            .collect::<Result<Vec<_>, _>>()?;
        let signals = PublicSignals::from_values(&values)?;

        if signals.chain_id() != Some(request.target_chain_id) {
            return Err(RelayerError::Validation(format!(
                "proof is bound to chain {}, not {}",
                signals.chain_id, request.target_chain_id
            )));
        }
        let chain = self.chains.get(request.target_chain_id)?.clone();

        let token = match request.kind {
            RequestKind::Transfer => {
                if !signals.public_amount.is_zero() {
                    return Err(RelayerError::Validation(
                        "transfers must have a zero public amount".into(),
                    ));
                }
                match request.token {
                    None => Address::zero(),
                    Some(token) if token.is_zero() => token,
                    Some(_) => {
                        return Err(RelayerError::Validation(
                            "transfers do not take a token address".into(),
                        ))
                    }
                }
            }
            RequestKind::Withdraw => {
                let token = request.token.ok_or_else(|| {
                    RelayerError::Validation("withdrawals require a token address".into())
                })?;
                if signals.public_asset != asset_id(request.target_chain_id, token) {
                    return Err(RelayerError::Validation(format!(
                        "public asset does not match token {:?} on chain {}",
                        token, request.target_chain_id
                    )));
                }
                token
            }
        };

        let recipient = signals.recipient_address()?;
        if signals.nullifier0 == signals.nullifier1 {
            return Err(RelayerError::Validation("nullifiers must be distinct".into()));
        }
        let nullifiers: Vec<String> = signals.nullifiers().into_iter().map(field_hex).collect();

        let call = WithdrawCall::new(Bytes::from(request.proof.clone()), &signals, recipient, token);
        Ok(Validated {
            chain,
            call,
            nullifiers,
        })
    }

    /// Submit once; on an unknown-root revert resync and try exactly once more.
    async fn submit_with_root_retry(
        &self,
        chain: &ChainContext,
        call: &WithdrawCall,
    ) -> Result<TxHash, RelayerError> {
        match send(chain, call).await {
            Err(RelayerError::ChainSubmission(RevertReason::UnknownRoot)) => {
                warn!("Pool rejected the merkle root, resyncing before one retry");
                chain.replayer.sync_and_publish().await?;
                match send(chain, call).await {
                    Err(RelayerError::ChainSubmission(RevertReason::UnknownRoot)) => {
                        Err(RelayerError::StaleRoot)
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn await_confirmation(&self, chain: &ChainContext, tx_hash: TxHash) -> Result<u64, RelayerError> {
        match chain
            .ledger
            .wait_for_confirmation(tx_hash, self.config.confirmation_timeout)
            .await
        {
            Ok(confirmation) if confirmation.success => Ok(confirmation.block_number),
            Ok(_) => {
                warn!("Transaction {:?} reverted on-chain", tx_hash);
                Err(RelayerError::ChainSubmission(RevertReason::Unknown))
            }
            Err(LedgerError::Timeout(tx_hash)) => Err(RelayerError::Timeout { tx_hash }),
            // The transaction is out; a retryable error here would invite a double submit.
            Err(e) => {
                warn!("Lost track of {:?}: {}", tx_hash, e);
                Err(RelayerError::Unconfirmed {
                    tx_hash,
                    reason: e.to_string(),
                })
            }
        }
    }
}

async fn send(chain: &ChainContext, call: &WithdrawCall) -> Result<TxHash, RelayerError> {
    chain
        .ledger
        .submit_withdraw(call)
        .await
        .map_err(submission_error)
}

fn submission_error(err: LedgerError) -> RelayerError {
    match err {
        LedgerError::Reverted(reason) => {
            let reason = reason
                .as_deref()
                .map(RevertReason::classify)
                .unwrap_or(RevertReason::Unknown);
            RelayerError::ChainSubmission(reason)
        }
        other => RelayerError::Ledger(other),
    }
}
