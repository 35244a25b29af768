//! Shared fixtures for the relayer integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::{Notify, Semaphore};

use zkpool_relayer::{
    signals::asset_id, ChainContext, ChainRegistry, Confirmation, CooldownStore, EventReplayer,
    LeafEvent, Ledger, LedgerError, NullifierGuard, PipelineConfig, ReplayerConfig, RequestKind,
    SubmissionPipeline, SubmitRequest, SyncStore, TxHash, WithdrawCall,
};

pub const CHAIN_ID: u64 = 8453;
pub const TEST_DEPTH: usize = 8;

/// How the next `submit_withdraw` behaves.
#[derive(Debug, Clone)]
pub enum SubmitBehaviour {
    Succeed,
    Revert(String),
    RpcError(String),
}

/// How withdraw confirmations behave. `postRoot` always confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmBehaviour {
    Success,
    Reverted,
    Timeout,
    /// The receipt poll itself fails after the transaction was sent.
    RpcError,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Calls {
    pub block_number: usize,
    pub leaf_events: usize,
    pub root_reads: usize,
    pub post_root: usize,
    pub submit: usize,
    pub confirm: usize,
}

impl Calls {
    pub fn total(&self) -> usize {
        self.block_number
            + self.leaf_events
            + self.root_reads
            + self.post_root
            + self.submit
            + self.confirm
    }
}

struct MockState {
    head: u64,
    events: Vec<LeafEvent>,
    roots: Vec<[u8; 32]>,
    deposit_queue_tail: u64,
    submit_script: VecDeque<SubmitBehaviour>,
    confirm: ConfirmBehaviour,
    fail_reads_after_submit: bool,
    submitted: bool,
    calls: Calls,
    ranges: Vec<(u64, u64)>,
    posted: Vec<[u8; 32]>,
    submissions: Vec<WithdrawCall>,
    calls_at_submit: Vec<Calls>,
    withdraw_txs: HashSet<TxHash>,
    next_tx: u64,
}

/// Scripted in-memory pool.
pub struct MockLedger {
    chain_id: u64,
    state: Mutex<MockState>,
    gate: Option<Arc<Semaphore>>,
    events_gate: Option<Arc<Semaphore>>,
    /// Signalled whenever `submit_withdraw` is entered.
    pub submit_entered: Notify,
    /// Signalled whenever `leaf_events` is entered.
    pub events_entered: Notify,
}

impl MockLedger {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(MockState {
                head: 0,
                events: Vec::new(),
                roots: vec![[0u8; 32]],
                deposit_queue_tail: 0,
                submit_script: VecDeque::new(),
                confirm: ConfirmBehaviour::Success,
                fail_reads_after_submit: false,
                submitted: false,
                calls: Calls::default(),
                ranges: Vec::new(),
                posted: Vec::new(),
                submissions: Vec::new(),
                calls_at_submit: Vec::new(),
                withdraw_txs: HashSet::new(),
                next_tx: 1,
            }),
            gate: None,
            events_gate: None,
            submit_entered: Notify::new(),
            events_entered: Notify::new(),
        }
    }

    /// Block every `submit_withdraw` until a permit is added to `gate`.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Block every `leaf_events` until a permit is added to `gate`.
    pub fn with_events_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.events_gate = Some(gate);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Queue leaves in one block, with contract-assigned indices.
    pub fn push_leaves(&self, block: u64, commitments: &[[u8; 32]]) {
        let mut state = self.state();
        for (log_index, commitment) in commitments.iter().enumerate() {
            let index = state.events.len() as u64;
            state.events.push(LeafEvent {
                commitment: *commitment,
                leaf_index: Some(index),
                block_number: block,
                tx_index: 0,
                log_index: log_index as u64,
            });
        }
        state.deposit_queue_tail = state.events.len() as u64;
        state.head = state.head.max(block);
    }

    pub fn push_event(&self, event: LeafEvent) {
        let mut state = self.state();
        state.head = state.head.max(event.block_number);
        state.events.push(event);
    }

    pub fn set_head(&self, head: u64) {
        self.state().head = head;
    }

    pub fn set_current_root(&self, root: [u8; 32]) {
        self.state().roots.push(root);
    }

    pub fn script_submit(&self, behaviours: Vec<SubmitBehaviour>) {
        self.state().submit_script = behaviours.into();
    }

    pub fn set_confirm(&self, confirm: ConfirmBehaviour) {
        self.state().confirm = confirm;
    }

    pub fn fail_reads_after_submit(&self) {
        self.state().fail_reads_after_submit = true;
    }

    pub fn calls(&self) -> Calls {
        self.state().calls
    }

    pub fn ranges(&self) -> Vec<(u64, u64)> {
        self.state().ranges.clone()
    }

    pub fn posted_roots(&self) -> Vec<[u8; 32]> {
        self.state().posted.clone()
    }

    pub fn submissions(&self) -> Vec<WithdrawCall> {
        self.state().submissions.clone()
    }

    /// Call counters as they stood when each `submit_withdraw` ran.
    pub fn calls_at_submit(&self) -> Vec<Calls> {
        self.state().calls_at_submit.clone()
    }

    fn next_tx(state: &mut MockState) -> TxHash {
        let tx = H256::from_low_u64_be(state.next_tx);
        state.next_tx += 1;
        tx
    }
}

#[async_trait]
impl Ledger for MockLedger {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn block_number(&self) -> Result<u64, LedgerError> {
        let mut state = self.state();
        state.calls.block_number += 1;
        if state.fail_reads_after_submit && state.submitted {
            return Err(LedgerError::Rpc("node unavailable".into()));
        }
        Ok(state.head)
    }

    async fn current_root_index(&self) -> Result<u64, LedgerError> {
        let mut state = self.state();
        state.calls.root_reads += 1;
        Ok(state.roots.len() as u64 - 1)
    }

    async fn root_at(&self, index: u64) -> Result<[u8; 32], LedgerError> {
        let mut state = self.state();
        state.calls.root_reads += 1;
        state
            .roots
            .get(index as usize)
            .copied()
            .ok_or_else(|| LedgerError::Rpc(format!("no root at {}", index)))
    }

    async fn deposit_queue_tail(&self) -> Result<u64, LedgerError> {
        Ok(self.state().deposit_queue_tail)
    }

    async fn leaf_events(&self, from_block: u64, to_block: u64) -> Result<Vec<LeafEvent>, LedgerError> {
        self.events_entered.notify_one();
        if let Some(gate) = &self.events_gate {
            let _permit = gate.acquire().await.unwrap();
        }

        let mut state = self.state();
        state.calls.leaf_events += 1;
        state.ranges.push((from_block, to_block));
        // reverse chain order, the replayer must sort
        Ok(state
            .events
            .iter()
            .rev()
            .filter(|e| (from_block..=to_block).contains(&e.block_number))
            .copied()
            .collect())
    }

    async fn post_root(&self, root: [u8; 32]) -> Result<TxHash, LedgerError> {
        let mut state = self.state();
        state.calls.post_root += 1;
        state.posted.push(root);
        state.roots.push(root);
        Ok(Self::next_tx(&mut state))
    }

    async fn submit_withdraw(&self, call: &WithdrawCall) -> Result<TxHash, LedgerError> {
        self.submit_entered.notify_one();
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.unwrap();
        }

        let mut state = self.state();
        state.calls.submit += 1;
        let snapshot = state.calls;
        state.calls_at_submit.push(snapshot);
        state.submitted = true;
        state.submissions.push(call.clone());
        match state.submit_script.pop_front().unwrap_or(SubmitBehaviour::Succeed) {
            SubmitBehaviour::Succeed => {
                let tx = Self::next_tx(&mut state);
                state.withdraw_txs.insert(tx);
                Ok(tx)
            }
            SubmitBehaviour::Revert(reason) => Err(LedgerError::Reverted(Some(reason))),
            SubmitBehaviour::RpcError(message) => Err(LedgerError::Rpc(message)),
        }
    }

    async fn wait_for_confirmation(
        &self,
        tx_hash: TxHash,
        _timeout: Duration,
    ) -> Result<Confirmation, LedgerError> {
        let mut state = self.state();
        state.calls.confirm += 1;
        let behaviour = if state.withdraw_txs.contains(&tx_hash) {
            state.confirm
        } else {
            ConfirmBehaviour::Success
        };
        let block_number = state.head + 1;
        match behaviour {
            ConfirmBehaviour::Timeout => Err(LedgerError::Timeout(tx_hash)),
            ConfirmBehaviour::RpcError => Err(LedgerError::Rpc("receipt poll failed".into())),
            ConfirmBehaviour::Success | ConfirmBehaviour::Reverted => Ok(Confirmation {
                tx_hash,
                block_number,
                success: behaviour == ConfirmBehaviour::Success,
            }),
        }
    }
}

pub fn leaf(n: u64) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[24..].copy_from_slice(&n.to_be_bytes());
    out
}

pub fn replayer_config() -> ReplayerConfig {
    ReplayerConfig {
        tree_depth: TEST_DEPTH,
        root_history: 16,
        start_block: 1,
        max_block_range: 100,
        confirmation_timeout: Duration::from_secs(5),
    }
}

/// A pipeline over a single mock chain.
pub struct Harness {
    pub ledger: Arc<MockLedger>,
    pub replayer: Arc<EventReplayer>,
    pub chains: Arc<ChainRegistry>,
    pub guard: Arc<NullifierGuard>,
    pub pipeline: Arc<SubmissionPipeline>,
}

impl Harness {
    pub fn new(ledger: MockLedger, cooldown: Duration) -> Self {
        let ledger = Arc::new(ledger);
        let store = SyncStore::temporary().unwrap();
        let replayer = Arc::new(
            EventReplayer::open(ledger.clone() as Arc<dyn Ledger>, store, replayer_config()).unwrap(),
        );
        let chains = Arc::new(
            ChainRegistry::new().with_chain(ChainContext::new(ledger.clone(), replayer.clone())),
        );
        let guard = Arc::new(NullifierGuard::new());
        let pipeline = Arc::new(SubmissionPipeline::new(
            chains.clone(),
            guard.clone(),
            CooldownStore::in_memory(cooldown),
            PipelineConfig {
                confirmation_timeout: Duration::from_secs(5),
            },
        ));
        Self {
            ledger,
            replayer,
            chains,
            guard,
            pipeline,
        }
    }

    /// Chain with three queued leaves and no cooldown.
    pub fn with_leaves() -> Self {
        let ledger = MockLedger::new(CHAIN_ID);
        ledger.push_leaves(5, &[leaf(1), leaf(2), leaf(3)]);
        Self::new(ledger, Duration::ZERO)
    }
}

/// One pipeline and guard shared by several mock chains.
pub struct MultiChainHarness {
    pub ledgers: Vec<Arc<MockLedger>>,
    pub guard: Arc<NullifierGuard>,
    pub pipeline: Arc<SubmissionPipeline>,
}

impl MultiChainHarness {
    pub fn new(ledgers: Vec<MockLedger>) -> Self {
        let ledgers: Vec<Arc<MockLedger>> = ledgers.into_iter().map(Arc::new).collect();
        let mut chains = ChainRegistry::new();
        for ledger in &ledgers {
            let replayer = Arc::new(
                EventReplayer::open(
                    ledger.clone() as Arc<dyn Ledger>,
                    SyncStore::temporary().unwrap(),
                    replayer_config(),
                )
                .unwrap(),
            );
            chains.insert(ChainContext::new(ledger.clone(), replayer));
        }
        let guard = Arc::new(NullifierGuard::new());
        let pipeline = Arc::new(SubmissionPipeline::new(
            Arc::new(chains),
            guard.clone(),
            CooldownStore::in_memory(Duration::ZERO),
            PipelineConfig {
                confirmation_timeout: Duration::from_secs(5),
            },
        ));
        Self {
            ledgers,
            guard,
            pipeline,
        }
    }
}

pub fn token() -> Address {
    Address::from_low_u64_be(0x7070)
}

pub fn recipient() -> Address {
    Address::from_low_u64_be(0xbeef)
}

/// Builder for the nine public signals.
#[derive(Debug, Clone)]
pub struct Signals {
    pub merkle_root: U256,
    pub nullifier0: U256,
    pub nullifier1: U256,
    pub public_amount: U256,
    pub public_asset: U256,
    pub recipient: U256,
    pub chain_id: U256,
}

impl Signals {
    pub fn withdraw(nullifier: u64) -> Self {
        Self {
            merkle_root: U256::from(12345u64),
            nullifier0: U256::from(nullifier),
            nullifier1: U256::zero(),
            public_amount: U256::from(1_000u64),
            public_asset: asset_id(CHAIN_ID, token()),
            recipient: U256::from_big_endian(recipient().as_bytes()),
            chain_id: U256::from(CHAIN_ID),
        }
    }

    pub fn transfer(nullifier: u64) -> Self {
        Self {
            public_amount: U256::zero(),
            public_asset: U256::zero(),
            ..Self::withdraw(nullifier)
        }
    }

    pub fn values(&self) -> Vec<String> {
        vec![
            self.merkle_root.to_string(),
            self.nullifier0.to_string(),
            self.nullifier1.to_string(),
            "777".to_string(),
            "888".to_string(),
            self.public_amount.to_string(),
            self.public_asset.to_string(),
            self.recipient.to_string(),
            self.chain_id.to_string(),
        ]
    }
}

pub fn proof_bytes() -> Vec<u8> {
    vec![7u8; 256]
}

pub fn withdraw_request(signals: &Signals) -> SubmitRequest {
    SubmitRequest {
        kind: RequestKind::Withdraw,
        proof: proof_bytes(),
        public_signals: signals.values(),
        token: Some(token()),
        target_chain_id: CHAIN_ID,
    }
}

pub fn transfer_request(signals: &Signals) -> SubmitRequest {
    SubmitRequest {
        kind: RequestKind::Transfer,
        proof: proof_bytes(),
        public_signals: signals.values(),
        token: None,
        target_chain_id: CHAIN_ID,
    }
}
