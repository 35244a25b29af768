//! Submission pipeline scenarios against a scripted ledger.

mod common;

use common::*;
use ethers::types::U256;
use std::{sync::Arc, time::Duration};
use tokio::sync::Semaphore;
use zkpool_relayer::{
    signals::{field_hex, field_to_bytes},
    RelayerError, RequestKind, RevertReason,
};

#[tokio::test]
async fn test_withdraw_happy_path() {
    let harness = Harness::with_leaves();
    let signals = Signals::withdraw(101);

    let outcome = harness
        .pipeline
        .submit(withdraw_request(&signals))
        .await
        .unwrap();

    assert_eq!(outcome.chain_id, CHAIN_ID);
    let calls = harness.ledger.calls();
    assert_eq!(calls.submit, 1);

    // The local root was published before submitting.
    let root = harness.replayer.root().await;
    assert_eq!(harness.ledger.posted_roots(), vec![root]);

    let submitted = harness.ledger.submissions();
    assert_eq!(submitted[0].nullifier0, field_to_bytes(U256::from(101u64)));
    assert_eq!(submitted[0].recipient, recipient());
    assert_eq!(submitted[0].token, token());
    assert_eq!(submitted[0].proof.len(), 256);

    assert_eq!(harness.guard.in_flight(), 0);
}

#[tokio::test]
async fn test_transfer_uses_zero_token() {
    let harness = Harness::with_leaves();
    harness
        .pipeline
        .submit(transfer_request(&Signals::transfer(102)))
        .await
        .unwrap();

    let submitted = harness.ledger.submissions();
    assert!(submitted[0].token.is_zero());
    assert!(submitted[0].public_amount.is_zero());
}

#[tokio::test]
async fn test_transfer_with_amount_rejected_without_ledger_calls() {
    let harness = Harness::with_leaves();
    let mut signals = Signals::transfer(103);
    signals.public_amount = U256::from(5u64);

    let err = harness
        .pipeline
        .submit(transfer_request(&signals))
        .await
        .unwrap_err();

    assert!(matches!(err, RelayerError::Validation(_)));
    assert_eq!(harness.ledger.calls().total(), 0);
}

#[tokio::test]
async fn test_transfer_with_token_rejected() {
    let harness = Harness::with_leaves();
    let mut request = transfer_request(&Signals::transfer(104));
    request.token = Some(token());

    let err = harness.pipeline.submit(request).await.unwrap_err();
    assert!(matches!(err, RelayerError::Validation(_)));
}

#[tokio::test]
async fn test_chain_mismatch_rejected_before_lock() {
    let harness = Harness::with_leaves();
    let mut signals = Signals::withdraw(105);
    signals.chain_id = U256::from(1u64);

    // If validation took the lock it would conflict with this holder.
    let _held = harness.guard.lock(&[field_hex(U256::from(105u64))]).unwrap();

    let err = harness
        .pipeline
        .submit(withdraw_request(&signals))
        .await
        .unwrap_err();

    assert!(matches!(err, RelayerError::Validation(_)));
    assert_eq!(harness.ledger.calls().total(), 0);
}

#[tokio::test]
async fn test_unknown_chain() {
    let harness = Harness::with_leaves();
    let mut signals = Signals::withdraw(106);
    signals.chain_id = U256::from(999u64);
    let mut request = withdraw_request(&signals);
    request.target_chain_id = 999;

    let err = harness.pipeline.submit(request).await.unwrap_err();
    assert!(matches!(err, RelayerError::UnknownChain(999)));
}

#[tokio::test]
async fn test_withdraw_validation() {
    let harness = Harness::with_leaves();

    let mut request = withdraw_request(&Signals::withdraw(107));
    request.token = None;
    assert!(matches!(
        harness.pipeline.submit(request).await,
        Err(RelayerError::Validation(_))
    ));

    let mut signals = Signals::withdraw(107);
    signals.public_asset = U256::from(42u64);
    assert!(matches!(
        harness.pipeline.submit(withdraw_request(&signals)).await,
        Err(RelayerError::Validation(_))
    ));

    let mut request = withdraw_request(&Signals::withdraw(107));
    request.proof.truncate(100);
    assert!(matches!(
        harness.pipeline.submit(request).await,
        Err(RelayerError::Validation(_))
    ));

    let mut request = withdraw_request(&Signals::withdraw(107));
    request.public_signals.pop();
    assert!(matches!(
        harness.pipeline.submit(request).await,
        Err(RelayerError::Validation(_))
    ));

    let mut signals = Signals::withdraw(107);
    signals.nullifier1 = signals.nullifier0;
    assert!(matches!(
        harness.pipeline.submit(withdraw_request(&signals)).await,
        Err(RelayerError::Validation(_))
    ));

    assert_eq!(harness.ledger.calls().total(), 0);
}

#[tokio::test]
async fn test_concurrent_same_nullifier_one_wins() {
    let gate = Arc::new(Semaphore::new(0));
    let ledger = MockLedger::new(CHAIN_ID).with_gate(gate.clone());
    ledger.push_leaves(5, &[leaf(1)]);
    let harness = Harness::new(ledger, Duration::ZERO);
    let signals = Signals::withdraw(200);

    let first = {
        let pipeline = harness.pipeline.clone();
        let request = withdraw_request(&signals);
        tokio::spawn(async move { pipeline.submit(request).await })
    };

    // First request now holds the lock and sits inside submit.
    harness.ledger.submit_entered.notified().await;

    let second = harness.pipeline.submit(withdraw_request(&signals)).await;
    assert!(matches!(second, Err(RelayerError::Conflict { .. })));

    gate.add_permits(1);
    let first = first.await.unwrap();
    assert!(first.is_ok());

    assert_eq!(harness.ledger.calls().submit, 1);
    assert_eq!(harness.guard.in_flight(), 0);

    // The nullifier is free again for a third attempt.
    gate.add_permits(1);
    harness
        .pipeline
        .submit(withdraw_request(&signals))
        .await
        .unwrap();
    assert_eq!(harness.ledger.calls().submit, 2);
}

#[tokio::test]
async fn test_same_nullifier_conflicts_across_chains() {
    const OTHER_CHAIN: u64 = 10;
    let gate = Arc::new(Semaphore::new(0));
    let first_chain = MockLedger::new(CHAIN_ID).with_gate(gate.clone());
    first_chain.push_leaves(5, &[leaf(1)]);
    let second_chain = MockLedger::new(OTHER_CHAIN);
    second_chain.push_leaves(5, &[leaf(1)]);
    let harness = MultiChainHarness::new(vec![first_chain, second_chain]);

    let first = {
        let pipeline = harness.pipeline.clone();
        let request = transfer_request(&Signals::transfer(250));
        tokio::spawn(async move { pipeline.submit(request).await })
    };
    harness.ledgers[0].submit_entered.notified().await;

    let mut signals = Signals::transfer(250);
    signals.chain_id = U256::from(OTHER_CHAIN);
    let mut request = transfer_request(&signals);
    request.target_chain_id = OTHER_CHAIN;
    let err = harness.pipeline.submit(request).await.unwrap_err();

    assert!(matches!(err, RelayerError::Conflict { ref nullifier } if nullifier == &field_hex(U256::from(250u64))));
    assert_eq!(harness.ledgers[1].calls().submit, 0);

    gate.add_permits(1);
    first.await.unwrap().unwrap();
    assert_eq!(harness.guard.in_flight(), 0);
}

#[tokio::test]
async fn test_second_nullifier_conflicts() {
    let harness = Harness::with_leaves();
    let mut signals = Signals::withdraw(300);
    signals.nullifier1 = U256::from(301u64);

    let _held = harness.guard.lock(&[field_hex(U256::from(301u64))]).unwrap();
    let err = harness
        .pipeline
        .submit(withdraw_request(&signals))
        .await
        .unwrap_err();

    assert!(matches!(err, RelayerError::Conflict { ref nullifier } if nullifier == &field_hex(U256::from(301u64))));
    // nullifier0 was taken and handed back
    assert!(!harness.guard.is_held(&field_hex(U256::from(300u64))));
}

#[tokio::test]
async fn test_cooldown_rate_limits_repeat() {
    let ledger = MockLedger::new(CHAIN_ID);
    ledger.push_leaves(5, &[leaf(1)]);
    let harness = Harness::new(ledger, Duration::from_secs(10));
    let signals = Signals::withdraw(400);

    harness
        .pipeline
        .submit(withdraw_request(&signals))
        .await
        .unwrap();
    let err = harness
        .pipeline
        .submit(withdraw_request(&signals))
        .await
        .unwrap_err();

    match err {
        RelayerError::RateLimited { retry_after_ms } => assert!(retry_after_ms <= 10_000),
        other => panic!("expected rate limit, got {other:?}"),
    }
    assert_eq!(harness.ledger.calls().submit, 1);
}

#[tokio::test]
async fn test_unknown_root_retried_once() {
    let harness = Harness::with_leaves();
    harness.ledger.script_submit(vec![
        SubmitBehaviour::Revert("Unknown merkle root".into()),
        SubmitBehaviour::Succeed,
    ]);

    let outcome = harness
        .pipeline
        .submit(withdraw_request(&Signals::withdraw(500)))
        .await;

    assert!(outcome.is_ok());
    assert_eq!(harness.ledger.calls().submit, 2);

    // The tree was resynced and re-read against the pool between the attempts.
    let at_submit = harness.ledger.calls_at_submit();
    assert!(at_submit[1].block_number > at_submit[0].block_number);
    assert!(at_submit[1].root_reads > at_submit[0].root_reads);
}

#[tokio::test]
async fn test_unknown_root_twice_is_stale() {
    let harness = Harness::with_leaves();
    harness.ledger.script_submit(vec![
        SubmitBehaviour::Revert("Unknown merkle root".into()),
        SubmitBehaviour::Revert("Unknown merkle root".into()),
        SubmitBehaviour::Succeed,
    ]);

    let err = harness
        .pipeline
        .submit(withdraw_request(&Signals::withdraw(501)))
        .await
        .unwrap_err();

    assert!(matches!(err, RelayerError::StaleRoot));
    assert_eq!(harness.ledger.calls().submit, 2);
    assert_eq!(harness.guard.in_flight(), 0);

    let at_submit = harness.ledger.calls_at_submit();
    assert!(at_submit[1].block_number > at_submit[0].block_number);
}

#[tokio::test]
async fn test_spent_nullifier_not_retried() {
    let harness = Harness::with_leaves();
    harness
        .ledger
        .script_submit(vec![SubmitBehaviour::Revert("Input is already spent".into())]);

    let err = harness
        .pipeline
        .submit(withdraw_request(&Signals::withdraw(502)))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RelayerError::ChainSubmission(RevertReason::NullifierSpent)
    ));
    assert_eq!(harness.ledger.calls().submit, 1);
}

#[tokio::test]
async fn test_rpc_failure_surfaces_as_ledger_error() {
    let harness = Harness::with_leaves();
    harness
        .ledger
        .script_submit(vec![SubmitBehaviour::RpcError("connection reset".into())]);

    let err = harness
        .pipeline
        .submit(withdraw_request(&Signals::withdraw(503)))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayerError::Ledger(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_confirmation_timeout_releases_lock() {
    let harness = Harness::with_leaves();
    harness.ledger.set_confirm(ConfirmBehaviour::Timeout);

    let err = harness
        .pipeline
        .submit(withdraw_request(&Signals::withdraw(600)))
        .await
        .unwrap_err();

    assert!(matches!(err, RelayerError::Timeout { .. }));
    assert_eq!(harness.ledger.calls().submit, 1);
    assert_eq!(harness.guard.in_flight(), 0);
}

#[tokio::test]
async fn test_lost_receipt_keeps_tx_hash_and_is_not_retryable() {
    let harness = Harness::with_leaves();
    harness.ledger.set_confirm(ConfirmBehaviour::RpcError);

    let err = harness
        .pipeline
        .submit(withdraw_request(&Signals::withdraw(602)))
        .await
        .unwrap_err();

    match &err {
        RelayerError::Unconfirmed { tx_hash, reason } => {
            assert!(!tx_hash.is_zero());
            assert!(reason.contains("receipt poll failed"));
        }
        other => panic!("expected unconfirmed, got {other:?}"),
    }
    assert!(!err.is_retryable());
    assert_eq!(err.code(), "CONFIRMATION_UNKNOWN");
    assert_eq!(harness.ledger.calls().submit, 1);
    assert_eq!(harness.guard.in_flight(), 0);
}

#[tokio::test]
async fn test_reverted_receipt() {
    let harness = Harness::with_leaves();
    harness.ledger.set_confirm(ConfirmBehaviour::Reverted);

    let err = harness
        .pipeline
        .submit(withdraw_request(&Signals::withdraw(601)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RelayerError::ChainSubmission(RevertReason::Unknown)
    ));
}

#[tokio::test]
async fn test_post_submission_sync_failure_is_not_fatal() {
    let harness = Harness::with_leaves();
    harness.ledger.fail_reads_after_submit();

    let outcome = harness
        .pipeline
        .submit(withdraw_request(&Signals::withdraw(700)))
        .await;
    assert!(outcome.is_ok());
}

#[tokio::test]
async fn test_hex_signals_accepted() {
    let harness = Harness::with_leaves();
    let signals = Signals::withdraw(800);
    let mut request = withdraw_request(&signals);
    request.public_signals[1] = "0x320".to_string();
    assert_eq!(request.kind, RequestKind::Withdraw);

    harness.pipeline.submit(request).await.unwrap();
    assert_eq!(
        harness.ledger.submissions()[0].nullifier0,
        field_to_bytes(U256::from(800u64))
    );
}
