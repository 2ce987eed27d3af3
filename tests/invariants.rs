//! §8 invariants and idempotence properties, exercised against a live
//! `Engine` rather than the pure unit-level checks already covering
//! `Ift`/`Orchestrator`/`BalanceManager` in isolation.
mod common;

use std::time::Duration;

use common::*;
use pubtx_engine::interfaces::indexer::IndexedTransaction;
use pubtx_engine::interfaces::ReceiptResult;
use pubtx_engine::types::TxStatus;
use pubtx_engine::EngineError;

#[tokio::test]
async fn nonces_for_one_signer_are_contiguous_and_unique() {
    let harness = harness();
    let from = signer(0x11);
    harness.ledger.set_next_nonce(from, 0);
    fund(&harness.ledger, from, 1_000_000_000);

    let ids: Vec<_> = (0..5).map(|_| new_id()).collect();
    for &id in &ids {
        harness
            .engine
            .handle_new_transaction(id, from, transfer_payload(signer(0x22), 1), Some(21_000))
            .await
            .unwrap();
    }

    wait_until(Duration::from_secs(2), Duration::from_millis(10), || async {
        let mut nonces: Vec<u64> = Vec::new();
        for &id in &ids {
            let Some(ptx) = harness.store.get_transaction_by_id(id).await.unwrap() else {
                return false;
            };
            let Some(nonce) = ptx.nonce else {
                return false;
            };
            nonces.push(nonce);
        }
        nonces.len() == ids.len()
    })
    .await;

    let mut nonces: Vec<u64> = Vec::new();
    for &id in &ids {
        let ptx = harness.store.get_transaction_by_id(id).await.unwrap().unwrap();
        nonces.push(ptx.nonce.unwrap());
    }
    nonces.sort_unstable();
    let expected: Vec<u64> = (0..5).collect();
    assert_eq!(nonces, expected, "nonces must be a contiguous run with no duplicates");
}

#[tokio::test]
async fn duplicate_request_id_is_idempotent() {
    let harness = harness();
    let from = signer(0x11);
    harness.ledger.set_next_nonce(from, 0);
    fund(&harness.ledger, from, 1_000_000_000);

    let id = new_id();
    let payload = transfer_payload(signer(0x22), 1);

    let first = harness
        .engine
        .handle_new_transaction(id, from, payload.clone(), Some(21_000))
        .await
        .unwrap();
    let second = harness
        .engine
        .handle_new_transaction(id, from, payload, Some(21_000))
        .await
        .unwrap();

    assert_eq!(first, second);
    let matching = harness
        .store
        .list_transactions(pubtx_engine::interfaces::TransactionFilter {
            from: Some(from),
            status: None,
        })
        .await
        .unwrap();
    assert_eq!(matching.len(), 1, "a duplicate id must not insert a second record");
}

#[tokio::test]
async fn resume_on_a_non_suspended_transaction_is_a_no_op() {
    let harness = harness();
    let from = signer(0x11);
    harness.ledger.set_next_nonce(from, 0);
    fund(&harness.ledger, from, 1_000_000_000);

    let id = new_id();
    harness
        .engine
        .handle_new_transaction(id, from, transfer_payload(signer(0x22), 1), Some(21_000))
        .await
        .unwrap();

    harness.engine.handle_resume_transaction(id).await.unwrap();
    let ptx = harness.store.get_transaction_by_id(id).await.unwrap().unwrap();
    assert_eq!(ptx.status, TxStatus::Pending);
}

#[tokio::test]
async fn terminal_status_never_downgrades_via_resume() {
    let harness = harness();
    let from = signer(0x11);
    harness.ledger.set_next_nonce(from, 0);
    fund(&harness.ledger, from, 1_000_000_000);
    confirm_next_submissions(&harness.ledger, 0, 1, ReceiptResult::Failed);

    let id = new_id();
    harness
        .engine
        .handle_new_transaction(id, from, transfer_payload(signer(0x22), 1), Some(21_000))
        .await
        .unwrap();

    wait_until(Duration::from_secs(2), Duration::from_millis(10), || async {
        status_of(&harness.store, id).await == Some(TxStatus::Failed)
    })
    .await;

    let err = harness.engine.handle_resume_transaction(id).await.unwrap_err();
    assert!(matches!(err, EngineError::TerminalStatusUpdate(..)));
    let ptx = harness.store.get_transaction_by_id(id).await.unwrap().unwrap();
    assert_eq!(ptx.status, TxStatus::Failed);
}

#[tokio::test]
async fn replaying_the_same_confirmation_is_idempotent() {
    let harness = harness();
    let from = signer(0x11);
    harness.ledger.set_next_nonce(from, 0);
    fund(&harness.ledger, from, 1_000_000_000);
    confirm_next_submissions(&harness.ledger, 0, 1, ReceiptResult::Success);

    let id = new_id();
    harness
        .engine
        .handle_new_transaction(id, from, transfer_payload(signer(0x22), 1), Some(21_000))
        .await
        .unwrap();

    wait_until(Duration::from_secs(2), Duration::from_millis(10), || async {
        status_of(&harness.store, id).await == Some(TxStatus::Succeeded)
    })
    .await;

    let indexed = IndexedTransaction {
        block_number: 1,
        tx_index: 0,
        hash: synthetic_hash(0),
        result: ReceiptResult::Success,
        nonce: 0,
        from,
    };

    // The IFT has already been reaped once Succeeded; replaying the same
    // confirmation must be a harmless no-op, not an error or a second
    // transition.
    harness.engine.handle_confirmed_transactions(vec![indexed.clone()]).await;
    harness.engine.handle_confirmed_transactions(vec![indexed]).await;

    let ptx = harness.store.get_transaction_by_id(id).await.unwrap().unwrap();
    assert_eq!(ptx.status, TxStatus::Succeeded);
}
