mod common;

use chrono::Utc;
use common::harness;
use marketplace_settlement::application::reconciliation::{IgnoreReason, ReconcileOutcome};
use marketplace_settlement::domain::ports::WalletRepository;
use marketplace_settlement::domain::status::{GatewayStatus, InternalStatus};
use rust_decimal_macros::dec;
use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
async fn test_duplicate_webhook_credits_once() {
    let h = harness().await;
    let (creator, photos) = h.creator(&[dec!(9000)]).await;
    let checkout = h.checkout(Uuid::new_v4(), photos).await.unwrap();
    let settled_at = Some(Utc::now());

    let first = h
        .webhook(&checkout.transaction, GatewayStatus::Settlement, settled_at)
        .await
        .unwrap();
    let second = h
        .webhook(&checkout.transaction, GatewayStatus::Settlement, settled_at)
        .await
        .unwrap();

    assert!(first.is_applied());
    assert_eq!(
        second,
        ReconcileOutcome::Ignored {
            transaction_id: checkout.transaction.id,
            reason: IgnoreReason::AlreadyFinal(InternalStatus::Settled),
        }
    );
    assert_eq!(h.balance(creator).await, dec!(9000));
    assert_eq!(h.broker.published().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_webhooks_credit_once() {
    let h = harness().await;
    let (creator, photos) = h.creator(&[dec!(2500), dec!(2500)]).await;
    let checkout = h.checkout(Uuid::new_v4(), photos).await.unwrap();
    let tx = &checkout.transaction;
    let at = Some(Utc::now());

    let outcomes = tokio::join!(
        h.webhook(tx, GatewayStatus::Settlement, at),
        h.webhook(tx, GatewayStatus::Settlement, at),
        h.webhook(tx, GatewayStatus::Capture, at),
        h.webhook(tx, GatewayStatus::Settlement, at),
        h.webhook(tx, GatewayStatus::Deny, None),
    );
    let outcomes = [outcomes.0, outcomes.1, outcomes.2, outcomes.3, outcomes.4];

    let applied = outcomes
        .iter()
        .filter(|outcome| outcome.as_ref().unwrap().is_applied())
        .count();
    assert_eq!(applied, 1);

    let status = h.transaction(tx.id).await.internal_status();
    let wallet = WalletRepository::find_by_creator(&h.store, creator)
        .await
        .unwrap()
        .unwrap();
    let ledger = h.store.ledger(wallet.id).await.unwrap();
    match status {
        InternalStatus::Settled => {
            assert_eq!(wallet.balance.value(), dec!(5000));
            assert_eq!(ledger.len(), 1);
        }
        InternalStatus::Failed => {
            assert_eq!(wallet.balance.value(), dec!(0));
            assert!(ledger.is_empty());
        }
        other => panic!("unexpected final status {other}"),
    }
}

#[tokio::test]
async fn test_expiry_after_settlement_is_ignored() {
    let h = harness().await;
    let (creator, photos) = h.creator(&[dec!(1200)]).await;
    let checkout = h.checkout(Uuid::new_v4(), photos).await.unwrap();
    h.webhook(&checkout.transaction, GatewayStatus::Settlement, Some(Utc::now()))
        .await
        .unwrap();

    h.engine
        .cancellation()
        .expire(checkout.transaction.id)
        .await
        .unwrap();
    h.engine
        .cancellation()
        .expire(checkout.transaction.id)
        .await
        .unwrap();

    assert_eq!(
        h.transaction(checkout.transaction.id).await.internal_status(),
        InternalStatus::Settled
    );
    assert_eq!(h.balance(creator).await, dec!(1200));
}

#[tokio::test]
async fn test_replayed_checkout_requests_create_separate_transactions() {
    let h = harness().await;
    let (_, photos) = h.creator(&[dec!(100)]).await;
    let buyer = Uuid::new_v4();

    let first = h.checkout(buyer, photos.clone()).await.unwrap();
    let second = h.checkout(buyer, photos).await.unwrap();

    assert_ne!(first.transaction.id, second.transaction.id);
    assert_ne!(first.pay_token(), second.pay_token());
    assert_eq!(h.gateway.snapshot_calls(), 2);
}

#[tokio::test]
async fn test_settlement_is_credited_when_the_caller_stops_waiting() {
    let h = harness().await;
    let (creator, photos) = h.creator(&[dec!(9000)]).await;
    let checkout = h.checkout(Uuid::new_v4(), photos).await.unwrap();
    let id = checkout.transaction.id;
    h.wallets.set_lookup_delay(Duration::from_millis(200));

    let dropped = tokio::time::timeout(
        Duration::from_millis(50),
        h.webhook(&checkout.transaction, GatewayStatus::Settlement, Some(Utc::now())),
    )
    .await;
    assert!(dropped.is_err());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.transaction(id).await.internal_status(), InternalStatus::Settled);
    assert_eq!(h.balance(creator).await, dec!(9000));

    let replay = h
        .webhook(&checkout.transaction, GatewayStatus::Settlement, Some(Utc::now()))
        .await
        .unwrap();
    assert_eq!(
        replay,
        ReconcileOutcome::Ignored {
            transaction_id: id,
            reason: IgnoreReason::AlreadyFinal(InternalStatus::Settled),
        }
    );
    assert_eq!(h.balance(creator).await, dec!(9000));
}
