mod common;

use common::harness;
use marketplace_settlement::domain::ports::{TransactionRepository, WalletRepository};
use marketplace_settlement::domain::status::InternalStatus;
use marketplace_settlement::domain::wallet::Wallet;
use marketplace_settlement::error::SettlementError;
use rand::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[tokio::test]
async fn test_random_checkouts_split_amount_across_creators() {
    let h = harness().await;
    let mut rng = StdRng::seed_from_u64(190);

    let mut catalog = Vec::new();
    for _ in 0..5 {
        let prices: Vec<Decimal> = (0..4)
            .map(|_| Decimal::new(rng.gen_range(100..50_000), 2))
            .collect();
        let (creator, photos) = h.creator(&prices).await;
        catalog.extend(photos.into_iter().map(|photo| (photo, creator)));
    }

    for _ in 0..25 {
        let count = rng.gen_range(1..=8);
        let mut picked: Vec<Uuid> = catalog
            .choose_multiple(&mut rng, count)
            .map(|(photo, _)| *photo)
            .collect();
        // Duplicates must collapse.
        picked.push(picked[0]);

        let checkout = h.checkout(Uuid::new_v4(), picked.clone()).await.unwrap();
        let transaction = &checkout.transaction;
        let unique: HashSet<Uuid> = picked.iter().copied().collect();

        assert!(transaction.amount > Decimal::ZERO);
        assert_eq!(transaction.photo_ids.len(), unique.len());
        assert_eq!(transaction.internal_status(), InternalStatus::TokenReady);

        let details = TransactionRepository::details(&h.store, transaction.id)
            .await
            .unwrap();
        let creators: HashSet<Uuid> = catalog
            .iter()
            .filter(|(photo, _)| unique.contains(photo))
            .map(|(_, creator)| *creator)
            .collect();
        assert_eq!(details.len(), creators.len());

        let detail_total: Decimal = details.iter().map(|detail| detail.subtotal).sum();
        assert_eq!(detail_total, transaction.amount);

        let mut items_per_detail = HashMap::new();
        for detail in &details {
            let items = h.store.items(detail.id).await.unwrap();
            let item_total: Decimal = items.iter().map(|item| item.final_price).sum();
            assert_eq!(item_total, detail.subtotal);
            items_per_detail.insert(detail.id, items.len());
        }
        assert_eq!(items_per_detail.values().sum::<usize>(), unique.len());
    }
}

#[tokio::test]
async fn test_discounts_reduce_the_charged_amount() {
    let h = harness().await;
    let creator = Uuid::new_v4();
    WalletRepository::create(&h.store, &Wallet::new(creator))
        .await
        .unwrap();
    let discounted = h.catalog.add(creator, dec!(10000), dec!(2500));
    let free = h.catalog.add(creator, dec!(300), dec!(500));

    let checkout = h.checkout(Uuid::new_v4(), vec![discounted, free]).await.unwrap();
    assert_eq!(checkout.transaction.amount, dec!(7500));
}

#[tokio::test]
async fn test_checkout_rejects_empty_and_unpriced_requests() {
    let h = harness().await;
    let buyer = Uuid::new_v4();

    let empty = h.checkout(buyer, vec![]).await;
    assert!(matches!(empty, Err(SettlementError::Validation(_))));

    let unknown = h.checkout(buyer, vec![Uuid::new_v4()]).await;
    assert!(matches!(unknown, Err(SettlementError::Validation(_))));

    let creator = Uuid::new_v4();
    let free = h.catalog.add(creator, dec!(100), dec!(100));
    let zero = h.checkout(buyer, vec![free]).await;
    assert!(matches!(zero, Err(SettlementError::Validation(_))));

    assert!(h.store.list_transactions().await.is_empty());
    assert_eq!(h.gateway.snapshot_calls(), 0);
}
