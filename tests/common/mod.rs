#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marketplace_settlement::application::checkout::{Checkout, CheckoutRequest};
use marketplace_settlement::application::reconciliation::ReconcileOutcome;
use marketplace_settlement::application::runtime::{Adapters, SettlementConfig, SettlementEngine};
use marketplace_settlement::domain::ports::{TransactionRepository, WalletRepository};
use marketplace_settlement::domain::status::GatewayStatus;
use marketplace_settlement::domain::transaction::Transaction;
use marketplace_settlement::domain::wallet::{CreditPlan, LedgerEntry, Wallet};
use marketplace_settlement::error::Result;
use marketplace_settlement::infrastructure::gateway::sandbox::SandboxGateway;
use marketplace_settlement::infrastructure::in_memory::InMemoryStore;
use marketplace_settlement::infrastructure::photo::StaticPhotoCatalog;
use marketplace_settlement::infrastructure::pubsub::{
    InMemoryBroker, InMemoryCache, InMemoryRecoveryStream,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

pub const SERVER_KEY: &str = "test-server-key";

/// An engine over in-process adapters, with handles on every adapter.
pub struct Harness {
    pub engine: SettlementEngine,
    pub store: InMemoryStore,
    pub gateway: Arc<SandboxGateway>,
    pub catalog: Arc<StaticPhotoCatalog>,
    pub cache: InMemoryCache,
    pub broker: Arc<InMemoryBroker>,
    pub wallets: Arc<SlowWallets>,
}

/// The store's wallet side with an adjustable delay on wallet lookups.
pub struct SlowWallets {
    store: InMemoryStore,
    lookup_delay_ms: AtomicU64,
}

impl SlowWallets {
    pub fn set_lookup_delay(&self, delay: Duration) {
        self.lookup_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl WalletRepository for SlowWallets {
    async fn create(&self, wallet: &Wallet) -> Result<()> {
        WalletRepository::create(&self.store, wallet).await
    }

    async fn get(&self, wallet_id: Uuid) -> Result<Option<Wallet>> {
        WalletRepository::get(&self.store, wallet_id).await
    }

    async fn find_by_creator(&self, creator_id: Uuid) -> Result<Option<Wallet>> {
        let delay = self.lookup_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.store.find_by_creator(creator_id).await
    }

    async fn list(&self) -> Result<Vec<Wallet>> {
        self.store.list().await
    }

    async fn ledger(&self, wallet_id: Uuid) -> Result<Vec<LedgerEntry>> {
        self.store.ledger(wallet_id).await
    }

    async fn apply_credits(&self, plan: &CreditPlan) -> Result<()> {
        self.store.apply_credits(plan).await
    }
}

/// Background scheduling is off; tests drive cycles by hand.
pub fn quiet_config() -> SettlementConfig {
    let mut config = SettlementConfig::default();
    config.scheduler.enabled = false;
    config
}

pub async fn harness() -> Harness {
    harness_with(quiet_config()).await
}

pub async fn harness_with(config: SettlementConfig) -> Harness {
    let store = InMemoryStore::new();
    let gateway = Arc::new(SandboxGateway::new(SERVER_KEY).with_offset(config.reconcile.gateway_offset));
    let catalog = Arc::new(StaticPhotoCatalog::default());
    let cache = InMemoryCache::new();
    let broker = Arc::new(InMemoryBroker::new());
    let wallets = Arc::new(SlowWallets {
        store: store.clone(),
        lookup_delay_ms: AtomicU64::new(0),
    });

    let engine = SettlementEngine::start(
        Adapters {
            transactions: Arc::new(store.clone()),
            wallets: wallets.clone(),
            gateway: gateway.clone(),
            photos: catalog.clone(),
            cache: Arc::new(cache.clone()),
            recovery: Arc::new(InMemoryRecoveryStream::new()),
            events: broker.clone(),
        },
        config,
    )
    .await
    .unwrap();

    Harness {
        engine,
        store,
        gateway,
        catalog,
        cache,
        broker,
        wallets,
    }
}

impl Harness {
    /// Registers a creator with a wallet and lists one photo per price.
    pub async fn creator(&self, prices: &[Decimal]) -> (Uuid, Vec<Uuid>) {
        let creator_id = Uuid::new_v4();
        WalletRepository::create(&self.store, &Wallet::new(creator_id))
            .await
            .unwrap();
        let photos = prices
            .iter()
            .map(|price| self.catalog.add(creator_id, *price, Decimal::ZERO))
            .collect();
        (creator_id, photos)
    }

    pub async fn checkout(&self, user_id: Uuid, photo_ids: Vec<Uuid>) -> Result<Checkout> {
        self.engine
            .checkout()
            .create_transaction(CheckoutRequest {
                user_id,
                creator_id: Uuid::nil(),
                photo_ids,
                email: "buyer@example.com".to_string(),
            })
            .await
    }

    /// Delivers a correctly signed webhook for `transaction`.
    pub async fn webhook(
        &self,
        transaction: &Transaction,
        status: GatewayStatus,
        settled_at: Option<DateTime<Utc>>,
    ) -> Result<ReconcileOutcome> {
        let notification = self.gateway.notification(
            &transaction.order_id(),
            &status,
            transaction.amount,
            settled_at,
        );
        let raw = serde_json::to_value(&notification).unwrap();
        self.engine.reconciliation().handle(notification, raw).await
    }

    pub async fn transaction(&self, id: Uuid) -> Transaction {
        TransactionRepository::get(&self.store, id)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn balance(&self, creator_id: Uuid) -> Decimal {
        WalletRepository::find_by_creator(&self.store, creator_id)
            .await
            .unwrap()
            .unwrap()
            .balance
            .value()
    }

    /// Polls until `check` holds for the transaction or a second has passed.
    pub async fn wait_for(&self, id: Uuid, check: impl Fn(&Transaction) -> bool) -> Transaction {
        for _ in 0..100 {
            let transaction = self.transaction(id).await;
            if check(&transaction) {
                return transaction;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.transaction(id).await
    }
}
