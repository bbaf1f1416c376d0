use super::events::TransactionEvent;
use super::money::Amount;
use super::notification::PaymentNotification;
use super::status::PaymentStatus;
use super::transaction::{
    PriceQuote, Transaction, TransactionAggregate, TransactionDetail, TransactionItem,
};
use super::wallet::{CreditPlan, LedgerEntry, Wallet};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

/// A transaction row held under its row lock.
///
/// The lock is released when the handle is committed or dropped; dropping
/// without committing discards the read.
pub struct LockedTransaction {
    transaction: Transaction,
    _guard: OwnedMutexGuard<()>,
}

impl LockedTransaction {
    pub(crate) fn new(transaction: Transaction, guard: OwnedMutexGuard<()>) -> Self {
        Self {
            transaction,
            _guard: guard,
        }
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }
}

#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Writes the transaction, its details and its items in one atomic step.
    async fn create(&self, aggregate: &TransactionAggregate) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Transaction>>;
    async fn details(&self, transaction_id: Uuid) -> Result<Vec<TransactionDetail>>;
    async fn items(&self, detail_id: Uuid) -> Result<Vec<TransactionItem>>;
    async fn list_by_status(&self, status: PaymentStatus) -> Result<Vec<Transaction>>;
    /// Loads a transaction for update, waiting for any other holder of its row lock.
    async fn lock(&self, id: Uuid) -> Result<Option<LockedTransaction>>;
    /// Persists `updated` and releases the row lock.
    async fn commit(&self, lock: LockedTransaction, updated: Transaction) -> Result<()>;
}

#[async_trait]
pub trait WalletRepository: Send + Sync {
    async fn create(&self, wallet: &Wallet) -> Result<()>;
    async fn get(&self, wallet_id: Uuid) -> Result<Option<Wallet>>;
    async fn find_by_creator(&self, creator_id: Uuid) -> Result<Option<Wallet>>;
    async fn list(&self) -> Result<Vec<Wallet>>;
    async fn ledger(&self, wallet_id: Uuid) -> Result<Vec<LedgerEntry>>;
    /// Inserts every ledger row and applies every balance credit, or nothing.
    async fn apply_credits(&self, plan: &CreditPlan) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub order_id: String,
    pub gross_amount: Amount,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub token: String,
    pub redirect_url: String,
}

/// Authoritative status returned by a gateway poll.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub notification: PaymentNotification,
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_snapshot(
        &self,
        request: &SnapshotRequest,
    ) -> std::result::Result<Snapshot, GatewayError>;
    async fn check_status(&self, order_id: &str) -> std::result::Result<StatusReport, GatewayError>;
    fn server_key(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRequest {
    pub user_id: Uuid,
    pub creator_id: Uuid,
    pub photo_ids: Vec<Uuid>,
}

#[async_trait]
pub trait PhotoService: Send + Sync {
    async fn calculate_price(&self, request: &PriceRequest) -> Result<PriceQuote>;
}

/// Key-value cache with TTL markers and key-expiration notifications.
#[async_trait]
pub trait ExpiryCache: Send + Sync {
    async fn set_with_ttl(&self, key: &str, ttl: Duration) -> Result<()>;
    /// Receives the keys whose TTL ran out after this call.
    async fn subscribe_expired(&self) -> Result<UnboundedReceiver<String>>;
}

/// "Payment gateway is healthy again" signals.
#[async_trait]
pub trait RecoveryStream: Send + Sync {
    async fn publish_recovered(&self) -> Result<()>;
    /// Starts listening. Signals published from here on are not lost.
    fn subscribe(&self) -> Box<dyn RecoverySubscription>;
}

#[async_trait]
pub trait RecoverySubscription: Send {
    /// Waits for the next signal published after the subscription was taken.
    async fn recovered(&mut self) -> Result<()>;
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &TransactionEvent) -> Result<()>;
}

pub type TransactionRepositoryRef = Arc<dyn TransactionRepository>;
pub type WalletRepositoryRef = Arc<dyn WalletRepository>;
pub type PaymentGatewayRef = Arc<dyn PaymentGateway>;
pub type PhotoServiceRef = Arc<dyn PhotoService>;
pub type ExpiryCacheRef = Arc<dyn ExpiryCache>;
pub type RecoveryStreamRef = Arc<dyn RecoveryStream>;
pub type EventPublisherRef = Arc<dyn EventPublisher>;
