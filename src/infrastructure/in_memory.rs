use crate::domain::ports::{LockedTransaction, TransactionRepository, WalletRepository};
use crate::domain::status::PaymentStatus;
use crate::domain::transaction::{
    Transaction, TransactionAggregate, TransactionDetail, TransactionItem,
};
use crate::domain::wallet::{CreditPlan, LedgerEntry, Wallet};
use crate::error::{Result, SettlementError};
use crate::infrastructure::locks::RowLocks;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    transactions: HashMap<Uuid, Transaction>,
    details: Vec<TransactionDetail>,
    items: Vec<TransactionItem>,
    wallets: HashMap<Uuid, Wallet>,
    ledger: Vec<LedgerEntry>,
}

/// A thread-safe in-memory store for every table.
///
/// All tables live under one `RwLock`, so each compound write is applied in a
/// single critical section and is all-or-nothing. Row locks for
/// read-modify-write come from [`RowLocks`].
#[derive(Default, Clone)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
    locks: RowLocks,
}

impl InMemoryStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a transaction row directly, without details. Meant for seeding.
    pub async fn insert_transaction(&self, transaction: Transaction) {
        let mut tables = self.tables.write().await;
        tables.transactions.insert(transaction.id, transaction);
    }

    pub async fn list_transactions(&self) -> Vec<Transaction> {
        let tables = self.tables.read().await;
        let mut transactions: Vec<_> = tables.transactions.values().cloned().collect();
        transactions.sort_by_key(|transaction| transaction.created_at);
        transactions
    }
}

#[async_trait]
impl TransactionRepository for InMemoryStore {
    async fn create(&self, aggregate: &TransactionAggregate) -> Result<()> {
        let mut tables = self.tables.write().await;
        let id = aggregate.transaction.id;
        if tables.transactions.contains_key(&id) {
            return Err(SettlementError::Conflict(format!("transaction {id} already exists")));
        }
        tables.transactions.insert(id, aggregate.transaction.clone());
        tables.details.extend(aggregate.details.iter().cloned());
        tables.items.extend(aggregate.items.iter().cloned());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Transaction>> {
        let tables = self.tables.read().await;
        Ok(tables.transactions.get(&id).cloned())
    }

    async fn details(&self, transaction_id: Uuid) -> Result<Vec<TransactionDetail>> {
        let tables = self.tables.read().await;
        Ok(tables
            .details
            .iter()
            .filter(|detail| detail.transaction_id == transaction_id)
            .cloned()
            .collect())
    }

    async fn items(&self, detail_id: Uuid) -> Result<Vec<TransactionItem>> {
        let tables = self.tables.read().await;
        Ok(tables
            .items
            .iter()
            .filter(|item| item.detail_id == detail_id)
            .cloned()
            .collect())
    }

    async fn list_by_status(&self, status: PaymentStatus) -> Result<Vec<Transaction>> {
        let tables = self.tables.read().await;
        let mut transactions: Vec<_> = tables
            .transactions
            .values()
            .filter(|transaction| transaction.status() == status)
            .cloned()
            .collect();
        transactions.sort_by_key(|transaction| transaction.created_at);
        Ok(transactions)
    }

    async fn lock(&self, id: Uuid) -> Result<Option<LockedTransaction>> {
        let guard = self.locks.acquire(id).await;
        let tables = self.tables.read().await;
        Ok(tables
            .transactions
            .get(&id)
            .cloned()
            .map(|transaction| LockedTransaction::new(transaction, guard)))
    }

    async fn commit(&self, lock: LockedTransaction, updated: Transaction) -> Result<()> {
        if lock.transaction().id != updated.id {
            return Err(SettlementError::internal(format!(
                "row lock for {} cannot commit transaction {}",
                lock.transaction().id,
                updated.id
            )));
        }
        let mut tables = self.tables.write().await;
        tables.transactions.insert(updated.id, updated);
        drop(tables);
        drop(lock);
        Ok(())
    }
}

#[async_trait]
impl WalletRepository for InMemoryStore {
    async fn create(&self, wallet: &Wallet) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables
            .wallets
            .values()
            .any(|existing| existing.creator_id == wallet.creator_id)
        {
            return Err(SettlementError::Conflict(format!(
                "creator {} already has a wallet",
                wallet.creator_id
            )));
        }
        tables.wallets.insert(wallet.id, wallet.clone());
        Ok(())
    }

    async fn get(&self, wallet_id: Uuid) -> Result<Option<Wallet>> {
        let tables = self.tables.read().await;
        Ok(tables.wallets.get(&wallet_id).cloned())
    }

    async fn find_by_creator(&self, creator_id: Uuid) -> Result<Option<Wallet>> {
        let tables = self.tables.read().await;
        Ok(tables
            .wallets
            .values()
            .find(|wallet| wallet.creator_id == creator_id)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Wallet>> {
        let tables = self.tables.read().await;
        let mut wallets: Vec<_> = tables.wallets.values().cloned().collect();
        wallets.sort_by_key(|wallet| wallet.creator_id);
        Ok(wallets)
    }

    async fn ledger(&self, wallet_id: Uuid) -> Result<Vec<LedgerEntry>> {
        let tables = self.tables.read().await;
        Ok(tables
            .ledger
            .iter()
            .filter(|entry| entry.wallet_id == wallet_id)
            .cloned()
            .collect())
    }

    async fn apply_credits(&self, plan: &CreditPlan) -> Result<()> {
        let mut tables = self.tables.write().await;

        for wallet_id in plan.credits.keys() {
            if !tables.wallets.contains_key(wallet_id) {
                return Err(SettlementError::NotFound(format!("wallet {wallet_id}")));
            }
        }
        let mut pairs: HashSet<(Uuid, Uuid)> = tables
            .ledger
            .iter()
            .map(|entry| (entry.wallet_id, entry.detail_id))
            .collect();
        for entry in &plan.entries {
            if !pairs.insert((entry.wallet_id, entry.detail_id)) {
                return Err(SettlementError::Conflict(format!(
                    "wallet {} was already credited for detail {}",
                    entry.wallet_id, entry.detail_id
                )));
            }
        }

        tables.ledger.extend(plan.entries.iter().cloned());
        for (wallet_id, amount) in &plan.credits {
            if let Some(wallet) = tables.wallets.get_mut(wallet_id) {
                wallet.balance.credit(*amount);
            }
        }
        Ok(())
    }
}
