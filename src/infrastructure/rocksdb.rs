use crate::domain::ports::{LockedTransaction, TransactionRepository, WalletRepository};
use crate::domain::status::PaymentStatus;
use crate::domain::transaction::{
    Transaction, TransactionAggregate, TransactionDetail, TransactionItem,
};
use crate::domain::wallet::{CreditPlan, LedgerEntry, Wallet};
use crate::error::{Result, SettlementError};
use crate::infrastructure::locks::RowLocks;
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Column Family for transaction rows, keyed by transaction id.
pub const CF_TRANSACTIONS: &str = "transactions";
/// Column Family for details, keyed by transaction id then detail id.
pub const CF_DETAILS: &str = "transaction_details";
/// Column Family for items, keyed by detail id then item id.
pub const CF_ITEMS: &str = "transaction_items";
/// Column Family for wallets, keyed by wallet id.
pub const CF_WALLETS: &str = "wallets";
/// Index from creator id to wallet id.
pub const CF_WALLET_CREATORS: &str = "wallet_creators";
/// Column Family for ledger entries, keyed by wallet id then detail id.
pub const CF_LEDGER: &str = "transaction_wallets";

const COLUMN_FAMILIES: [&str; 6] = [
    CF_TRANSACTIONS,
    CF_DETAILS,
    CF_ITEMS,
    CF_WALLETS,
    CF_WALLET_CREATORS,
    CF_LEDGER,
];

fn compound_key(first: Uuid, second: Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(first.as_bytes());
    key.extend_from_slice(second.as_bytes());
    key
}

/// A persistent store implementation using RocksDB.
///
/// Every table lives in its own Column Family and values are JSON. Compound
/// writes go through a single `WriteBatch`; writes that read before they write
/// (ledger and balances) are serialized by `writer`. Row locks are in-process.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    locks: RowLocks,
    writer: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path, creating any
    /// missing column family.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            locks: RowLocks::new(),
            writer: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &'static str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| SettlementError::Storage(format!("column family {name} not found")))
    }

    fn read<T: DeserializeOwned>(&self, name: &'static str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(name)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every value whose key starts with `prefix`; an empty prefix scans the family.
    fn scan<T: DeserializeOwned>(&self, name: &'static str, prefix: &[u8]) -> Result<Vec<T>> {
        let cf = self.cf(name)?;
        let mut values = Vec::new();
        for entry in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = entry?;
            if !key.starts_with(prefix) {
                break;
            }
            values.push(serde_json::from_slice(&value)?);
        }
        Ok(values)
    }

    fn put<T: Serialize>(
        &self,
        batch: &mut WriteBatch,
        name: &'static str,
        key: &[u8],
        value: &T,
    ) -> Result<()> {
        let cf = self.cf(name)?;
        batch.put_cf(cf, key, serde_json::to_vec(value)?);
        Ok(())
    }

    fn exists(&self, name: &'static str, key: &[u8]) -> Result<bool> {
        let cf = self.cf(name)?;
        Ok(self.db.get_pinned_cf(cf, key)?.is_some())
    }
}

#[async_trait]
impl TransactionRepository for RocksDBStore {
    async fn create(&self, aggregate: &TransactionAggregate) -> Result<()> {
        let _writer = self.writer.lock().await;
        let transaction = &aggregate.transaction;
        if self.exists(CF_TRANSACTIONS, transaction.id.as_bytes())? {
            return Err(SettlementError::Conflict(format!(
                "transaction {} already exists",
                transaction.id
            )));
        }

        let mut batch = WriteBatch::default();
        self.put(&mut batch, CF_TRANSACTIONS, transaction.id.as_bytes(), transaction)?;
        for detail in &aggregate.details {
            self.put(
                &mut batch,
                CF_DETAILS,
                &compound_key(detail.transaction_id, detail.id),
                detail,
            )?;
        }
        for item in &aggregate.items {
            self.put(&mut batch, CF_ITEMS, &compound_key(item.detail_id, item.id), item)?;
        }
        self.db.write(batch)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Transaction>> {
        self.read(CF_TRANSACTIONS, id.as_bytes())
    }

    async fn details(&self, transaction_id: Uuid) -> Result<Vec<TransactionDetail>> {
        self.scan(CF_DETAILS, transaction_id.as_bytes())
    }

    async fn items(&self, detail_id: Uuid) -> Result<Vec<TransactionItem>> {
        self.scan(CF_ITEMS, detail_id.as_bytes())
    }

    async fn list_by_status(&self, status: PaymentStatus) -> Result<Vec<Transaction>> {
        let mut transactions: Vec<Transaction> = self
            .scan::<Transaction>(CF_TRANSACTIONS, &[])?
            .into_iter()
            .filter(|transaction| transaction.status() == status)
            .collect();
        transactions.sort_by_key(|transaction| transaction.created_at);
        Ok(transactions)
    }

    async fn lock(&self, id: Uuid) -> Result<Option<LockedTransaction>> {
        let guard = self.locks.acquire(id).await;
        Ok(self
            .read::<Transaction>(CF_TRANSACTIONS, id.as_bytes())?
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
        let mut batch = WriteBatch::default();
        self.put(&mut batch, CF_TRANSACTIONS, updated.id.as_bytes(), &updated)?;
        self.db.write(batch)?;
        drop(lock);
        Ok(())
    }
}

#[async_trait]
impl WalletRepository for RocksDBStore {
    async fn create(&self, wallet: &Wallet) -> Result<()> {
        let _writer = self.writer.lock().await;
        if self.exists(CF_WALLET_CREATORS, wallet.creator_id.as_bytes())? {
            return Err(SettlementError::Conflict(format!(
                "creator {} already has a wallet",
                wallet.creator_id
            )));
        }
        let mut batch = WriteBatch::default();
        self.put(&mut batch, CF_WALLETS, wallet.id.as_bytes(), wallet)?;
        self.put(&mut batch, CF_WALLET_CREATORS, wallet.creator_id.as_bytes(), &wallet.id)?;
        self.db.write(batch)?;
        Ok(())
    }

    async fn get(&self, wallet_id: Uuid) -> Result<Option<Wallet>> {
        self.read(CF_WALLETS, wallet_id.as_bytes())
    }

    async fn find_by_creator(&self, creator_id: Uuid) -> Result<Option<Wallet>> {
        match self.read::<Uuid>(CF_WALLET_CREATORS, creator_id.as_bytes())? {
            Some(wallet_id) => self.read(CF_WALLETS, wallet_id.as_bytes()),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<Wallet>> {
        let mut wallets: Vec<Wallet> = self.scan(CF_WALLETS, &[])?;
        wallets.sort_by_key(|wallet| wallet.creator_id);
        Ok(wallets)
    }

    async fn ledger(&self, wallet_id: Uuid) -> Result<Vec<LedgerEntry>> {
        self.scan(CF_LEDGER, wallet_id.as_bytes())
    }

    async fn apply_credits(&self, plan: &CreditPlan) -> Result<()> {
        let _writer = self.writer.lock().await;

        let mut wallets = HashMap::with_capacity(plan.credits.len());
        for wallet_id in plan.credits.keys() {
            let wallet: Wallet = self
                .read(CF_WALLETS, wallet_id.as_bytes())?
                .ok_or_else(|| SettlementError::NotFound(format!("wallet {wallet_id}")))?;
            wallets.insert(*wallet_id, wallet);
        }

        let mut batch = WriteBatch::default();
        let mut keys = Vec::with_capacity(plan.entries.len());
        for entry in &plan.entries {
            let key = compound_key(entry.wallet_id, entry.detail_id);
            if keys.contains(&key) || self.exists(CF_LEDGER, &key)? {
                return Err(SettlementError::Conflict(format!(
                    "wallet {} was already credited for detail {}",
                    entry.wallet_id, entry.detail_id
                )));
            }
            self.put(&mut batch, CF_LEDGER, &key, entry)?;
            keys.push(key);
        }
        for (wallet_id, amount) in &plan.credits {
            if let Some(wallet) = wallets.get_mut(wallet_id) {
                wallet.balance.credit(*amount);
                self.put(&mut batch, CF_WALLETS, wallet_id.as_bytes(), wallet)?;
            }
        }
        self.db.write(batch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Balance;
    use crate::domain::status::InternalStatus;
    use crate::domain::transaction::{PriceQuote, PricedPhoto};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn aggregate(creators: &[Uuid]) -> TransactionAggregate {
        let items: Vec<_> = creators
            .iter()
            .map(|creator_id| PricedPhoto {
                photo_id: Uuid::new_v4(),
                creator_id: *creator_id,
                price: dec!(20),
                discount: dec!(0),
                final_price: dec!(20),
                discount_id: None,
            })
            .collect();
        let total = items.iter().map(|item| item.final_price).sum();
        TransactionAggregate::from_quote(Uuid::new_v4(), &PriceQuote { items, total }, Utc::now())
            .unwrap()
    }

    #[tokio::test]
    async fn test_rocksdb_open_cf() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).expect("Failed to open RocksDB");

        for name in COLUMN_FAMILIES {
            assert!(store.db.cf_handle(name).is_some(), "{name} missing");
        }
    }

    #[tokio::test]
    async fn test_rocksdb_aggregate_round_trip() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();
        let aggregate = aggregate(&[Uuid::new_v4(), Uuid::new_v4()]);

        TransactionRepository::create(&store, &aggregate).await.unwrap();

        let stored = TransactionRepository::get(&store, aggregate.transaction.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, aggregate.transaction);
        let mut details = store.details(stored.id).await.unwrap();
        details.sort_by_key(|detail| detail.creator_id);
        assert_eq!(details, aggregate.details);
        for detail in &details {
            assert_eq!(store.items(detail.id).await.unwrap().len(), 1);
        }
        assert_eq!(store.list_by_status(PaymentStatus::Pending).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rocksdb_commit_updates_row() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();
        let aggregate = aggregate(&[Uuid::new_v4()]);
        TransactionRepository::create(&store, &aggregate).await.unwrap();

        let lock = store.lock(aggregate.transaction.id).await.unwrap().unwrap();
        let mut updated = lock.transaction().clone();
        updated.attach_token("tok", Utc::now()).unwrap();
        store.commit(lock, updated).await.unwrap();

        let stored = TransactionRepository::get(&store, aggregate.transaction.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.internal_status(), InternalStatus::TokenReady);
        assert_eq!(stored.pay_token.as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn test_rocksdb_ledger_rejects_duplicates() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();
        let wallet = Wallet::new(Uuid::new_v4());
        WalletRepository::create(&store, &wallet).await.unwrap();

        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            wallet_id: wallet.id,
            detail_id: Uuid::new_v4(),
            amount: dec!(7.5),
            created_at: Utc::now(),
        };
        let plan = CreditPlan {
            entries: vec![entry],
            credits: BTreeMap::from([(wallet.id, dec!(7.5))]),
        };
        store.apply_credits(&plan).await.unwrap();
        let replay = store.apply_credits(&plan).await;

        assert!(matches!(replay, Err(SettlementError::Conflict(_))));
        let stored = store.find_by_creator(wallet.creator_id).await.unwrap().unwrap();
        assert_eq!(stored.balance, Balance::new(dec!(7.5)));
        assert_eq!(store.ledger(wallet.id).await.unwrap().len(), 1);
    }
}
