use crate::domain::money::Balance;
use crate::domain::transaction::TransactionDetail;
use crate::error::{Result, SettlementError};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// A creator's wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: Uuid,
    pub creator_id: Uuid,
    pub balance: Balance,
}

impl Wallet {
    pub fn new(creator_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            creator_id,
            balance: Balance::ZERO,
        }
    }
}

/// Append-only record crediting a wallet for one transaction detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub detail_id: Uuid,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Everything one settlement writes: ledger rows plus one credit per wallet.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CreditPlan {
    pub entries: Vec<LedgerEntry>,
    pub credits: BTreeMap<Uuid, Decimal>,
}

impl CreditPlan {
    /// Builds one ledger row per detail and sums credits per wallet.
    ///
    /// `wallets` maps creator id to wallet; a detail whose creator has no wallet
    /// fails the whole plan.
    pub fn build(
        details: &[TransactionDetail],
        wallets: &HashMap<Uuid, Wallet>,
        at: DateTime<Utc>,
    ) -> Result<Self> {
        let mut plan = Self::default();
        for detail in details {
            let wallet = wallets.get(&detail.creator_id).ok_or_else(|| {
                SettlementError::NotFound(format!("wallet for creator {}", detail.creator_id))
            })?;
            plan.entries.push(LedgerEntry {
                id: Uuid::new_v4(),
                wallet_id: wallet.id,
                detail_id: detail.id,
                amount: detail.subtotal,
                created_at: at,
            });
            *plan.credits.entry(wallet.id).or_insert(Decimal::ZERO) += detail.subtotal;
        }
        Ok(plan)
    }

    pub fn total(&self) -> Decimal {
        self.credits.values().copied().sum()
    }
}
