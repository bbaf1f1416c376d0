use crate::domain::ports::{TransactionRepositoryRef, WalletRepositoryRef};
use crate::domain::transaction::Transaction;
use crate::domain::wallet::CreditPlan;
use crate::error::{Result, SettlementError};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::info;

/// Credits creator wallets for a settled transaction.
///
/// One ledger row per detail and one balance increment per distinct wallet,
/// written in a single atomic step.
#[derive(Clone)]
pub struct WalletDistributor {
    transactions: TransactionRepositoryRef,
    wallets: WalletRepositoryRef,
}

impl WalletDistributor {
    pub fn new(transactions: TransactionRepositoryRef, wallets: WalletRepositoryRef) -> Self {
        Self {
            transactions,
            wallets,
        }
    }

    pub async fn distribute(&self, transaction: &Transaction) -> Result<CreditPlan> {
        let details = self.transactions.details(transaction.id).await?;
        for detail in &details {
            let items = self.transactions.items(detail.id).await?;
            let item_total: Decimal = items.iter().map(|item| item.final_price).sum();
            if item_total != detail.subtotal {
                return Err(SettlementError::internal(format!(
                    "detail {} subtotal {} does not match its items ({item_total})",
                    detail.id, detail.subtotal
                )));
            }
        }

        let mut wallets = HashMap::new();
        for detail in &details {
            if wallets.contains_key(&detail.creator_id) {
                continue;
            }
            let wallet = self
                .wallets
                .find_by_creator(detail.creator_id)
                .await?
                .ok_or_else(|| {
                    SettlementError::NotFound(format!("wallet for creator {}", detail.creator_id))
                })?;
            wallets.insert(detail.creator_id, wallet);
        }

        let plan = CreditPlan::build(&details, &wallets, Utc::now())?;
        self.wallets.apply_credits(&plan).await?;
        info!(
            transaction_id = %transaction.id,
            wallets = plan.credits.len(),
            total = %plan.total(),
            "settled funds distributed"
        );
        Ok(plan)
    }
}
