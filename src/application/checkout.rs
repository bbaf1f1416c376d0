use crate::application::cancellation::expiration_key;
use crate::application::retry::{RetryJob, RetryQueue};
use crate::domain::money::Amount;
use crate::domain::ports::{
    ExpiryCacheRef, PaymentGatewayRef, PhotoServiceRef, PriceRequest, SnapshotRequest,
    TransactionRepository, TransactionRepositoryRef,
};
use crate::domain::transaction::{Transaction, TransactionAggregate};
use crate::error::{Result, SettlementError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub user_id: Uuid,
    pub creator_id: Uuid,
    pub photo_ids: Vec<Uuid>,
    /// Buyer email from the authenticated request context.
    pub email: String,
}

/// Result of a checkout. `redirect_url` is empty when token issuance was deferred.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkout {
    pub transaction: Transaction,
    pub redirect_url: Option<String>,
}

impl Checkout {
    pub fn pay_token(&self) -> &str {
        self.transaction.pay_token.as_deref().unwrap_or_default()
    }
}

/// Creates transactions and requests their pay token.
pub struct CheckoutService {
    transactions: TransactionRepositoryRef,
    photos: PhotoServiceRef,
    gateway: PaymentGatewayRef,
    cache: ExpiryCacheRef,
    retries: RetryQueue,
    transaction_ttl: Duration,
}

impl CheckoutService {
    pub fn new(
        transactions: TransactionRepositoryRef,
        photos: PhotoServiceRef,
        gateway: PaymentGatewayRef,
        cache: ExpiryCacheRef,
        retries: RetryQueue,
        transaction_ttl: Duration,
    ) -> Self {
        Self {
            transactions,
            photos,
            gateway,
            cache,
            retries,
            transaction_ttl,
        }
    }

    #[instrument(skip(self, request), fields(user_id = %request.user_id, creator_id = %request.creator_id))]
    pub async fn create_transaction(&self, request: CheckoutRequest) -> Result<Checkout> {
        let photo_ids = unique_photo_ids(&request.photo_ids);
        if photo_ids.is_empty() {
            return Err(SettlementError::Validation(
                "at least one photo is required".to_string(),
            ));
        }

        let quote = self
            .photos
            .calculate_price(&PriceRequest {
                user_id: request.user_id,
                creator_id: request.creator_id,
                photo_ids: photo_ids.clone(),
            })
            .await?;
        if quote.items.is_empty() {
            return Err(SettlementError::Validation(
                "no purchasable photos in checkout".to_string(),
            ));
        }
        if quote.total.is_zero() {
            return Err(SettlementError::Validation(
                "total price must be positive".to_string(),
            ));
        }

        let aggregate = TransactionAggregate::from_quote(request.user_id, &quote, Utc::now())?;
        self.transactions.create(&aggregate).await?;
        let mut transaction = aggregate.transaction;
        info!(
            transaction_id = %transaction.id,
            amount = %transaction.amount,
            creators = aggregate.details.len(),
            "transaction created"
        );

        let key = expiration_key(transaction.id);
        if let Err(e) = self.cache.set_with_ttl(&key, self.transaction_ttl).await {
            warn!(transaction_id = %transaction.id, error = %e, "failed to schedule transaction expiry");
        }

        let snapshot_request = SnapshotRequest {
            order_id: transaction.order_id(),
            gross_amount: Amount::new(transaction.amount)?,
            email: request.email,
        };
        match self.gateway.create_snapshot(&snapshot_request).await {
            Ok(snapshot) => {
                if let Some(updated) =
                    attach_token(self.transactions.as_ref(), transaction.id, &snapshot.token).await?
                {
                    transaction = updated;
                }
                Ok(Checkout {
                    transaction,
                    redirect_url: Some(snapshot.redirect_url),
                })
            }
            Err(e) => {
                warn!(
                    transaction_id = %transaction.id,
                    error = %e,
                    "pay token issuance failed, continuing in background"
                );
                self.retries.enqueue(RetryJob {
                    transaction_id: transaction.id,
                    request: snapshot_request,
                });
                Ok(Checkout {
                    transaction,
                    redirect_url: None,
                })
            }
        }
    }
}

/// Stores a freshly issued pay token and moves the transaction to `TOKEN_READY`.
///
/// Returns `None` when the transaction stopped waiting for payment in the
/// meantime; it is left untouched.
pub async fn attach_token(
    transactions: &dyn TransactionRepository,
    transaction_id: Uuid,
    token: &str,
) -> Result<Option<Transaction>> {
    let lock = transactions
        .lock(transaction_id)
        .await?
        .ok_or_else(|| SettlementError::NotFound(format!("transaction {transaction_id}")))?;

    if !lock.transaction().internal_status().is_awaiting_payment() {
        info!(
            transaction_id = %transaction_id,
            status = %lock.transaction().internal_status(),
            "transaction no longer awaits payment, dropping pay token"
        );
        return Ok(None);
    }

    let mut updated = lock.transaction().clone();
    updated.attach_token(token, Utc::now())?;
    transactions.commit(lock, updated.clone()).await?;
    Ok(Some(updated))
}

fn unique_photo_ids(photo_ids: &[Uuid]) -> Vec<Uuid> {
    let mut seen = HashSet::with_capacity(photo_ids.len());
    photo_ids
        .iter()
        .copied()
        .filter(|id| seen.insert(*id))
        .collect()
}
