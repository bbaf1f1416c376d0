use crate::domain::events::TransactionEvent;
use crate::domain::ports::{EventPublisherRef, ExpiryCacheRef, TransactionRepositoryRef};
use crate::domain::status::InternalStatus;
use crate::domain::transaction::Transition;
use crate::error::{Result, SettlementError};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EXPIRATION_PREFIX: &str = "transaction:expire:";

/// Cache key whose expiry marks the end of a checkout's payment window.
pub fn expiration_key(transaction_id: Uuid) -> String {
    format!("{EXPIRATION_PREFIX}{transaction_id}")
}

pub fn parse_expiration_key(key: &str) -> Option<Uuid> {
    key.strip_prefix(EXPIRATION_PREFIX)
        .and_then(|id| Uuid::parse_str(id).ok())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancellationOutcome {
    Applied {
        transaction_id: Uuid,
        to: InternalStatus,
    },
    /// The transaction was no longer awaiting payment.
    Ignored {
        transaction_id: Uuid,
        status: InternalStatus,
    },
}

/// Expires and cancels transactions that are still waiting for payment.
pub struct CancellationService {
    transactions: TransactionRepositoryRef,
    events: EventPublisherRef,
}

impl CancellationService {
    pub fn new(transactions: TransactionRepositoryRef, events: EventPublisherRef) -> Self {
        Self {
            transactions,
            events,
        }
    }

    pub async fn expire(&self, transaction_id: Uuid) -> Result<CancellationOutcome> {
        self.close(transaction_id, None, InternalStatus::Expired).await
    }

    /// Buyer-initiated cancellation. Another buyer's transaction reads as missing.
    pub async fn cancel(&self, user_id: Uuid, transaction_id: Uuid) -> Result<CancellationOutcome> {
        self.close(transaction_id, Some(user_id), InternalStatus::CancelledByUser)
            .await
    }

    async fn close(
        &self,
        transaction_id: Uuid,
        owner: Option<Uuid>,
        to: InternalStatus,
    ) -> Result<CancellationOutcome> {
        let not_found = || SettlementError::NotFound(format!("transaction {transaction_id}"));
        let lock = self
            .transactions
            .lock(transaction_id)
            .await?
            .ok_or_else(not_found)?;

        if owner.is_some_and(|user_id| user_id != lock.transaction().user_id) {
            return Err(not_found());
        }
        let status = lock.transaction().internal_status();
        if !status.is_awaiting_payment() {
            debug!(transaction_id = %transaction_id, status = %status, "nothing to close");
            return Ok(CancellationOutcome::Ignored {
                transaction_id,
                status,
            });
        }

        let mut updated = lock.transaction().clone();
        updated.apply(&Transition::to(to).clearing_token(), Utc::now())?;
        self.transactions.commit(lock, updated.clone()).await?;
        info!(transaction_id = %transaction_id, to = %to, "transaction closed before payment");

        let event = TransactionEvent::canceled(&updated);
        if let Err(e) = self.events.publish(&event).await {
            warn!(transaction_id = %transaction_id, error = %e, "failed to publish release event");
        }
        Ok(CancellationOutcome::Applied { transaction_id, to })
    }
}

/// Expires transactions whose TTL marker ran out in the cache.
pub struct ExpirationListener {
    cancellation: Arc<CancellationService>,
}

impl ExpirationListener {
    pub fn new(cancellation: Arc<CancellationService>) -> Self {
        Self { cancellation }
    }

    /// Subscribes first so no expiry between wiring and running is missed.
    pub async fn subscribe(cache: &ExpiryCacheRef) -> Result<UnboundedReceiver<String>> {
        cache.subscribe_expired().await
    }

    pub async fn run(self, mut expired: UnboundedReceiver<String>, shutdown: CancellationToken) {
        info!("expiration listener starting");
        loop {
            let key = tokio::select! {
                _ = shutdown.cancelled() => break,
                key = expired.recv() => match key {
                    Some(key) => key,
                    None => break,
                },
            };
            let Some(transaction_id) = parse_expiration_key(&key) else {
                warn!(key = %key, "skipping malformed expiration key");
                continue;
            };
            match self.cancellation.expire(transaction_id).await {
                Ok(CancellationOutcome::Applied { .. }) => {}
                Ok(CancellationOutcome::Ignored { status, .. }) => {
                    debug!(transaction_id = %transaction_id, status = %status, "expiry after outcome ignored")
                }
                Err(e) => error!(transaction_id = %transaction_id, error = %e, "failed to expire transaction"),
            }
        }
        info!("expiration listener stopped");
    }
}
