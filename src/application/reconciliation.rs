//! The transaction state machine.
//!
//! Webhook deliveries and scheduler polls both end up in
//! [`ReconciliationHandler::handle`], so a given gateway report always produces
//! the same outcome whichever path delivered it first.

use crate::application::distribution::WalletDistributor;
use crate::domain::events::TransactionEvent;
use crate::domain::notification::PaymentNotification;
use crate::domain::ports::{
    EventPublisherRef, LockedTransaction, PaymentGatewayRef, TransactionRepositoryRef,
};
use crate::domain::status::{GatewayStatus, InternalStatus, PaymentStatus};
use crate::domain::transaction::{Transaction, Transition};
use crate::error::{Result, SettlementError};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// How long after expiry a settlement still counts as a valid payment.
    pub grace_period: Duration,
    /// UTC offset of the gateway's local timestamps.
    pub gateway_offset: FixedOffset,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5 * 60),
            gateway_offset: FixedOffset::east_opt(7 * 3600).unwrap_or_else(|| Utc.fix()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Duplicate or stale delivery for a transaction that already has an outcome.
    AlreadyFinal(InternalStatus),
    UnknownGatewayStatus(String),
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyFinal(status) => write!(f, "transaction is already {status}"),
            Self::UnknownGatewayStatus(status) => write!(f, "unknown gateway status '{status}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Apply(Transition),
    Ignore(IgnoreReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied {
        transaction_id: Uuid,
        from: InternalStatus,
        to: InternalStatus,
    },
    Ignored {
        transaction_id: Uuid,
        reason: IgnoreReason,
    },
}

impl ReconcileOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Decides what a gateway report does to a transaction in `current`.
///
/// `settled_at` is the gateway's settlement time, `expired_at` the moment the
/// transaction was marked expired (its last update).
pub fn plan_transition(
    current: InternalStatus,
    reported: &GatewayStatus,
    settled_at: DateTime<Utc>,
    expired_at: DateTime<Utc>,
    grace_period: Duration,
    now: DateTime<Utc>,
) -> Decision {
    if current.is_terminal() {
        return Decision::Ignore(IgnoreReason::AlreadyFinal(current));
    }
    if let GatewayStatus::Other(status) = reported {
        return Decision::Ignore(IgnoreReason::UnknownGatewayStatus(status.clone()));
    }

    if current == InternalStatus::Expired {
        let transition = if !reported.is_settled() {
            Transition::to(InternalStatus::ExpiredCheckedInvalid)
        } else if within_grace(settled_at, expired_at, grace_period) {
            Transition::to(InternalStatus::ExpiredCheckedValid)
                .paid_at(now)
                .settled_at(settled_at)
        } else {
            Transition::to(InternalStatus::LateSettlement).settled_at(settled_at)
        };
        return Decision::Apply(transition);
    }

    let transition = match reported {
        GatewayStatus::Capture | GatewayStatus::Settlement => Transition::to(InternalStatus::Settled)
            .paid_at(now)
            .settled_at(settled_at)
            .clearing_token(),
        GatewayStatus::Pending => Transition::to(InternalStatus::Pending),
        GatewayStatus::Expire => Transition::to(InternalStatus::ExpiredCheckedInvalid).clearing_token(),
        GatewayStatus::Failure | GatewayStatus::Deny => {
            Transition::to(InternalStatus::Failed).clearing_token()
        }
        GatewayStatus::Cancel => Transition::to(InternalStatus::CancelledBySystem).clearing_token(),
        GatewayStatus::Other(status) => {
            return Decision::Ignore(IgnoreReason::UnknownGatewayStatus(status.clone()));
        }
    };
    Decision::Apply(transition)
}

fn within_grace(settled_at: DateTime<Utc>, expired_at: DateTime<Utc>, grace_period: Duration) -> bool {
    match chrono::Duration::from_std(grace_period) {
        Ok(grace) => settled_at <= expired_at + grace,
        Err(_) => true,
    }
}

pub struct ReconciliationHandler {
    transactions: TransactionRepositoryRef,
    gateway: PaymentGatewayRef,
    finisher: CommitFinisher,
    config: ReconcileConfig,
}

impl ReconciliationHandler {
    pub fn new(
        transactions: TransactionRepositoryRef,
        gateway: PaymentGatewayRef,
        events: EventPublisherRef,
        distributor: WalletDistributor,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            finisher: CommitFinisher {
                transactions: transactions.clone(),
                events,
                distributor,
            },
            transactions,
            gateway,
            config,
        }
    }

    /// Entry point for raw webhook bodies.
    pub async fn handle_payload(&self, payload: Value) -> Result<ReconcileOutcome> {
        let notification: PaymentNotification = serde_json::from_value(payload.clone())
            .map_err(|e| SettlementError::Validation(format!("malformed notification: {e}")))?;
        self.handle(notification, payload).await
    }

    pub async fn handle(&self, notification: PaymentNotification, raw: Value) -> Result<ReconcileOutcome> {
        if !notification.verify(self.gateway.server_key()) {
            warn!(order_id = %notification.order_id, "rejected notification with invalid signature");
            return Err(SettlementError::Forbidden("invalid signature".to_string()));
        }
        let transaction_id = notification
            .transaction_uuid()
            .ok_or_else(|| SettlementError::NotFound(format!("transaction {}", notification.order_id)))?;

        let lock = self
            .transactions
            .lock(transaction_id)
            .await?
            .ok_or_else(|| SettlementError::NotFound(format!("transaction {transaction_id}")))?;

        let current = lock.transaction();
        let from = current.internal_status();
        let now = Utc::now();
        let settled_at = notification
            .settled_at(self.config.gateway_offset)
            .unwrap_or(now);
        let reported = notification.gateway_status();

        let transition = match plan_transition(
            from,
            &reported,
            settled_at,
            current.updated_at,
            self.config.grace_period,
            now,
        ) {
            Decision::Apply(transition) => transition,
            Decision::Ignore(reason) => {
                info!(transaction_id = %transaction_id, gateway_status = %reported, %reason, "notification ignored");
                return Ok(ReconcileOutcome::Ignored {
                    transaction_id,
                    reason,
                });
            }
        };

        let mut updated = current.clone();
        updated.apply(&transition, now)?;
        updated.record_callback(reported.as_str(), raw);

        // Once the commit starts, it and its wallet credits run to completion even
        // if the caller stops waiting.
        let finisher = self.finisher.clone();
        let reported = reported.to_string();
        let to = tokio::spawn(async move { finisher.finish(lock, updated, from, reported).await })
            .await
            .map_err(|e| SettlementError::internal(format!("reconciliation commit task failed: {e}")))??;

        Ok(ReconcileOutcome::Applied {
            transaction_id,
            from,
            to,
        })
    }
}

/// Commits a planned transition and runs its follow-up effects.
#[derive(Clone)]
struct CommitFinisher {
    transactions: TransactionRepositoryRef,
    events: EventPublisherRef,
    distributor: WalletDistributor,
}

impl CommitFinisher {
    async fn finish(
        &self,
        lock: LockedTransaction,
        updated: Transaction,
        from: InternalStatus,
        reported: String,
    ) -> Result<InternalStatus> {
        self.transactions.commit(lock, updated.clone()).await?;
        info!(
            transaction_id = %updated.id,
            gateway_status = %reported,
            from = %from,
            to = %updated.internal_status(),
            "transaction reconciled"
        );
        self.after_commit(&updated).await?;
        Ok(updated.internal_status())
    }

    async fn after_commit(&self, transaction: &Transaction) -> Result<()> {
        match transaction.status() {
            PaymentStatus::Success => {
                self.publish(TransactionEvent::settled(transaction)).await;
                if let Err(e) = self.distributor.distribute(transaction).await {
                    error!(transaction_id = %transaction.id, error = %e, "wallet distribution failed");
                    return Err(SettlementError::Internal(Box::new(e)));
                }
            }
            PaymentStatus::Failed | PaymentStatus::Cancelled | PaymentStatus::Expired => {
                self.publish(TransactionEvent::canceled(transaction)).await;
            }
            PaymentStatus::Pending | PaymentStatus::Refunded => {}
        }
        Ok(())
    }

    async fn publish(&self, event: TransactionEvent) {
        if let Err(e) = self.events.publish(&event).await {
            warn!(transaction_id = %event.transaction_id(), topic = event.topic(), error = %e, "failed to publish event");
        }
    }
}
