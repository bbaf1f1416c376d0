//! Periodic safety net that polls the gateway for transactions still pending.

use crate::application::reconciliation::{ReconcileOutcome, ReconciliationHandler};
use crate::domain::ports::{PaymentGatewayRef, TransactionRepositoryRef};
use crate::domain::status::PaymentStatus;
use crate::error::{GatewayError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between cycles.
    pub interval: Duration,
    /// A cycle running longer than this is abandoned.
    pub budget: Duration,
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            budget: Duration::from_secs(4 * 60),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub polled: u64,
    pub applied: u64,
    pub ignored: u64,
    pub failed: u64,
}

pub struct ReconciliationScheduler {
    transactions: TransactionRepositoryRef,
    gateway: PaymentGatewayRef,
    handler: Arc<ReconciliationHandler>,
    config: SchedulerConfig,
}

impl ReconciliationScheduler {
    pub fn new(
        transactions: TransactionRepositoryRef,
        gateway: PaymentGatewayRef,
        handler: Arc<ReconciliationHandler>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            transactions,
            gateway,
            handler,
            config,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!("reconciliation scheduler disabled");
            return;
        }
        info!(
            interval_secs = self.config.interval.as_secs(),
            budget_secs = self.config.budget.as_secs(),
            "reconciliation scheduler starting"
        );

        let mut ticks = interval(self.config.interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticks.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticks.tick() => {}
            }
            let cycle = tokio::select! {
                _ = shutdown.cancelled() => break,
                cycle = timeout(self.config.budget, self.run_cycle()) => cycle,
            };
            match cycle {
                Ok(Ok(report)) => info!(
                    polled = report.polled,
                    applied = report.applied,
                    ignored = report.ignored,
                    failed = report.failed,
                    "reconciliation cycle finished"
                ),
                Ok(Err(e)) => error!(error = %e, "reconciliation cycle failed"),
                Err(_) => warn!(
                    budget_secs = self.config.budget.as_secs(),
                    "reconciliation cycle exceeded its budget, abandoned"
                ),
            }
        }
        info!("reconciliation scheduler stopped");
    }

    /// Polls every transaction whose buyer-facing status is still pending.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let pending = self.transactions.list_by_status(PaymentStatus::Pending).await?;
        let mut report = CycleReport::default();

        for transaction in pending {
            report.polled += 1;
            let status = match self.gateway.check_status(&transaction.order_id()).await {
                Ok(status) => status,
                Err(GatewayError::UnknownOrder(_)) => {
                    debug!(transaction_id = %transaction.id, "gateway has no payment for order yet");
                    report.ignored += 1;
                    continue;
                }
                Err(e) => {
                    warn!(transaction_id = %transaction.id, error = %e, "status poll failed");
                    report.failed += 1;
                    continue;
                }
            };

            match self.handler.handle(status.notification, status.raw).await {
                Ok(ReconcileOutcome::Applied { .. }) => report.applied += 1,
                Ok(ReconcileOutcome::Ignored { .. }) => report.ignored += 1,
                Err(e) => {
                    warn!(transaction_id = %transaction.id, error = %e, "reconciling polled status failed");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}
