use crate::application::cancellation::{CancellationService, ExpirationListener};
use crate::application::checkout::CheckoutService;
use crate::application::distribution::WalletDistributor;
use crate::application::reconciliation::{ReconcileConfig, ReconciliationHandler};
use crate::application::resilience::{BreakerConfig, CircuitBreaker, GuardedGateway};
use crate::application::retry::{RetryPolicy, RetryQueue, TokenRetryWorker, relay_recovery};
use crate::application::scheduler::{ReconciliationScheduler, SchedulerConfig};
use crate::domain::ports::{
    EventPublisherRef, ExpiryCacheRef, PaymentGatewayRef, PhotoServiceRef, RecoveryStreamRef,
    TransactionRepositoryRef, WalletRepositoryRef,
};
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// How long a checkout waits for payment before it expires.
    pub transaction_ttl: Duration,
    pub gateway_timeout: Duration,
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
    pub scheduler: SchedulerConfig,
    pub reconcile: ReconcileConfig,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            transaction_ttl: Duration::from_secs(30 * 60),
            gateway_timeout: Duration::from_secs(5),
            breaker: BreakerConfig::default(),
            retry: RetryPolicy::default(),
            scheduler: SchedulerConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

/// The outside world, as seen by the engine.
#[derive(Clone)]
pub struct Adapters {
    pub transactions: TransactionRepositoryRef,
    pub wallets: WalletRepositoryRef,
    /// The raw gateway; the engine wraps it in the breaker.
    pub gateway: PaymentGatewayRef,
    pub photos: PhotoServiceRef,
    pub cache: ExpiryCacheRef,
    pub recovery: RecoveryStreamRef,
    pub events: EventPublisherRef,
}

/// Wires the services and owns the background workers.
///
/// Workers run until [`SettlementEngine::shutdown`], which cancels them and
/// waits for them to stop.
pub struct SettlementEngine {
    checkout: Arc<CheckoutService>,
    reconciliation: Arc<ReconciliationHandler>,
    cancellation: Arc<CancellationService>,
    scheduler: Arc<ReconciliationScheduler>,
    breaker: Arc<CircuitBreaker>,
    shutdown: CancellationToken,
    workers: JoinSet<()>,
}

impl SettlementEngine {
    pub async fn start(adapters: Adapters, config: SettlementConfig) -> Result<Self> {
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        let guarded = Arc::new(GuardedGateway::new(
            adapters.gateway.clone(),
            breaker.clone(),
            config.gateway_timeout,
        ));
        let gateway: PaymentGatewayRef = guarded.clone();

        let (retries, jobs) = RetryQueue::channel(&config.retry);
        let checkout = Arc::new(CheckoutService::new(
            adapters.transactions.clone(),
            adapters.photos.clone(),
            gateway.clone(),
            adapters.cache.clone(),
            retries,
            config.transaction_ttl,
        ));
        let reconciliation = Arc::new(ReconciliationHandler::new(
            adapters.transactions.clone(),
            gateway.clone(),
            adapters.events.clone(),
            WalletDistributor::new(adapters.transactions.clone(), adapters.wallets.clone()),
            config.reconcile.clone(),
        ));
        let cancellation = Arc::new(CancellationService::new(
            adapters.transactions.clone(),
            adapters.events.clone(),
        ));
        let scheduler = Arc::new(ReconciliationScheduler::new(
            adapters.transactions.clone(),
            gateway.clone(),
            reconciliation.clone(),
            config.scheduler.clone(),
        ));
        let retry_worker = Arc::new(TokenRetryWorker::new(
            adapters.transactions.clone(),
            gateway,
            breaker.clone(),
            adapters.recovery.clone(),
            config.retry.clone(),
        ));
        let expired = ExpirationListener::subscribe(&adapters.cache).await?;

        let shutdown = CancellationToken::new();
        let mut workers = JoinSet::new();
        workers.spawn(retry_worker.run(jobs, shutdown.clone()));
        workers.spawn(relay_recovery(
            guarded,
            adapters.recovery.clone(),
            shutdown.clone(),
        ));
        workers.spawn(ExpirationListener::new(cancellation.clone()).run(expired, shutdown.clone()));
        workers.spawn({
            let scheduler = scheduler.clone();
            let shutdown = shutdown.clone();
            async move { scheduler.run(shutdown).await }
        });
        info!(workers = workers.len(), "settlement engine started");

        Ok(Self {
            checkout,
            reconciliation,
            cancellation,
            scheduler,
            breaker,
            shutdown,
            workers,
        })
    }

    pub fn checkout(&self) -> &CheckoutService {
        &self.checkout
    }

    pub fn reconciliation(&self) -> &ReconciliationHandler {
        &self.reconciliation
    }

    pub fn cancellation(&self) -> &CancellationService {
        &self.cancellation
    }

    pub fn scheduler(&self) -> &ReconciliationScheduler {
        &self.scheduler
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        while let Some(finished) = self.workers.join_next().await {
            if let Err(e) = finished {
                error!(error = %e, "background worker panicked");
            }
        }
        info!("settlement engine stopped");
    }
}
