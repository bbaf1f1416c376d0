//! Background continuation of pay-token issuance.
//!
//! A checkout whose first snapshot call failed is handed to [`RetryQueue`]. The
//! [`TokenRetryWorker`] retries it with exponential backoff, stops early when the
//! breaker opens, then parks on the recovery stream and makes one final attempt
//! once the gateway is reported healthy.

use crate::application::checkout::attach_token;
use crate::application::resilience::{BreakerState, CircuitBreaker, GuardedGateway};
use crate::domain::ports::{
    PaymentGatewayRef, RecoveryStreamRef, SnapshotRequest, TransactionRepositoryRef,
};
use crate::error::GatewayError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const HEALTH_CHECK_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_concurrent: usize,
    pub queue_capacity: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_concurrent: 32,
            queue_capacity: 1024,
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt` (zero-based): 2s, 4s, 8s, 16s, 32s.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryJob {
    pub transaction_id: Uuid,
    pub request: SnapshotRequest,
}

/// Sending half of the retry worker's queue.
#[derive(Clone)]
pub struct RetryQueue {
    sender: mpsc::Sender<RetryJob>,
}

impl RetryQueue {
    pub fn channel(policy: &RetryPolicy) -> (Self, mpsc::Receiver<RetryJob>) {
        let (sender, receiver) = mpsc::channel(policy.queue_capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Never blocks the checkout. A job that cannot be queued is left to the
    /// reconciliation scheduler and the TTL expiry.
    pub fn enqueue(&self, job: RetryJob) {
        let transaction_id = job.transaction_id;
        match self.sender.try_send(job) {
            Ok(()) => debug!(transaction_id = %transaction_id, "token retry queued"),
            Err(TrySendError::Full(_)) => {
                warn!(transaction_id = %transaction_id, "token retry queue is full, dropping job")
            }
            Err(TrySendError::Closed(_)) => {
                warn!(transaction_id = %transaction_id, "token retry worker is stopped, dropping job")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    TokenAttached,
    /// The transaction stopped waiting for payment.
    Skipped,
    Abandoned,
    Cancelled,
}

pub struct TokenRetryWorker {
    transactions: TransactionRepositoryRef,
    gateway: PaymentGatewayRef,
    breaker: Arc<CircuitBreaker>,
    recovery: RecoveryStreamRef,
    policy: RetryPolicy,
}

impl TokenRetryWorker {
    pub fn new(
        transactions: TransactionRepositoryRef,
        gateway: PaymentGatewayRef,
        breaker: Arc<CircuitBreaker>,
        recovery: RecoveryStreamRef,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transactions,
            gateway,
            breaker,
            recovery,
            policy,
        }
    }

    /// Consumes jobs until shutdown or until every queue sender is gone.
    pub async fn run(self: Arc<Self>, mut jobs: mpsc::Receiver<RetryJob>, shutdown: CancellationToken) {
        info!(
            max_concurrent = self.policy.max_concurrent,
            max_attempts = self.policy.max_attempts,
            "token retry worker starting"
        );
        let permits = Arc::new(Semaphore::new(self.policy.max_concurrent.max(1)));
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(finished) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = finished {
                        error!(error = %e, "token retry task panicked");
                    }
                }
                job = jobs.recv() => {
                    let Some(job) = job else { break };
                    let permit = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        permit = permits.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };
                    let worker = self.clone();
                    let shutdown = shutdown.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        worker.process(job, &shutdown).await
                    });
                }
            }
        }

        if !tasks.is_empty() {
            info!(count = tasks.len(), "waiting for token retries to finish");
        }
        while let Some(finished) = tasks.join_next().await {
            if let Err(e) = finished {
                error!(error = %e, "token retry task panicked");
            }
        }
        info!("token retry worker stopped");
    }

    pub async fn process(&self, job: RetryJob, shutdown: &CancellationToken) -> RetryOutcome {
        let transaction_id = job.transaction_id;

        let mut blocked = false;
        for attempt in 0..self.policy.max_attempts {
            tokio::select! {
                _ = shutdown.cancelled() => return RetryOutcome::Cancelled,
                _ = tokio::time::sleep(self.policy.delay(attempt)) => {}
            }
            if self.breaker.state() == BreakerState::Open {
                info!(transaction_id = %transaction_id, attempt, "breaker opened, waiting for recovery");
                blocked = true;
                break;
            }
            match self.gateway.create_snapshot(&job.request).await {
                Ok(snapshot) => return self.store_token(transaction_id, &snapshot.token).await,
                Err(e) if e.is_breaker_rejection() => {
                    info!(transaction_id = %transaction_id, attempt, error = %e, "breaker rejected retry");
                    blocked = true;
                    break;
                }
                Err(e) => {
                    warn!(transaction_id = %transaction_id, attempt, error = %e, "token retry failed")
                }
            }
        }

        let blocked = blocked || self.breaker.state() != BreakerState::Closed;
        // Subscribe before re-reading the breaker so a recovery in between is not missed.
        let mut recovery = self.recovery.subscribe();
        if !self.still_awaiting_payment(transaction_id).await {
            return RetryOutcome::Skipped;
        }

        let recovered_meanwhile = blocked && self.breaker.state() == BreakerState::Closed;
        if !recovered_meanwhile {
            tokio::select! {
                _ = shutdown.cancelled() => return RetryOutcome::Cancelled,
                recovered = recovery.recovered() => {
                    if let Err(e) = recovered {
                        error!(transaction_id = %transaction_id, error = %e, "recovery stream failed");
                        return RetryOutcome::Abandoned;
                    }
                }
            }
        }

        match self.gateway.create_snapshot(&job.request).await {
            Ok(snapshot) => self.store_token(transaction_id, &snapshot.token).await,
            Err(e) => {
                warn!(transaction_id = %transaction_id, error = %e, "final token attempt after recovery failed");
                RetryOutcome::Abandoned
            }
        }
    }

    async fn still_awaiting_payment(&self, transaction_id: Uuid) -> bool {
        match self.transactions.get(transaction_id).await {
            Ok(Some(transaction)) => transaction.internal_status().is_awaiting_payment(),
            Ok(None) => false,
            // Let the final write decide.
            Err(_) => true,
        }
    }

    async fn store_token(&self, transaction_id: Uuid, token: &str) -> RetryOutcome {
        match attach_token(self.transactions.as_ref(), transaction_id, token).await {
            Ok(Some(_)) => {
                info!(transaction_id = %transaction_id, "pay token attached after retry");
                RetryOutcome::TokenAttached
            }
            Ok(None) => RetryOutcome::Skipped,
            Err(e) => {
                error!(transaction_id = %transaction_id, error = %e, "failed to store retried pay token");
                RetryOutcome::Abandoned
            }
        }
    }
}

/// Publishes a recovery signal whenever the breaker returns to closed.
///
/// While the breaker is not closed the relay health-checks the gateway itself, so
/// parked retries recover even when no other traffic reaches the breaker.
pub async fn relay_recovery(
    gateway: Arc<GuardedGateway>,
    recovery: RecoveryStreamRef,
    shutdown: CancellationToken,
) {
    let breaker = gateway.breaker().clone();
    let mut states = breaker.subscribe();
    let mut previous = *states.borrow_and_update();
    loop {
        if previous == BreakerState::Closed {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        } else {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = check_until_closed(&gateway) => {}
            }
        }
        let current = *states.borrow_and_update();
        if current == BreakerState::Closed && previous != BreakerState::Closed {
            info!(breaker = breaker.name(), "payment gateway recovered");
            if let Err(e) = recovery.publish_recovered().await {
                warn!(error = %e, "failed to publish gateway recovery");
            }
        }
        previous = current;
    }
}

async fn check_until_closed(gateway: &GuardedGateway) {
    let breaker = gateway.breaker();
    loop {
        match breaker.state() {
            BreakerState::Closed => return,
            BreakerState::Open => {
                tokio::time::sleep(breaker.open_remaining().unwrap_or_default()).await;
            }
            BreakerState::HalfOpen => match gateway.health_check().await {
                Ok(()) => debug!(breaker = breaker.name(), "gateway health check succeeded"),
                // Other callers hold the half-open slots.
                Err(GatewayError::TooManyProbes) => tokio::time::sleep(HEALTH_CHECK_BACKOFF).await,
                Err(e) => debug!(breaker = breaker.name(), error = %e, "gateway health check failed"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::resilience::BreakerConfig;
    use crate::domain::money::Amount;
    use crate::domain::ports::{RecoveryStream, TransactionRepository};
    use crate::domain::status::InternalStatus;
    use crate::domain::transaction::Transaction;
    use crate::infrastructure::gateway::sandbox::SandboxGateway;
    use crate::infrastructure::in_memory::InMemoryStore;
    use crate::infrastructure::pubsub::InMemoryRecoveryStream;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    struct Fixture {
        worker: Arc<TokenRetryWorker>,
        store: InMemoryStore,
        sandbox: Arc<SandboxGateway>,
        breaker: Arc<CircuitBreaker>,
        recovery: Arc<InMemoryRecoveryStream>,
    }

    fn fixture() -> Fixture {
        let store = InMemoryStore::new();
        let sandbox = Arc::new(SandboxGateway::new("server-key"));
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
        let recovery = Arc::new(InMemoryRecoveryStream::new());
        let gateway = Arc::new(GuardedGateway::new(
            sandbox.clone(),
            breaker.clone(),
            Duration::from_secs(5),
        ));
        let worker = Arc::new(TokenRetryWorker::new(
            Arc::new(store.clone()),
            gateway,
            breaker.clone(),
            recovery.clone(),
            RetryPolicy::default(),
        ));
        Fixture {
            worker,
            store,
            sandbox,
            breaker,
            recovery,
        }
    }

    async fn pending_job(store: &InMemoryStore) -> RetryJob {
        let transaction = Transaction::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            vec![Uuid::new_v4()],
            Amount::new(dec!(25)).unwrap(),
            Utc::now(),
        );
        store.insert_transaction(transaction.clone()).await;
        RetryJob {
            transaction_id: transaction.id,
            request: SnapshotRequest {
                order_id: transaction.order_id(),
                gross_amount: Amount::new(dec!(25)).unwrap(),
                email: "buyer@example.com".to_string(),
            },
        }
    }

    async fn status_of(store: &InMemoryStore, id: Uuid) -> InternalStatus {
        TransactionRepository::get(store, id)
            .await
            .unwrap()
            .unwrap()
            .internal_status()
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        let delays: Vec<_> = (0..5).map(|attempt| policy.delay(attempt).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_attaches_token_after_transient_failures() {
        let fx = fixture();
        let job = pending_job(&fx.store).await;
        fx.sandbox.fail_next(2);

        let outcome = fx.worker.process(job.clone(), &CancellationToken::new()).await;

        assert_eq!(outcome, RetryOutcome::TokenAttached);
        assert_eq!(status_of(&fx.store, job.transaction_id).await, InternalStatus::TokenReady);
        assert_eq!(fx.sandbox.snapshot_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_wait_for_recovery_then_try_once() {
        let fx = fixture();
        let job = pending_job(&fx.store).await;
        fx.sandbox.fail_next(5);

        let worker = fx.worker.clone();
        let running = tokio::spawn({
            let job = job.clone();
            async move { worker.process(job, &CancellationToken::new()).await }
        });

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!running.is_finished());
        assert_eq!(fx.sandbox.snapshot_calls(), 5);

        fx.recovery.publish_recovered().await.unwrap();
        assert_eq!(running.await.unwrap(), RetryOutcome::TokenAttached);
        assert_eq!(fx.sandbox.snapshot_calls(), 6);
        assert_eq!(status_of(&fx.store, job.transaction_id).await, InternalStatus::TokenReady);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_stops_retries_early() {
        let fx = fixture();
        let job = pending_job(&fx.store).await;
        trip(&fx.breaker).await;

        let worker = fx.worker.clone();
        let shutdown = CancellationToken::new();
        let running = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { worker.process(job, &shutdown).await }
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fx.sandbox.snapshot_calls(), 0);

        shutdown.cancel();
        assert_eq!(running.await.unwrap(), RetryOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_transaction_is_skipped() {
        let fx = fixture();
        let job = pending_job(&fx.store).await;
        let lock = fx.store.lock(job.transaction_id).await.unwrap().unwrap();
        let mut cancelled = lock.transaction().clone();
        cancelled
            .transition(InternalStatus::CancelledByUser, Utc::now())
            .unwrap();
        fx.store.commit(lock, cancelled).await.unwrap();

        let outcome = fx.worker.process(job.clone(), &CancellationToken::new()).await;

        assert_eq!(outcome, RetryOutcome::Skipped);
        assert_eq!(
            status_of(&fx.store, job.transaction_id).await,
            InternalStatus::CancelledByUser
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drains_queue_until_shutdown() {
        let fx = fixture();
        let job = pending_job(&fx.store).await;
        let (queue, jobs) = RetryQueue::channel(&RetryPolicy::default());
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(fx.worker.clone().run(jobs, shutdown.clone()));

        queue.enqueue(job.clone());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(status_of(&fx.store, job.transaction_id).await, InternalStatus::TokenReady);

        shutdown.cancel();
        handle.await.unwrap();
    }

    async fn trip(breaker: &CircuitBreaker) {
        for _ in 0..5 {
            let _ = breaker
                .call(async { Err::<(), _>(GatewayError::Transport("down".into())) })
                .await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_checks_health_and_publishes_without_traffic() {
        let fx = fixture();
        let gateway = Arc::new(GuardedGateway::new(
            fx.sandbox.clone(),
            fx.breaker.clone(),
            Duration::from_secs(5),
        ));
        let shutdown = CancellationToken::new();
        let relay = tokio::spawn(relay_recovery(gateway, fx.recovery.clone(), shutdown.clone()));
        tokio::task::yield_now().await;

        let mut subscription = fx.recovery.subscribe();
        trip(&fx.breaker).await;
        fx.sandbox.fail_status_next(1);

        subscription.recovered().await.unwrap();
        assert_eq!(fx.breaker.state(), BreakerState::Closed);
        assert_eq!(fx.sandbox.snapshot_calls(), 0);

        shutdown.cancel();
        relay.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_parked_job_recovers_once_relay_closes_breaker() {
        let fx = fixture();
        let job = pending_job(&fx.store).await;
        let gateway = Arc::new(GuardedGateway::new(
            fx.sandbox.clone(),
            fx.breaker.clone(),
            Duration::from_secs(5),
        ));
        let shutdown = CancellationToken::new();
        let relay = tokio::spawn(relay_recovery(gateway, fx.recovery.clone(), shutdown.clone()));
        trip(&fx.breaker).await;

        let outcome = fx.worker.process(job.clone(), &shutdown).await;

        assert_eq!(outcome, RetryOutcome::TokenAttached);
        assert_eq!(fx.sandbox.snapshot_calls(), 1);
        assert_eq!(status_of(&fx.store, job.transaction_id).await, InternalStatus::TokenReady);
        shutdown.cancel();
        relay.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_while_closed_still_waits_for_recovery() {
        let fx = fixture();
        let job = pending_job(&fx.store).await;
        fx.sandbox.fail_next(2);
        let policy = RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        };
        let worker = Arc::new(TokenRetryWorker::new(
            Arc::new(fx.store.clone()),
            Arc::new(GuardedGateway::new(
                fx.sandbox.clone(),
                fx.breaker.clone(),
                Duration::from_secs(5),
            )),
            fx.breaker.clone(),
            fx.recovery.clone(),
            policy,
        ));

        let running = tokio::spawn({
            let job = job.clone();
            async move { worker.process(job, &CancellationToken::new()).await }
        });
        tokio::time::sleep(Duration::from_secs(60)).await;
        // Two failures stay below the trip threshold.
        assert_eq!(fx.breaker.state(), BreakerState::Closed);
        assert!(!running.is_finished());

        fx.recovery.publish_recovered().await.unwrap();
        assert_eq!(running.await.unwrap(), RetryOutcome::TokenAttached);
        assert_eq!(fx.sandbox.snapshot_calls(), 3);
    }
}
