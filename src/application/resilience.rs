//! Circuit breaker guarding the payment gateway.
//!
//! Counting follows a rolling window: while closed, counts reset every
//! `interval`; the breaker trips once at least `min_requests` calls were seen in
//! the window and the failure ratio reaches `failure_ratio`. After `open_timeout`
//! it lets through up to `half_open_max` probes and closes once that many of
//! them succeed in a row. Any probe failure re-opens it.

use crate::domain::ports::{PaymentGateway, PaymentGatewayRef, Snapshot, SnapshotRequest, StatusReport};
use crate::error::GatewayError;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, timeout};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "CLOSED"),
            BreakerState::Open => write!(f, "OPEN"),
            BreakerState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub name: String,
    /// Length of the rolling counting window while closed.
    pub interval: Duration,
    pub min_requests: u32,
    pub failure_ratio: f64,
    /// How long the breaker stays open before probing.
    pub open_timeout: Duration,
    pub half_open_max: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            name: "payment-gateway".to_string(),
            interval: Duration::from_secs(60),
            min_requests: 5,
            failure_ratio: 0.6,
            open_timeout: Duration::from_secs(10),
            half_open_max: 3,
        }
    }
}

/// Call counters for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub successes: u32,
    pub failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests += 1;
    }

    fn on_success(&mut self) {
        self.successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }
}

struct Inner {
    state: BreakerState,
    generation: u64,
    counts: Counts,
    /// End of the counting window (closed) or of the open period (open).
    expiry: Option<Instant>,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let (state_tx, _) = watch::channel(BreakerState::Closed);
        let expiry = Some(Instant::now() + config.interval);
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
            }),
            state_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock();
        self.current_state(&mut inner, Instant::now());
        inner.state
    }

    pub fn counts(&self) -> Counts {
        self.lock().counts
    }

    /// Observes state changes. The receiver starts at the current state.
    pub fn subscribe(&self) -> watch::Receiver<BreakerState> {
        self.state_tx.subscribe()
    }

    /// Runs `operation` if the breaker admits it and records its outcome.
    ///
    /// A call dropped before `operation` finishes counts as a failure, so an
    /// abandoned half-open call still frees its slot.
    pub async fn call<T, F>(&self, operation: F) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        let pending = PendingCall {
            breaker: self,
            generation: Some(self.before_call()?),
        };
        let result = operation.await;
        pending.finish(result.is_ok());
        result
    }

    /// Time left before an open breaker starts probing.
    pub fn open_remaining(&self) -> Option<Duration> {
        let mut inner = self.lock();
        let now = Instant::now();
        self.current_state(&mut inner, now);
        match inner.state {
            BreakerState::Open => inner.expiry.map(|expiry| expiry.saturating_duration_since(now)),
            _ => None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn before_call(&self) -> Result<u64, GatewayError> {
        let mut inner = self.lock();
        let generation = self.current_state(&mut inner, Instant::now());
        match inner.state {
            BreakerState::Open => return Err(GatewayError::CircuitOpen),
            BreakerState::HalfOpen if inner.counts.requests >= self.config.half_open_max => {
                return Err(GatewayError::TooManyProbes);
            }
            _ => {}
        }
        inner.counts.on_request();
        Ok(generation)
    }

    fn after_call(&self, before: u64, success: bool) {
        let mut inner = self.lock();
        let now = Instant::now();
        let generation = self.current_state(&mut inner, now);
        // The outcome belongs to a window that has already been reset.
        if generation != before {
            return;
        }
        if success {
            inner.counts.on_success();
            if inner.state == BreakerState::HalfOpen
                && inner.counts.consecutive_successes >= self.config.half_open_max
            {
                self.set_state(&mut inner, BreakerState::Closed, now);
            }
        } else {
            inner.counts.on_failure();
            match inner.state {
                BreakerState::Closed if self.ready_to_trip(&inner.counts) => {
                    self.set_state(&mut inner, BreakerState::Open, now);
                }
                BreakerState::HalfOpen => self.set_state(&mut inner, BreakerState::Open, now),
                _ => {}
            }
        }
    }

    fn ready_to_trip(&self, counts: &Counts) -> bool {
        counts.requests >= self.config.min_requests
            && f64::from(counts.failures) / f64::from(counts.requests) >= self.config.failure_ratio
    }

    fn current_state(&self, inner: &mut Inner, now: Instant) -> u64 {
        match inner.state {
            BreakerState::Closed => {
                if inner.expiry.is_some_and(|expiry| expiry <= now) {
                    self.new_generation(inner, now);
                }
            }
            BreakerState::Open => {
                if inner.expiry.is_some_and(|expiry| expiry <= now) {
                    self.set_state(inner, BreakerState::HalfOpen, now);
                }
            }
            BreakerState::HalfOpen => {}
        }
        inner.generation
    }

    fn set_state(&self, inner: &mut Inner, state: BreakerState, now: Instant) {
        if inner.state == state {
            return;
        }
        let previous = inner.state;
        inner.state = state;
        self.new_generation(inner, now);
        match state {
            BreakerState::Open => {
                warn!(breaker = %self.config.name, from = %previous, "circuit breaker opened")
            }
            _ => info!(breaker = %self.config.name, from = %previous, to = %state, "circuit breaker state changed"),
        }
        self.state_tx.send_replace(state);
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            BreakerState::Closed => Some(now + self.config.interval),
            BreakerState::Open => Some(now + self.config.open_timeout),
            BreakerState::HalfOpen => None,
        };
    }
}

/// Outcome recorder for an admitted call.
struct PendingCall<'a> {
    breaker: &'a CircuitBreaker,
    generation: Option<u64>,
}

impl PendingCall<'_> {
    fn finish(mut self, success: bool) {
        if let Some(generation) = self.generation.take() {
            self.breaker.after_call(generation, success);
        }
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if let Some(generation) = self.generation.take() {
            warn!(breaker = %self.breaker.config.name, "gateway call abandoned before completion");
            self.breaker.after_call(generation, false);
        }
    }
}

const HEALTH_CHECK_ORDER: &str = "health-check";

/// Payment gateway decorated with a per-call timeout and the shared breaker.
///
/// Snapshot creation goes through the breaker. Status polls only get the
/// timeout: an order the gateway does not know is an answer, not an outage.
pub struct GuardedGateway {
    inner: PaymentGatewayRef,
    breaker: Arc<CircuitBreaker>,
    call_timeout: Duration,
}

impl GuardedGateway {
    pub fn new(inner: PaymentGatewayRef, breaker: Arc<CircuitBreaker>, call_timeout: Duration) -> Self {
        Self {
            inner,
            breaker,
            call_timeout,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Health check counted by the breaker. Any answer from the status
    /// endpoint, including "unknown order", means the gateway is reachable.
    pub async fn health_check(&self) -> Result<(), GatewayError> {
        let limit = self.call_timeout;
        self.breaker
            .call(async {
                match timeout(limit, self.inner.check_status(HEALTH_CHECK_ORDER)).await {
                    Err(_) => Err(GatewayError::Timeout(limit)),
                    Ok(Ok(_)) | Ok(Err(GatewayError::UnknownOrder(_))) => Ok(()),
                    Ok(Err(e)) => Err(e),
                }
            })
            .await
    }
}

#[async_trait]
impl PaymentGateway for GuardedGateway {
    async fn create_snapshot(&self, request: &SnapshotRequest) -> Result<Snapshot, GatewayError> {
        let limit = self.call_timeout;
        self.breaker
            .call(async {
                timeout(limit, self.inner.create_snapshot(request))
                    .await
                    .map_err(|_| GatewayError::Timeout(limit))?
            })
            .await
    }

    async fn check_status(&self, order_id: &str) -> Result<StatusReport, GatewayError> {
        let limit = self.call_timeout;
        timeout(limit, self.inner.check_status(order_id))
            .await
            .map_err(|_| GatewayError::Timeout(limit))?
    }

    fn server_key(&self) -> &str {
        self.inner.server_key()
    }
}
