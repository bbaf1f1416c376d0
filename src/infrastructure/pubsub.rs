//! In-process cache, recovery stream and broker built on tokio channels and timers.

use crate::domain::events::TransactionEvent;
use crate::domain::ports::{EventPublisher, ExpiryCache, RecoveryStream, RecoverySubscription};
use crate::error::{Result, SettlementError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

#[derive(Default)]
struct CacheState {
    /// Key -> generation of its latest TTL; a rewrite supersedes earlier timers.
    keys: HashMap<String, u64>,
    next_generation: u64,
    subscribers: Vec<UnboundedSender<String>>,
}

/// TTL markers with key-expiration notifications.
#[derive(Default, Clone)]
pub struct InMemoryCache {
    state: Arc<Mutex<CacheState>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().keys.contains_key(key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expire(&self, key: String, generation: u64) {
        let mut state = self.lock();
        if state.keys.get(&key) != Some(&generation) {
            return;
        }
        state.keys.remove(&key);
        state
            .subscribers
            .retain(|subscriber| subscriber.send(key.clone()).is_ok());
        debug!(key = %key, "cache key expired");
    }
}

#[async_trait]
impl ExpiryCache for InMemoryCache {
    async fn set_with_ttl(&self, key: &str, ttl: Duration) -> Result<()> {
        let generation = {
            let mut state = self.lock();
            state.next_generation += 1;
            let generation = state.next_generation;
            state.keys.insert(key.to_string(), generation);
            generation
        };
        let cache = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            cache.expire(key, generation);
        });
        Ok(())
    }

    async fn subscribe_expired(&self) -> Result<UnboundedReceiver<String>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.lock().subscribers.push(sender);
        Ok(receiver)
    }
}

/// Broadcast stream of "gateway recovered" signals.
#[derive(Clone)]
pub struct InMemoryRecoveryStream {
    sender: broadcast::Sender<()>,
}

impl InMemoryRecoveryStream {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self { sender }
    }
}

impl Default for InMemoryRecoveryStream {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecoveryStream for InMemoryRecoveryStream {
    async fn publish_recovered(&self) -> Result<()> {
        // No receiver just means nobody is waiting.
        let _ = self.sender.send(());
        Ok(())
    }

    fn subscribe(&self) -> Box<dyn RecoverySubscription> {
        Box::new(BroadcastSubscription {
            receiver: self.sender.subscribe(),
        })
    }
}

struct BroadcastSubscription {
    receiver: broadcast::Receiver<()>,
}

#[async_trait]
impl RecoverySubscription for BroadcastSubscription {
    async fn recovered(&mut self) -> Result<()> {
        match self.receiver.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => Ok(()),
            Err(broadcast::error::RecvError::Closed) => {
                Err(SettlementError::internal("recovery stream closed"))
            }
        }
    }
}

/// Records published events; can be switched off to simulate an outage.
#[derive(Default)]
pub struct InMemoryBroker {
    events: Mutex<Vec<TransactionEvent>>,
    unavailable: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<TransactionEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl EventPublisher for InMemoryBroker {
    async fn publish(&self, event: &TransactionEvent) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SettlementError::internal("broker unavailable"));
        }
        info!(topic = event.topic(), transaction_id = %event.transaction_id(), "event published");
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}
