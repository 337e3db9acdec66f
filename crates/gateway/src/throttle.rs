//! Bounded outbound concurrency, keyed per model and per tool.
//!
//! Every key owns one tokio `Semaphore` for its whole lifetime, which hands
//! out permits in the order they were requested. Unlimited keys use the same
//! semaphore with a capacity no caller can exhaust, so switching between
//! limited and unlimited keeps the waiter queue intact.
//!
//! Limits are looked up on every acquisition and on every config update. A
//! raise adds permits to the semaphore. A lower takes back the free permits;
//! whatever is still held is recorded as debt and swallowed by the next
//! releases instead of being returned to the semaphore.

use crate::config::ThrottleConfig;
use crate::error::GatewayError;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

/// Capacity standing in for "unlimited"
const UNLIMITED: usize = Semaphore::MAX_PERMITS / 2;

/// Resource identity an outbound call is throttled under
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ThrottleKey {
    Model(String),
    Tool(String),
}

impl fmt::Display for ThrottleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottleKey::Model(id) => write!(f, "model:{id}"),
            ThrottleKey::Tool(id) => write!(f, "tool:{id}"),
        }
    }
}

fn capacity(limit: usize) -> usize {
    if limit == 0 {
        UNLIMITED
    } else {
        limit
    }
}

#[derive(Debug)]
struct Ledger {
    /// 0 means unlimited
    limit: usize,
    /// Held permits that must not go back to the semaphore on release
    debt: usize,
}

struct Slot {
    semaphore: Arc<Semaphore>,
    ledger: Mutex<Ledger>,
    in_flight: AtomicUsize,
}

impl Slot {
    fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity(limit))),
            ledger: Mutex::new(Ledger { limit, debt: 0 }),
            in_flight: AtomicUsize::new(0),
        }
    }

    fn resize(&self, key: &ThrottleKey, limit: usize) {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        if ledger.limit == limit {
            return;
        }
        debug!(
            "Concurrency limit for {} changed from {} to {}",
            key, ledger.limit, limit
        );

        let old = capacity(ledger.limit);
        let new = capacity(limit);
        if new > old {
            let repaid = ledger.debt.min(new - old);
            ledger.debt -= repaid;
            self.semaphore.add_permits(new - old - repaid);
        } else {
            let cut = old - new;
            let forgotten = self.semaphore.forget_permits(cut);
            ledger.debt += cut - forgotten;
        }
        ledger.limit = limit;
    }

    fn give_back(&self, permit: OwnedSemaphorePermit) {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if ledger.debt > 0 {
            ledger.debt -= 1;
            permit.forget();
        } else {
            drop(permit);
        }
    }
}

pub struct RequestThrottler {
    config: RwLock<ThrottleConfig>,
    slots: Mutex<HashMap<ThrottleKey, Arc<Slot>>>,
}

impl RequestThrottler {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config: RwLock::new(config),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the limits. Known keys are resized right away, which also
    /// wakes waiters when a limit was raised.
    pub fn update_config(&self, config: ThrottleConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;

        let slots: Vec<(ThrottleKey, Arc<Slot>)> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect();
        for (key, slot) in slots {
            slot.resize(&key, self.limit_for(&key));
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .acquire_timeout()
    }

    /// Effective limit for a key, 0 meaning unlimited
    pub fn limit_for(&self, key: &ThrottleKey) -> usize {
        let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
        let configured = match key {
            ThrottleKey::Model(id) => config.models.get(id),
            ThrottleKey::Tool(id) => config.tools.get(id),
        }
        .copied()
        .or(config.default_concurrency);

        match configured {
            Some(limit) if limit > 0 => usize::try_from(limit).unwrap_or(UNLIMITED).min(UNLIMITED),
            _ => 0,
        }
    }

    /// Number of permits currently held under a key
    pub fn in_flight(&self, key: &ThrottleKey) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|slot| slot.in_flight.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Wait for a free slot under `key`.
    ///
    /// Waiters on a saturated key are served first come, first served. Dropping
    /// the returned future abandons the wait without taking a slot.
    pub async fn acquire(
        &self,
        key: &ThrottleKey,
        timeout: Duration,
    ) -> Result<ThrottlePermit, GatewayError> {
        let limit = self.limit_for(key);
        let slot = self.slot(key, limit);

        trace!(
            "Acquiring {} ({} in flight, limit {})",
            key,
            slot.in_flight.load(Ordering::SeqCst),
            limit
        );
        let permit = match tokio::time::timeout(timeout, slot.semaphore.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            // Semaphores are never closed, a closed one is treated like a timeout
            Ok(Err(_)) | Err(_) => {
                debug!("Timed out after {:?} waiting for {}", timeout, key);
                return Err(GatewayError::ThrottleTimeout {
                    key: key.clone(),
                    timeout,
                });
            }
        };

        slot.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(ThrottlePermit {
            key: key.clone(),
            slot,
            permit: Some(permit),
        })
    }

    fn slot(&self, key: &ThrottleKey, limit: usize) -> Arc<Slot> {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Slot::new(limit)))
            .clone();
        slot.resize(key, limit);
        slot
    }
}

/// A granted slot. Released explicitly or when dropped, whichever comes first.
pub struct ThrottlePermit {
    key: ThrottleKey,
    slot: Arc<Slot>,
    permit: Option<OwnedSemaphorePermit>,
}

impl ThrottlePermit {
    pub fn key(&self) -> &ThrottleKey {
        &self.key
    }

    /// Give the slot back. Calling this more than once has no effect.
    pub fn release(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.slot.give_back(permit);
            trace!("Released {}", self.key);
        }
    }
}

impl Drop for ThrottlePermit {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ThrottlePermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottlePermit")
            .field("key", &self.key)
            .field("released", &self.permit.is_none())
            .finish()
    }
}
