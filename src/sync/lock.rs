//! Per-user distributed lock built on the store's lock primitives.
//!
//! A claim carries a random token and a TTL. Acquisition polls the store
//! with a jittered delay until the acquire timeout. A guard that outlives its
//! TTL may have run without exclusivity; [`LockGuard::release`] reports that
//! as [`ChatError::LockLost`] so the caller can surface it.

use crate::config::ServiceConfig;
use crate::error::ChatError;
use crate::state::Store;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn Store>,
    ttl: Duration,
    acquire_timeout: Duration,
    retry_delay: Duration,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn Store>, config: &ServiceConfig) -> Self {
        Self {
            store,
            ttl: config.lock_ttl(),
            acquire_timeout: config.lock_acquire_timeout(),
            retry_delay: config.lock_retry_delay(),
        }
    }

    /// Acquire `resource`, waiting at most the configured acquire timeout.
    pub async fn acquire(&self, resource: &str) -> Result<LockGuard, ChatError> {
        let token = Uuid::new_v4().to_string();
        let started = Instant::now();
        let deadline = started + self.acquire_timeout;

        loop {
            if self.store.lock_acquire(resource, &token, self.ttl).await? {
                crate::metrics::record_lock_wait(started.elapsed().as_secs_f64());
                debug!(resource = %resource, "Lock acquired");
                return Ok(LockGuard {
                    store: self.store.clone(),
                    resource: resource.to_string(),
                    token,
                    acquired_at: Instant::now(),
                    ttl: self.ttl,
                    released: false,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                crate::metrics::record_lock_timeout();
                warn!(resource = %resource, "Lock acquisition timed out");
                return Err(ChatError::LockTimeout(resource.to_string()));
            }
            let wait = self.next_delay().min(deadline - now);
            tokio::time::sleep(wait).await;
        }
    }

    /// Base delay plus up to 100% jitter so contenders spread out.
    fn next_delay(&self) -> Duration {
        let base = self.retry_delay.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=base);
        Duration::from_millis(base + jitter)
    }
}

/// A held lock. Release explicitly to learn whether exclusivity held.
pub struct LockGuard {
    store: Arc<dyn Store>,
    resource: String,
    token: String,
    acquired_at: Instant,
    ttl: Duration,
    released: bool,
}

impl LockGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Whether the TTL elapsed since acquisition.
    pub fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.ttl
    }

    /// Release the claim. `LockLost` when the TTL elapsed or the claim was
    /// taken over while held.
    pub async fn release(mut self) -> Result<(), ChatError> {
        self.released = true;
        let expired = self.is_expired();
        let held = self.store.lock_release(&self.resource, &self.token).await?;
        if held && !expired {
            debug!(resource = %self.resource, "Lock released");
            return Ok(());
        }
        crate::metrics::record_lock_lost();
        error!(
            resource = %self.resource,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            ttl_ms = self.ttl.as_millis() as u64,
            "Lock lost before release"
        );
        Err(ChatError::LockLost(self.resource.clone()))
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Future cancelled while holding the lock.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let resource = std::mem::take(&mut self.resource);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(e) = store.lock_release(&resource, &token).await {
                warn!(resource = %resource, error = %e, "Failed to release dropped lock");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;

    fn lock_with(ttl_ms: u64, acquire_timeout_ms: u64) -> (Arc<dyn Store>, DistributedLock) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let config = ServiceConfig {
            lock_ttl_ms: ttl_ms,
            lock_acquire_timeout_ms: acquire_timeout_ms,
            lock_retry_delay_ms: 5,
            ..ServiceConfig::default()
        };
        let lock = DistributedLock::new(store.clone(), &config);
        (store, lock)
    }

    #[tokio::test]
    async fn contended_lock_times_out() {
        let (_, lock) = lock_with(5_000, 50);
        let guard = lock.acquire("alice").await.unwrap();
        assert_eq!(
            lock.acquire("alice").await.err(),
            Some(ChatError::LockTimeout("alice".into()))
        );
        // other resources are independent
        lock.acquire("bob").await.unwrap().release().await.unwrap();
        guard.release().await.unwrap();
        lock.acquire("alice").await.unwrap().release().await.unwrap();
    }

    #[tokio::test]
    async fn waiter_gets_lock_after_release() {
        let (_, lock) = lock_with(5_000, 2_000);
        let guard = lock.acquire("alice").await.unwrap();
        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire("alice").await.map(|g| g.resource().to_string()) })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        guard.release().await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), "alice");
    }

    #[tokio::test]
    async fn expired_lock_is_reported_lost() {
        let (_, lock) = lock_with(20, 1_000);
        let guard = lock.acquire("alice").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(guard.is_expired());

        // a second caller may take over the expired claim
        let other = lock.acquire("alice").await.unwrap();
        assert_eq!(guard.release().await, Err(ChatError::LockLost("alice".into())));
        other.release().await.ok();
    }

    #[tokio::test]
    async fn dropped_guard_releases() {
        let (_, lock) = lock_with(5_000, 1_000);
        drop(lock.acquire("alice").await.unwrap());
        let guard = lock.acquire("alice").await.unwrap();
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn unavailable_store_fails_acquire() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let lock = DistributedLock::new(store, &ServiceConfig::default());
        assert!(matches!(
            lock.acquire("alice").await,
            Err(ChatError::StoreUnavailable(_))
        ));
    }
}
