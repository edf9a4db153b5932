//! Distributed mutual exclusion over the coordination store
//!
//! - [`LockGuard`]: per-index lock, fail-fast. A busy lock means the job is
//!   requeued, never retried in a loop here.
//! - [`Semaphore`]: the single quorum check-and-clear section shared by every
//!   partition worker. Waits with capped backoff up to a bound.
//!
//! Both hand out a [`Lease`] identified by a UUID token. Release is
//! compare-and-delete on that token, so a holder whose lease expired cannot
//! release a successor's lease. A lease dropped without `release` (panic,
//! cancelled future) is released from a spawned task; process death is covered
//! by the TTL.

use std::sync::Arc;
use std::time::Duration;

use deltaindex_storage::CoordinationStore;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ReindexError, Result};

/// Held lock or semaphore permit.
pub struct Lease {
    store: Arc<dyn CoordinationStore>,
    key: String,
    token: String,
    released: bool,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Returns `false` if the lease had already expired (the TTL was too
    /// short for the work done under it).
    pub async fn release(mut self) -> Result<bool> {
        self.released = true;
        let released = self
            .store
            .unlock(&self.key, &self.token)
            .await
            .map_err(ReindexError::coordination)?;

        if released {
            debug!(key = %self.key, "lease released");
        } else {
            warn!(key = %self.key, "lease expired before release; timeout shorter than the work");
        }
        Ok(released)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(key = %key, "lease dropped without release, releasing in background");
                handle.spawn(async move {
                    if let Err(e) = store.unlock(&key, &token).await {
                        warn!(key = %key, error = %e, "background lease release failed; TTL will reclaim it");
                    }
                });
            }
            Err(_) => {
                warn!(key = %key, "lease dropped outside a runtime; TTL will reclaim it");
            }
        }
    }
}

async fn try_take(
    store: &Arc<dyn CoordinationStore>,
    key: &str,
    ttl: Duration,
) -> Result<Option<Lease>> {
    let token = Uuid::new_v4().to_string();
    let taken = store
        .try_lock(key, &token, ttl)
        .await
        .map_err(ReindexError::coordination)?;

    Ok(taken.then(|| Lease {
        store: store.clone(),
        key: key.to_string(),
        token,
        released: false,
    }))
}

/// Per-index lock.
#[derive(Clone)]
pub struct LockGuard {
    store: Arc<dyn CoordinationStore>,
    timeout: Duration,
}

impl LockGuard {
    pub fn new(store: Arc<dyn CoordinationStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn lock_key(index: &str) -> String {
        format!("lock:delta:{}", index)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Take the lock for `index` with the configured timeout.
    pub async fn acquire(&self, index: &str) -> Result<Lease> {
        self.acquire_with_timeout(index, self.timeout).await
    }

    /// `Err(LockBusy)` when another holder has a live lease.
    pub async fn acquire_with_timeout(&self, index: &str, timeout: Duration) -> Result<Lease> {
        let key = Self::lock_key(index);
        match try_take(&self.store, &key, timeout).await? {
            Some(lease) => {
                debug!(index = %index, timeout_secs = timeout.as_secs(), "lock acquired");
                Ok(lease)
            }
            None => Err(ReindexError::LockBusy(index.to_string())),
        }
    }

    pub async fn is_locked(&self, index: &str) -> Result<bool> {
        self.store
            .exists(&Self::lock_key(index))
            .await
            .map_err(ReindexError::coordination)
    }
}

const BACKOFF_START: Duration = Duration::from_millis(10);
const BACKOFF_MAX: Duration = Duration::from_millis(500);

/// Cluster-wide mutex with a stale-holder timeout and a bounded wait.
#[derive(Clone)]
pub struct Semaphore {
    store: Arc<dyn CoordinationStore>,
    key: String,
    stale_timeout: Duration,
    wait: Duration,
}

impl Semaphore {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        key: impl Into<String>,
        stale_timeout: Duration,
        wait: Duration,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            stale_timeout,
            wait,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn acquire(&self) -> Result<Lease> {
        let started = tokio::time::Instant::now();
        let deadline = started + self.wait;
        let mut backoff = BACKOFF_START;

        loop {
            if let Some(lease) = try_take(&self.store, &self.key, self.stale_timeout).await? {
                debug!(key = %self.key, waited_ms = started.elapsed().as_millis() as u64, "semaphore acquired");
                return Ok(lease);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(ReindexError::SemaphoreTimeout {
                    key: self.key.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deltaindex_storage::InMemoryCoordinationStore;

    fn store() -> Arc<dyn CoordinationStore> {
        Arc::new(InMemoryCoordinationStore::new())
    }

    #[tokio::test]
    async fn test_second_acquire_is_busy() {
        let guard = LockGuard::new(store(), Duration::from_secs(240));

        let lease = guard.acquire("articles_delta").await.unwrap();
        let err = guard.acquire("articles_delta").await.err().unwrap();
        assert!(matches!(err, ReindexError::LockBusy(ref i) if i == "articles_delta"));

        // different index is independent
        let other = guard.acquire("users_delta").await.unwrap();

        assert!(lease.release().await.unwrap());
        assert!(other.release().await.unwrap());
        assert!(!guard.is_locked("articles_delta").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_expires_for_crashed_holder() {
        let guard = LockGuard::new(store(), Duration::from_secs(240));
        let lease = guard.acquire("articles_delta").await.unwrap();
        std::mem::forget(lease);

        tokio::time::advance(Duration::from_secs(241)).await;
        let again = guard.acquire("articles_delta").await.unwrap();
        assert!(again.release().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_after_expiry_reports_false() {
        let guard = LockGuard::new(store(), Duration::from_secs(5));
        let lease = guard.acquire("articles_delta").await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        let successor = guard.acquire("articles_delta").await.unwrap();

        assert!(!lease.release().await.unwrap());
        assert!(guard.is_locked("articles_delta").await.unwrap());
        assert!(successor.release().await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_lease_is_released_in_background() {
        let guard = LockGuard::new(store(), Duration::from_secs(240));
        {
            let _lease = guard.acquire("articles_delta").await.unwrap();
        }
        // let the spawned release run
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!guard.is_locked("articles_delta").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_semaphore_waits_for_holder() {
        let shared = store();
        let semaphore = Semaphore::new(
            shared.clone(),
            "semaphore:incident_index",
            Duration::from_secs(600),
            Duration::from_secs(5),
        );

        let first = semaphore.acquire().await.unwrap();
        let contender = semaphore.clone();
        let waiter = tokio::spawn(async move { contender.acquire().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        first.release().await.unwrap();
        let second = waiter.await.unwrap().unwrap();
        second.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_semaphore_wait_is_bounded() {
        let semaphore = Semaphore::new(
            store(),
            "semaphore:incident_index",
            Duration::from_secs(600),
            Duration::from_secs(2),
        );

        let held = semaphore.acquire().await.unwrap();
        let err = semaphore.acquire().await.err().unwrap();
        assert!(matches!(err, ReindexError::SemaphoreTimeout { .. }));
        held.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_semaphore_recovers_from_stale_holder() {
        let semaphore = Semaphore::new(
            store(),
            "semaphore:incident_index",
            Duration::from_secs(600),
            Duration::from_secs(1),
        );

        std::mem::forget(semaphore.acquire().await.unwrap());
        tokio::time::advance(Duration::from_secs(601)).await;

        let lease = semaphore.acquire().await.unwrap();
        lease.release().await.unwrap();
    }
}
