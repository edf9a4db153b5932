//! Job queue carrying index names
//!
//! Delivery is at-least-once and unordered across indices. A job whose lock is
//! busy goes back with a delay ([`JobQueue::enqueue_after`]) so it is not
//! picked straight up again; duplicates of a job that is about to run are
//! pruned with [`JobQueue::remove_pending`].

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::Result;

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, index: &str) -> Result<()> {
        self.enqueue_after(index, Duration::ZERO).await
    }

    /// Enqueue `index`, invisible to `dequeue` until `delay` has passed.
    async fn enqueue_after(&self, index: &str, delay: Duration) -> Result<()>;

    /// Waits until a job is available.
    async fn dequeue(&self) -> Result<String>;

    /// Drop every queued copy of `index`, delayed ones included; returns how
    /// many were removed.
    async fn remove_pending(&self, index: &str) -> Result<usize>;

    async fn len(&self) -> Result<usize>;
}

struct Queued {
    index: String,
    not_before: Instant,
}

/// Process-local FIFO queue. Delayed jobs keep their place and are skipped
/// over until due.
#[derive(Default)]
pub struct InMemoryJobQueue {
    jobs: Mutex<VecDeque<Queued>>,
    available: Notify,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.jobs.lock().iter().map(|job| job.index.clone()).collect()
    }

    /// Pop the first due job, or report when the next one falls due.
    fn take_due(&self) -> std::result::Result<String, Option<Instant>> {
        let mut jobs = self.jobs.lock();
        let now = Instant::now();
        match jobs.iter().position(|job| job.not_before <= now) {
            Some(pos) => jobs
                .remove(pos)
                .map(|job| job.index)
                .ok_or(None),
            None => Err(jobs.iter().map(|job| job.not_before).min()),
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue_after(&self, index: &str, delay: Duration) -> Result<()> {
        self.jobs.lock().push_back(Queued {
            index: index.to_string(),
            not_before: Instant::now() + delay,
        });
        self.available.notify_one();
        Ok(())
    }

    async fn dequeue(&self) -> Result<String> {
        loop {
            // register interest before checking, so a concurrent enqueue is not missed
            let notified = self.available.notified();
            match self.take_due() {
                Ok(index) => return Ok(index),
                Err(Some(due)) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(due) => {}
                    }
                }
                Err(None) => notified.await,
            }
        }
    }

    async fn remove_pending(&self, index: &str) -> Result<usize> {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|queued| queued.index != index);
        Ok(before - jobs.len())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.jobs.lock().len())
    }
}
