//! Bulkhead for concurrency limiting.
//!
//! Backed by a `tokio::sync::Semaphore`. Acquisition waits up to the
//! configured bound before rejecting, and the returned permit releases on
//! every exit path, including panics.

use super::error::BulkheadFull;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct BulkheadConfig {
    pub max_concurrent: usize,
    /// How long `acquire` may wait for a permit before rejecting.
    pub max_wait: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkheadSnapshot {
    pub in_use: usize,
    pub max_concurrent: usize,
    pub total_acquired: u64,
    pub total_rejected: u64,
}

#[derive(Clone)]
pub struct Bulkhead {
    name: String,
    semaphore: Arc<Semaphore>,
    config: BulkheadConfig,
    total_acquired: Arc<AtomicU64>,
    total_rejected: Arc<AtomicU64>,
}

/// RAII permit; dropping it returns capacity to the bulkhead.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Self {
        Self {
            name: name.into(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            total_acquired: Arc::new(AtomicU64::new(0)),
            total_rejected: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Currently held permits.
    pub fn in_use(&self) -> usize {
        self.config.max_concurrent.saturating_sub(self.semaphore.available_permits())
    }

    /// Wait up to `max_wait` for a permit.
    pub async fn acquire(&self) -> Result<BulkheadPermit, BulkheadFull> {
        let acquired =
            tokio::time::timeout(self.config.max_wait, self.semaphore.clone().acquire_owned())
                .await;
        match acquired {
            Ok(Ok(permit)) => {
                self.total_acquired.fetch_add(1, Ordering::Relaxed);
                Ok(BulkheadPermit { _permit: permit })
            }
            // Semaphore is never closed, but treat it as saturation if it is.
            Ok(Err(_)) | Err(_) => {
                self.total_rejected.fetch_add(1, Ordering::Relaxed);
                let rejection =
                    BulkheadFull { in_flight: self.in_use(), max: self.config.max_concurrent };
                tracing::warn!(bulkhead = %self.name, in_flight = rejection.in_flight, "bulkhead rejected request");
                Err(rejection)
            }
        }
    }

    pub fn snapshot(&self) -> BulkheadSnapshot {
        BulkheadSnapshot {
            in_use: self.in_use(),
            max_concurrent: self.config.max_concurrent,
            total_acquired: self.total_acquired.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulkhead(max_concurrent: usize, max_wait_ms: u64) -> Bulkhead {
        Bulkhead::new(
            "read",
            BulkheadConfig {
                max_concurrent,
                max_wait: Duration::from_millis(max_wait_ms),
            },
        )
    }

    #[tokio::test]
    async fn grants_permits_up_to_limit() {
        let bh = bulkhead(2, 10);
        let p1 = bh.acquire().await.unwrap();
        let p2 = bh.acquire().await.unwrap();
        assert_eq!(bh.in_use(), 2);
        drop(p1);
        drop(p2);
        assert_eq!(bh.in_use(), 0);
    }

    #[tokio::test]
    async fn rejects_after_wait_bound_when_saturated() {
        let bh = bulkhead(1, 20);
        let _held = bh.acquire().await.unwrap();

        let err = bh.acquire().await.unwrap_err();
        assert_eq!(err.max, 1);
        assert_eq!(err.in_flight, 1);
        assert_eq!(bh.snapshot().total_rejected, 1);
    }

    #[tokio::test]
    async fn waits_for_a_permit_released_in_time() {
        let bh = bulkhead(1, 500);
        let held = bh.acquire().await.unwrap();

        let waiter = {
            let bh = bh.clone();
            tokio::spawn(async move { bh.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn permit_released_when_task_panics() {
        let bh = bulkhead(1, 10);
        let panicking = {
            let bh = bh.clone();
            tokio::spawn(async move {
                let _permit = bh.acquire().await.unwrap();
                panic!("handler blew up");
            })
        };
        assert!(panicking.await.is_err());
        assert_eq!(bh.in_use(), 0);
        assert!(bh.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn snapshot_tracks_acquisitions() {
        let bh = bulkhead(2, 10);
        let p = bh.acquire().await.unwrap();
        let snap = bh.snapshot();
        assert_eq!(snap.in_use, 1);
        assert_eq!(snap.max_concurrent, 2);
        assert_eq!(snap.total_acquired, 1);
        drop(p);
    }
}
