//! Bounded worker pool: caps how many task executions run at once.
//!
//! Slots are reserved without blocking: the dispatcher either gets a slot
//! now or leaves the task due for the next poll. Each slot spawns exactly one
//! execution and frees itself when that execution ends (panics included).

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;

struct PoolState {
    permits: Arc<Semaphore>,
    max_workers: usize,
    active: watch::Sender<usize>,
    peak_active: AtomicUsize,
    total_processed: AtomicU64,
}

/// Fixed-size pool of execution slots.
#[derive(Clone)]
pub struct WorkerPool {
    state: Arc<PoolState>,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        let (active, _) = watch::channel(0);
        Self {
            state: Arc::new(PoolState {
                permits: Arc::new(Semaphore::new(max_workers)),
                max_workers,
                active,
                peak_active: AtomicUsize::new(0),
                total_processed: AtomicU64::new(0),
            }),
        }
    }

    /// Take a free slot, or `None` if every worker is busy.
    pub fn reserve(&self) -> Option<WorkerSlot> {
        let permit = Arc::clone(&self.state.permits).try_acquire_owned().ok()?;
        let mut now_active = 0;
        self.state.active.send_modify(|n| {
            *n += 1;
            now_active = *n;
        });
        self.state.peak_active.fetch_max(now_active, Ordering::Relaxed);
        tracing::debug!("🧵 Worker reserved ({}/{})", now_active, self.state.max_workers);
        Some(WorkerSlot {
            state: Arc::clone(&self.state),
            _permit: permit,
        })
    }

    pub fn active(&self) -> usize {
        *self.state.active.borrow()
    }

    /// Wait until no slot is held, up to `timeout`. Returns whether the pool
    /// drained in time.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.state.active.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0)).await {
            Ok(result) => result.is_ok(),
            Err(_) => false,
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_workers: self.state.max_workers,
            active: self.active(),
            available: self.state.permits.available_permits(),
            peak_active: self.state.peak_active.load(Ordering::Relaxed),
            total_processed: self.state.total_processed.load(Ordering::Relaxed),
        }
    }
}

/// A reserved execution slot.
pub struct WorkerSlot {
    state: Arc<PoolState>,
    _permit: OwnedSemaphorePermit,
}

impl WorkerSlot {
    /// Run `fut` on the runtime, holding this slot until it finishes.
    pub fn spawn<F>(self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            fut.await;
            self.state.total_processed.fetch_add(1, Ordering::Relaxed);
            drop(self);
        })
    }
}

impl Drop for WorkerSlot {
    // Runs before `_permit` is released, so `active` never exceeds the bound.
    fn drop(&mut self) {
        self.state.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Pool counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_workers: usize,
    pub active: usize,
    pub available: usize,
    /// Highest `active` seen since the pool was created.
    pub peak_active: usize,
    pub total_processed: u64,
}
