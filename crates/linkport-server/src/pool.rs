//! Bounded worker pool.
//!
//! Every piece of link code runs as a pool task. A task first waits for one
//! of `worker-max` permits, so a burst of resumes or keepalive dispatches
//! queues instead of growing without bound. Each task gets a monotonic
//! worker id used for diagnostics.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::Semaphore;
use tracing::trace;

/// Pool of worker tasks bounded by a semaphore.
#[derive(Debug)]
pub struct WorkerPool {
    max: usize,
    permits: Arc<Semaphore>,
    next_worker_id: AtomicU64,
}

impl WorkerPool {
    /// Pool running at most `max` tasks at once.
    pub fn new(max: usize) -> Self {
        Self { max, permits: Arc::new(Semaphore::new(max)), next_worker_id: AtomicU64::new(1) }
    }

    /// Schedule `task`, passing it its worker id once a permit is free.
    ///
    /// Returns false if the pool is closed; the task is dropped unrun.
    pub fn spawn<F, Fut>(&self, task: F) -> bool
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.permits.is_closed() {
            return false;
        }
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let permits = Arc::clone(&self.permits);

        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                trace!(worker_id, "worker pool closed before task start");
                return;
            };
            task(worker_id).await;
        });
        true
    }

    /// Tasks holding a permit.
    pub fn busy(&self) -> usize {
        self.max.saturating_sub(self.permits.available_permits())
    }

    /// Refuse new tasks. Running tasks finish normally.
    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, time::Duration};

    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn bounds_concurrency() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        for _ in 0..5 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done_tx = done_tx.clone();
            assert!(pool.spawn(move |_| async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                let _ = done_tx.send(());
            }));
        }

        for _ in 0..5 {
            done_rx.recv().await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn closed_pool_refuses() {
        let pool = WorkerPool::new(1);
        pool.close();
        assert!(!pool.spawn(|_| async {}));
    }
}
