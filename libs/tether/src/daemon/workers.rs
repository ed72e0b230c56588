//! Bounded worker pool for oneway calls and stream pulls.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub(crate) struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub(crate) fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Run `task` once a worker is free
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            // Only fails once the pool is closed
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            task.await;
        });
    }

    /// Workers currently running a task
    pub(crate) fn busy(&self) -> usize {
        self.size.saturating_sub(self.permits.available_permits())
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Refuse further work; queued tasks are dropped
    pub(crate) fn close(&self) {
        self.permits.close();
    }
}
