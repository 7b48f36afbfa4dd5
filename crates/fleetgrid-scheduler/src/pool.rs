//! WorkerPool — bounded fork-join over blocking jobs.
//!
//! Every job runs on the blocking thread pool; at most `width` run at once.
//! `run_all` returns only after every job has finished.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    width: usize,
}

impl WorkerPool {
    pub fn new(width: usize) -> Self {
        let width = width.max(1);
        Self {
            permits: Arc::new(Semaphore::new(width)),
            width,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Run every job and return results in job order. A job that panicked
    /// yields `None`.
    pub async fn run_all<T, F>(&self, jobs: Vec<F>) -> Vec<Option<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut results: Vec<Option<T>> = Vec::with_capacity(jobs.len());
        results.resize_with(jobs.len(), || None);

        let mut join_set: JoinSet<(usize, Option<T>)> = JoinSet::new();
        for (index, job) in jobs.into_iter().enumerate() {
            let permits = self.permits.clone();
            join_set.spawn(async move {
                let _permit = permits.acquire_owned().await.expect("worker pool closed");
                match tokio::task::spawn_blocking(job).await {
                    Ok(value) => (index, Some(value)),
                    Err(e) => {
                        warn!(job = index, error = %e, "worker job panicked");
                        (index, None)
                    }
                }
            });
        }

        while let Some(res) = join_set.join_next().await {
            match res {
                Ok((index, value)) => results[index] = value,
                Err(e) => warn!(error = %e, "worker task failed"),
            }
        }
        results
    }
}
