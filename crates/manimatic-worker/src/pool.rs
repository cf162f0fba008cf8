//! Bounded worker pool for task execution.
//!
//! A fixed number of cooperative workers drain a bounded channel. The
//! channel capacity equals the pool size, so [`WorkerPool::submit`] blocks
//! once every worker is busy; the fetch loop slows down instead of dropping
//! messages (unacknowledged messages stay in the queue).
//!
//! Each task runs inside its own spawned task that the worker awaits, so a
//! panicking task is isolated, logged, and cannot fell the worker.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

/// A fixed-size pool of task workers.
#[derive(Debug)]
pub struct WorkerPool<T> {
    tx: mpsc::Sender<T>,
    handles: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Starts `worker_count` workers processing tasks with `handler`.
    pub fn start<F, Fut>(worker_count: usize, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let worker_count = worker_count.max(1);
        let (tx, rx) = mpsc::channel(worker_count);
        let rx = Arc::new(Mutex::new(rx));
        let handler = Arc::new(handler);

        let handles = (0..worker_count)
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let handler = Arc::clone(&handler);
                tokio::spawn(worker_loop(worker + 1, rx, handler))
            })
            .collect();

        Self { tx, handles }
    }

    /// Submits a task, waiting while all workers are busy.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool has been stopped.
    pub async fn submit(&self, task: T) -> Result<()> {
        self.tx
            .send(task)
            .await
            .map_err(|_| anyhow::anyhow!("worker pool is stopped"))
    }

    /// Closes the task channel and waits for all workers to drain and exit.
    pub async fn stop(self) {
        drop(self.tx);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop<T, F, Fut>(worker: usize, rx: Arc<Mutex<mpsc::Receiver<T>>>, handler: Arc<F>)
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tracing::debug!(worker = worker, "worker started");

    loop {
        let task = { rx.lock().await.recv().await };
        let Some(task) = task else {
            break;
        };

        // Run the task in its own spawn so a panic is contained to the task.
        match tokio::spawn(handler(task)).await {
            Ok(Ok(())) => {
                tracing::debug!(worker = worker, "task processed successfully");
            }
            Ok(Err(e)) => {
                tracing::error!(worker = worker, error = %e, "task processing failed");
            }
            Err(join_err) if join_err.is_panic() => {
                let panic = panic_message(join_err.into_panic());
                tracing::error!(worker = worker, panic = %panic, "task panic recovered");
            }
            Err(join_err) => {
                tracing::error!(worker = worker, error = %join_err, "task aborted");
            }
        }
    }

    tracing::debug!(worker = worker, "task channel closed, worker exiting");
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Builds a pool whose tasks block until a permit is released.
    fn gated_pool(
        worker_count: usize,
        release: &Arc<Semaphore>,
        finished: &Arc<AtomicUsize>,
    ) -> WorkerPool<()> {
        let release = Arc::clone(release);
        let finished = Arc::clone(finished);
        WorkerPool::start(worker_count, move |_task: ()| {
            let release = Arc::clone(&release);
            let finished = Arc::clone(&finished);
            async move {
                release
                    .acquire()
                    .await
                    .expect("semaphore stays open")
                    .forget();
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn processes_submitted_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = {
            let counter = Arc::clone(&counter);
            WorkerPool::start(4, move |n: usize| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(n, Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        for n in 1..=10 {
            pool.submit(n).await.expect("submit should succeed");
        }
        pool.stop().await;

        assert_eq!(counter.load(Ordering::SeqCst), 55);
    }

    #[tokio::test]
    async fn panicking_task_does_not_fell_the_worker() {
        let processed = Arc::new(AtomicUsize::new(0));
        let pool = {
            let processed = Arc::clone(&processed);
            WorkerPool::start(1, move |poison: bool| {
                let processed = Arc::clone(&processed);
                async move {
                    assert!(!poison, "poisoned task");
                    processed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        pool.submit(true).await.expect("poison submits fine");
        pool.submit(false).await.expect("follow-up submits fine");
        pool.stop().await;

        assert_eq!(processed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_drains_in_flight_tasks() {
        let release = Arc::new(Semaphore::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let pool = gated_pool(2, &release, &finished);

        pool.submit(()).await.expect("submit should succeed");
        pool.submit(()).await.expect("submit should succeed");

        let stop = tokio::spawn(pool.stop());
        release.add_permits(2);
        stop.await.expect("stop should complete");

        assert_eq!(finished.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn submit_blocks_when_pool_is_saturated() {
        let release = Arc::new(Semaphore::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let pool = gated_pool(1, &release, &finished);

        // One task occupies the worker, one fills the channel slot.
        pool.submit(()).await.expect("first submit");
        pool.submit(()).await.expect("second submit");

        let blocked = tokio::time::timeout(Duration::from_millis(100), pool.submit(())).await;
        assert!(blocked.is_err(), "third submit must block at capacity");

        release.add_permits(1);
        tokio::time::timeout(Duration::from_secs(1), pool.submit(()))
            .await
            .expect("submit should unblock once a worker frees up")
            .expect("submit should succeed");

        release.add_permits(2);
        pool.stop().await;
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }
}
