//! Bounded dispatch pool: N workers draining one bounded queue. Handlers run
//! on the blocking thread pool so disk I/O never stalls the receive loops.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{error, trace};

/// Submission failure. The rejected task is handed back.
#[derive(Debug, PartialEq, Eq)]
pub enum PoolError<T> {
    Full(T),
    Closed(T),
}

/// Submission handle. Cloning is cheap; the workers stop once every handle
/// is dropped and the queue is drained.
pub struct DispatchPool<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for DispatchPool<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> DispatchPool<T> {
    /// Start `workers` workers sharing a queue of `capacity` tasks.
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(workers: usize, capacity: usize, handler: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel::<T>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let handler = Arc::new(handler);
        for worker in 0..workers.max(1) {
            let rx = rx.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                loop {
                    // Hold the lock only while waiting for the next task.
                    let task = rx.lock().await.recv().await;
                    let Some(task) = task else { break };
                    let handler = handler.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || handler(task)).await {
                        error!(worker, error = %e, "dispatch handler panicked");
                    }
                }
                trace!(worker, "dispatch worker stopped");
            });
        }
        Self { tx }
    }

    /// Queue a task, waiting for space when the queue is full.
    pub async fn submit(&self, task: T) -> Result<(), PoolError<T>> {
        self.tx
            .send(task)
            .await
            .map_err(|mpsc::error::SendError(task)| PoolError::Closed(task))
    }

    /// Queue a task without waiting.
    pub fn try_submit(&self, task: T) -> Result<(), PoolError<T>> {
        self.tx.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(task) => PoolError::Full(task),
            mpsc::error::TrySendError::Closed(task) => PoolError::Closed(task),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runs_every_task() {
        let seen = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let pool = {
            let seen = seen.clone();
            DispatchPool::spawn(4, 8, move |n: usize| {
                seen.fetch_add(n, Ordering::SeqCst);
                let _ = done_tx.send(());
            })
        };
        for n in 1..=100 {
            pool.submit(n).await.unwrap();
        }
        for _ in 0..100 {
            done_rx.recv().await.unwrap();
        }
        assert_eq!(seen.load(Ordering::SeqCst), 5050);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_queue_is_reported_and_submit_waits() {
        let (started_tx, started_rx) = std::sync::mpsc::channel::<()>();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = std::sync::Mutex::new(release_rx);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let pool = DispatchPool::spawn(1, 1, move |n: u32| {
            let _ = started_tx.send(());
            let _ = release_rx.lock().unwrap().recv();
            let _ = done_tx.send(n);
        });

        pool.submit(1).await.unwrap();
        // Worker holds task 1; the queue is empty again.
        tokio::task::spawn_blocking(move || {
            started_rx.recv().unwrap();
            started_rx
        })
        .await
        .unwrap();
        pool.try_submit(2).unwrap();
        assert_eq!(pool.try_submit(3), Err(PoolError::Full(3)));

        let blocked = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.submit(3).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }
        blocked.await.unwrap().unwrap();
        let mut done = vec![
            done_rx.recv().await.unwrap(),
            done_rx.recv().await.unwrap(),
            done_rx.recv().await.unwrap(),
        ];
        done.sort();
        assert_eq!(done, vec![1, 2, 3]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_handler_does_not_stop_the_pool() {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let pool = DispatchPool::spawn(1, 4, move |n: u32| {
            if n == 0 {
                panic!("boom");
            }
            let _ = done_tx.send(n);
        });
        pool.submit(0).await.unwrap();
        pool.submit(7).await.unwrap();
        assert_eq!(done_rx.recv().await, Some(7));
    }
}
