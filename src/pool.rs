//! Fixed-size async worker pool with a bounded job queue.
//!
//! `N` long-lived worker tasks pull jobs from a shared bounded channel, so at
//! most `N` jobs execute at once and at most `queue_capacity` wait. Submitting
//! to a full queue waits for room (backpressure).
//!
//! Each submitted job gets a [`JobHandle`] that resolves to the job's output.
//! Jobs that have not started when the pool's cancellation token fires
//! resolve to [`PoolError::Cancelled`] without running. A panicking job
//! resolves to [`PoolError::Panicked`] and the worker keeps serving.

use crate::error::PoolError;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

type Job = BoxFuture<'static, ()>;

/// Counters describing what the pool has done so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub submitted: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub panicked: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicUsize,
    completed: AtomicUsize,
    cancelled: AtomicUsize,
    panicked: AtomicUsize,
}

pub struct WorkerPool {
    name: &'static str,
    sender: std::sync::Mutex<Option<mpsc::Sender<Job>>>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
}

impl WorkerPool {
    /// Start `workers` worker tasks sharing a queue of `queue_capacity` jobs.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        name: &'static str,
        workers: usize,
        queue_capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<Job>(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers)
            .map(|id| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                    debug!(pool = name, worker = id, "Worker exiting");
                })
            })
            .collect();

        info!(pool = name, workers, queue_capacity, "Worker pool started");
        Self {
            name,
            sender: std::sync::Mutex::new(Some(tx)),
            workers: handles,
            cancel,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Queue `fut` for execution, waiting while the queue is full.
    pub async fn submit<F, T>(&self, fut: F) -> Result<JobHandle<T>, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self
            .sender
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or(PoolError::Closed)?;

        let (tx, rx) = oneshot::channel();
        let cancel = self.cancel.clone();
        let counters = Arc::clone(&self.counters);
        let name = self.name;

        let job = async move {
            if cancel.is_cancelled() {
                counters.cancelled.fetch_add(1, Ordering::Relaxed);
                let _ = tx.send(Err(PoolError::Cancelled));
                return;
            }
            let out = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(value) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                    Ok(value)
                }
                Err(_) => {
                    counters.panicked.fetch_add(1, Ordering::Relaxed);
                    error!(pool = name, "Job panicked");
                    Err(PoolError::Panicked)
                }
            };
            let _ = tx.send(out);
        }
        .boxed();

        sender.send(job).await.map_err(|_| PoolError::Closed)?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(JobHandle { rx })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting jobs, let queued jobs drain, and wait for every worker.
    pub async fn shutdown(mut self) -> PoolStats {
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                error!(pool = self.name, error = %e, "Worker task failed");
            }
        }
        let stats = self.stats();
        info!(
            pool = self.name,
            submitted = stats.submitted,
            completed = stats.completed,
            cancelled = stats.cancelled,
            "Worker pool stopped"
        );
        stats
    }
}

/// Resolves to the output of one submitted job.
pub struct JobHandle<T> {
    rx: oneshot::Receiver<Result<T, PoolError>>,
}

impl<T> Future for JobHandle<T> {
    type Output = Result<T, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(PoolError::Closed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_jobs_return_their_output() {
        let pool = WorkerPool::new("test", 2, 4, CancellationToken::new());
        let mut handles = Vec::new();
        for i in 0..10u32 {
            handles.push(pool.submit(async move { i * 2 }).await.unwrap());
        }
        let mut out = Vec::new();
        for h in handles {
            out.push(h.await.unwrap());
        }
        assert_eq!(out, (0..10).map(|i| i * 2).collect::<Vec<_>>());
        let stats = pool.shutdown().await;
        assert_eq!(stats.submitted, 10);
        assert_eq!(stats.completed, 10);
    }

    #[tokio::test]
    async fn test_worker_count_bounds_parallelism() {
        let pool = WorkerPool::new("test", 3, 32, CancellationToken::new());
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..12 {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            handles.push(
                pool.submit(async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap(),
            );
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_queued_jobs_are_cancelled() {
        let cancel = CancellationToken::new();
        let pool = WorkerPool::new("test", 1, 8, cancel.clone());

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let first = pool
            .submit(async move {
                let _ = release_rx.await;
                "first"
            })
            .await
            .unwrap();
        let second = pool.submit(async { "second" }).await.unwrap();

        cancel.cancel();
        let _ = release_tx.send(());

        assert_eq!(first.await, Ok("first"));
        assert_eq!(second.await, Err(PoolError::Cancelled));
        let stats = pool.shutdown().await;
        assert_eq!(stats.cancelled, 1);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new("test", 1, 4, CancellationToken::new());
        let bad = pool
            .submit(async {
                panic!("boom");
            })
            .await
            .unwrap();
        let good = pool.submit(async { 7 }).await.unwrap();

        assert_eq!(bad.await, Err::<(), _>(PoolError::Panicked));
        assert_eq!(good.await, Ok(7));
        assert_eq!(pool.shutdown().await.panicked, 1);
    }
}
