//! Request dispatch strategies and the bounded worker pool

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

/// How an application runs its request handler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchStrategy {
    /// Inline on the receiving connection's reader, one request at a time
    #[default]
    Direct,
    /// Fixed pool of workers draining a bounded queue; a full queue rejects
    /// the newest request
    Pooled { workers: usize, queue_capacity: usize },
}

#[derive(Debug)]
pub(crate) enum SubmitError<T> {
    Full(T),
    Closed(T),
}

/// Fixed-size pool of tasks sharing one bounded queue
pub(crate) struct WorkerPool<T> {
    tx: Mutex<Option<mpsc::Sender<T>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Start `workers` tasks, each running `work` on one job at a time
    pub(crate) fn spawn<F, Fut>(workers: usize, queue_capacity: usize, work: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let work = Arc::new(work);

        let handles = (0..workers.max(1))
            .map(|_| {
                let rx = rx.clone();
                let work = work.clone();
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        match job {
                            Some(job) => work(job).await,
                            None => break,
                        }
                    }
                })
            })
            .collect();

        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    /// Queue a job without waiting
    pub(crate) fn try_submit(&self, job: T) -> Result<(), SubmitError<T>> {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = tx.as_ref() else {
            return Err(SubmitError::Closed(job));
        };
        tx.try_send(job).map_err(|e| match e {
            TrySendError::Full(job) => SubmitError::Full(job),
            TrySendError::Closed(job) => SubmitError::Closed(job),
        })
    }

    /// Stop accepting jobs; queued jobs still run
    pub(crate) fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Wait for the workers to drain, aborting whatever is left after `grace`
    pub(crate) async fn join(&self, grace: Duration) {
        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        join_with_grace(handles, grace).await;
    }
}

/// Await every handle until `grace` has elapsed, then abort the rest
pub(crate) async fn join_with_grace(handles: Vec<JoinHandle<()>>, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    for mut handle in handles {
        if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    #[tokio::test]
    async fn test_full_queue_rejects_newest() {
        const WORKERS: usize = 2;
        const QUEUE: usize = 3;

        let gate = Arc::new(Semaphore::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();

        let pool = {
            let gate = gate.clone();
            let done = done.clone();
            WorkerPool::spawn(WORKERS, QUEUE, move |job: usize| {
                let gate = gate.clone();
                let done = done.clone();
                let started_tx = started_tx.clone();
                async move {
                    let _ = started_tx.send(job);
                    if let Ok(permit) = gate.acquire().await {
                        permit.forget();
                    }
                    done.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        // Occupy every worker
        for job in 0..WORKERS {
            pool.try_submit(job).unwrap();
        }
        for _ in 0..WORKERS {
            started_rx.recv().await.unwrap();
        }

        // Q + 1 more: exactly one rejection
        let mut rejected = 0;
        for job in WORKERS..WORKERS + QUEUE + 1 {
            match pool.try_submit(job) {
                Ok(()) => {}
                Err(SubmitError::Full(j)) => {
                    assert_eq!(j, WORKERS + QUEUE);
                    rejected += 1;
                }
                Err(SubmitError::Closed(_)) => panic!("pool closed"),
            }
        }
        assert_eq!(rejected, 1);

        gate.add_permits(WORKERS + QUEUE);
        pool.close();
        pool.join(Duration::from_secs(5)).await;
        assert_eq!(done.load(Ordering::SeqCst), WORKERS + QUEUE);
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_jobs() {
        let pool = WorkerPool::spawn(1, 1, |_job: u32| async {});
        pool.close();
        assert!(matches!(pool.try_submit(1), Err(SubmitError::Closed(1))));
        pool.join(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_join_aborts_stuck_workers() {
        let pool = WorkerPool::spawn(1, 1, |_job: u32| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        pool.try_submit(1).unwrap();
        tokio::task::yield_now().await;
        pool.close();

        let started = tokio::time::Instant::now();
        pool.join(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
