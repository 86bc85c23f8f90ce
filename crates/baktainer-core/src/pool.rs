//! Bounded-concurrency worker pool.
//!
//! A FIFO queue feeding N workers; `submit` returns a future-like handle
//! resolving to the task's result. This is the only place the engine
//! parallelizes: the per-cycle container fan-out. There are no
//! priorities, no stealing, and no per-task cancellation; `shutdown`
//! drains the queue, `kill` aborts everything.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Error, Result};

const QUEUE_CAPACITY: usize = 256;

type Job = BoxFuture<'static, ()>;

/// Handle to a submitted task; resolves to the task's result.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Wait for the task and return its value or propagate its error.
    pub async fn join(self) -> Result<T> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Runtime("worker abandoned the task".into())),
        }
    }

    fn resolved(result: Result<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

/// Fixed-size pool of workers over a shared FIFO queue.
pub struct WorkerPool {
    tx: Option<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn a pool with `size.max(1)` workers.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (tx, rx) = mpsc::channel::<Job>(QUEUE_CAPACITY);
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..size)
            .map(|id| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        // The guard is released before the job runs, so
                        // workers only serialize on dequeue.
                        let job = { rx.lock().await.recv().await };
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                    debug!(worker = id, "worker exiting");
                })
            })
            .collect();

        Self {
            tx: Some(tx),
            workers,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue a task. The returned handle resolves once a worker has run
    /// it; after `shutdown` it resolves immediately to
    /// [`Error::PoolShutDown`].
    pub async fn submit<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let Some(tx) = &self.tx else {
            return TaskHandle::resolved(Err(Error::PoolShutDown));
        };

        let (result_tx, result_rx) = oneshot::channel();
        let job: Job = async move {
            let _ = result_tx.send(task.await);
        }
        .boxed();

        if tx.send(job).await.is_err() {
            return TaskHandle::resolved(Err(Error::PoolShutDown));
        }
        TaskHandle { rx: result_rx }
    }

    /// Close the queue, let queued tasks finish, and join the workers.
    pub async fn shutdown(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
    }

    /// Abort everything immediately. In-flight task handles resolve to
    /// an error.
    pub fn kill(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            worker.abort();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Queue closes when the sender drops; workers drain and exit on
        // their own. Nothing to join synchronously here.
        self.tx.take();
    }
}
