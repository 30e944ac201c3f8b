use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use async_channel::Receiver;
use async_channel::Sender;
use async_channel::TrySendError;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::protocol::JobHandler;
use crate::protocol::QueueSnapshot;
use crate::protocol::RunJob;

/// Bounded job queue plus a fixed set of worker routines. `submit` never
/// blocks; a full queue is the caller's overload signal. `None` on the
/// channel is the per-worker stop sentinel.
pub struct WorkerPool {
    tx: Sender<Option<RunJob>>,
    rx: Receiver<Option<RunJob>>,
    handler: Arc<dyn JobHandler>,
    max_concurrency: usize,
    queue_limit: usize,
    started: AtomicBool,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(max_concurrency: usize, queue_limit: usize, handler: Arc<dyn JobHandler>) -> Self {
        let (tx, rx) = async_channel::bounded(queue_limit);
        Self {
            tx,
            rx,
            handler,
            max_concurrency,
            queue_limit,
            started: AtomicBool::new(false),
            pending: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Idempotent: a started pool stays as-is.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for idx in 0..self.max_concurrency {
            let rx = self.rx.clone();
            let handler = Arc::clone(&self.handler);
            let pending = Arc::clone(&self.pending);
            let idle = Arc::clone(&self.idle);
            workers.push(tokio::spawn(worker_loop(idx, rx, handler, pending, idle)));
        }
    }

    /// Sends one terminating sentinel per worker and awaits drain.
    /// Idempotent: stopping a stopped pool is a no-op.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            guard.drain(..).collect()
        };
        for _ in 0..workers.len() {
            let _ = self.tx.send(None).await;
        }
        futures::future::join_all(workers).await;
    }

    /// Non-blocking: true when the queue had spare capacity. A pool that is
    /// not started accepts nothing.
    pub fn submit(&self, job: RunJob) -> bool {
        if !self.started.load(Ordering::SeqCst) {
            tracing::error!("submit on a worker pool that is not started");
            return false;
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        match self.tx.try_send(Some(job)) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Closed(_)) => {
                self.job_done();
                false
            }
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            queued: self.tx.len(),
            queue_limit: self.queue_limit,
            workers: self.max_concurrency,
        }
    }

    /// Blocks until every accepted job has completed.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before the counter check so a wake between the check
            // and the await cannot be missed.
            notified.as_mut().enable();
            if self.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn job_done(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

async fn worker_loop(
    idx: usize,
    rx: Receiver<Option<RunJob>>,
    handler: Arc<dyn JobHandler>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
) {
    while let Ok(item) = rx.recv().await {
        let Some(job) = item else {
            return;
        };
        let run_id = job.run_id.clone();
        // Each job runs in its own task so a panicking handler surfaces as
        // a JoinError here instead of taking the worker down.
        let task = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.handle(job).await })
        };
        if let Err(err) = task.await {
            tracing::error!("worker {idx}: job {run_id} aborted: {err}");
        }
        if pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            idle.notify_waiters();
        }
    }
}
