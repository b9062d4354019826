//! Bounded worker pools
//!
//! A pool runs at most `workers` jobs at once and admits at most
//! `workers + queue` jobs in total. Admission is fail-fast: a full pool
//! rejects the job with [`Error::CapacityExceeded`] instead of growing.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, TryAcquireError};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Fixed-capacity job executor with a bounded queue
pub struct WorkerPool {
    name: &'static str,
    workers: usize,
    queue: usize,
    worker_slots: Arc<Semaphore>,
    admission: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashMap<u64, AbortHandle>>>,
    idle: Arc<Notify>,
    next_id: AtomicU64,
}

impl WorkerPool {
    /// Create a pool
    ///
    /// # Arguments
    ///
    /// * `name` - Pool name used in logs and errors
    /// * `workers` - Jobs allowed to run concurrently
    /// * `queue` - Jobs allowed to wait for a worker
    pub fn new(name: &'static str, workers: usize, queue: usize) -> Self {
        let workers = workers.clamp(1, Semaphore::MAX_PERMITS);
        let queue = queue.min(Semaphore::MAX_PERMITS - workers);
        Self {
            name,
            workers,
            queue,
            worker_slots: Arc::new(Semaphore::new(workers)),
            admission: Arc::new(Semaphore::new(workers + queue)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            idle: Arc::new(Notify::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue
    }

    /// Jobs currently running or queued
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.admission.is_closed()
    }

    /// Submit a job
    ///
    /// Fails immediately with [`Error::CapacityExceeded`] when every worker is
    /// busy and the queue is full, or [`Error::PoolShutdown`] after
    /// [`shutdown`](Self::shutdown).
    pub fn submit<F>(&self, job: F) -> Result<TaskHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let admission = match self.admission.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                debug!(
                    pool = self.name,
                    workers = self.workers,
                    queue = self.queue,
                    "Worker pool full, rejecting job"
                );
                return Err(Error::CapacityExceeded { pool: self.name });
            }
            Err(TryAcquireError::Closed) => {
                return Err(Error::PoolShutdown { pool: self.name });
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slots = self.worker_slots.clone();
        let guard = InFlightGuard {
            id,
            in_flight: self.in_flight.clone(),
            idle: self.idle.clone(),
        };

        // Hold the lock across spawn so a fast job cannot deregister before
        // it is registered.
        let mut in_flight = self.in_flight.lock();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let _admission = admission;
            let _slot = slots.acquire_owned().await.ok();
            job.await
        });
        in_flight.insert(id, handle.abort_handle());
        drop(in_flight);

        Ok(TaskHandle {
            handle,
            pool: self.name,
        })
    }

    /// Stop accepting jobs, give in-flight jobs `grace` to finish, then abort
    /// whatever is left
    pub async fn shutdown(&self, grace: Duration) {
        self.admission.close();
        info!(pool = self.name, in_flight = self.in_flight(), "Shutting down worker pool");

        let drained = tokio::time::timeout(grace, self.wait_idle()).await.is_ok();
        if !drained {
            let handles: Vec<AbortHandle> = self.in_flight.lock().values().cloned().collect();
            warn!(
                pool = self.name,
                remaining = handles.len(),
                grace_ms = grace.as_millis() as u64,
                "Grace period elapsed, aborting remaining jobs"
            );
            for handle in handles {
                handle.abort();
            }
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .field("queue", &self.queue)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

struct InFlightGuard {
    id: u64,
    in_flight: Arc<Mutex<HashMap<u64, AbortHandle>>>,
    idle: Arc<Notify>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.id);
        self.idle.notify_waiters();
    }
}

/// Handle to a submitted job
///
/// Awaiting yields the job's output, or [`Error::InterruptedDuringWait`] when
/// the job was cancelled or panicked. Dropping the handle cancels the job.
#[derive(Debug)]
pub struct TaskHandle<T> {
    handle: JoinHandle<T>,
    pool: &'static str,
}

impl<T> TaskHandle<T> {
    /// Cancel the job at its next await point
    ///
    /// Local only: work already handed to a remote host keeps running.
    pub fn cancel(&self) {
        debug!(pool = self.pool, "Cancelling job");
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.handle).poll(cx) {
            Poll::Ready(Ok(output)) => Poll::Ready(Ok(output)),
            Poll::Ready(Err(e)) => {
                debug!(pool = this.pool, error = %e, "Job did not complete");
                Poll::Ready(Err(Error::InterruptedDuringWait(this.pool)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
