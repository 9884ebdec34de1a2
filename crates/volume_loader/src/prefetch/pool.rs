//! Worker pool backing the prefetch cache.
//!
//! Provides a set of threads that all feed one bounded output channel. The
//! bound is the backpressure mechanism: a worker that finishes a result while
//! the channel is full blocks until the consumer takes one.
//!
//! # Key features
//! - Bounded channel prevents memory bloat
//! - Shutdown flag checked by workers between rounds and while blocked on a
//!   full channel (see [`send_or_stop`]), so teardown cannot deadlock
//! - Thread-local worker IDs for debugging

use anyhow::Context;
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::warn;

use crate::error::{PipelineError, Result};

thread_local! {
    /// Id of the prefetch worker running on this thread (`None` elsewhere).
    static WORKER_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Id of the prefetch worker executing the current stage call, if any.
pub fn current_worker() -> Option<usize> {
    WORKER_ID.with(Cell::get)
}

/// Thread pool whose workers push results into a shared bounded channel.
///
/// # Type Parameters
/// - `Output`: Results returned from workers
pub(crate) struct WorkerPool<Output> {
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    output_rx: Receiver<Output>,
    shutdown: Arc<AtomicBool>,
}

impl<Output> WorkerPool<Output>
where
    Output: Send + 'static,
{
    /// Spawns `num_workers` threads running `worker_fn(worker_id, output_tx,
    /// shutdown)`. The output channel holds at most `capacity` results.
    pub(crate) fn new<F>(
        num_workers: usize,
        capacity: usize,
        name: &str,
        worker_fn: F,
    ) -> Result<Self>
    where
        F: Fn(usize, Sender<Output>, Arc<AtomicBool>) + Send + Sync + 'static,
    {
        if num_workers == 0 {
            return Err(PipelineError::build(
                "cannot create a worker pool with 0 workers",
            ));
        }
        if capacity == 0 {
            return Err(PipelineError::build(
                "cannot create a worker pool with capacity 0",
            ));
        }

        let (output_tx, output_rx) = bounded(capacity);
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker_fn = Arc::new(worker_fn);
        let mut workers = Vec::with_capacity(num_workers);

        for worker_id in 0..num_workers {
            let output_tx = output_tx.clone();
            let shutdown_clone = shutdown.clone();
            let worker_fn_clone = worker_fn.clone();

            let spawned = thread::Builder::new()
                .name(format!("{}-{}", name, worker_id))
                .spawn(move || {
                    WORKER_ID.with(|id| id.set(Some(worker_id)));
                    worker_fn_clone(worker_id, output_tx, shutdown_clone);
                })
                .with_context(|| format!("Failed to spawn worker thread {}", worker_id));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shutdown.store(true, Ordering::Release);
                    drop(output_rx);
                    for worker in workers {
                        let _ = worker.join();
                    }
                    return Err(PipelineError::build(format!("{:#}", e)));
                }
            }
        }

        Ok(Self {
            workers: Mutex::new(workers),
            output_rx,
            shutdown,
        })
    }

    pub(crate) fn receiver(&self) -> &Receiver<Output> {
        &self.output_rx
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Signals all workers to stop and waits for them. Results still in the
    /// channel are dropped with the pool. Idempotent.
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);

        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            let name = worker.thread().name().unwrap_or("worker").to_string();
            if worker.join().is_err() {
                warn!(worker = %name, "worker thread panicked");
            }
        }
    }
}

impl<Output> Drop for WorkerPool<Output> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);

        let workers = std::mem::take(
            self.workers
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            let _ = worker.join();
        }
    }
}

/// Sends `item`, blocking while the channel is full but waking every
/// `poll_interval` to check `shutdown`. Returns `false` when the worker
/// should stop.
pub(crate) fn send_or_stop<T>(
    tx: &Sender<T>,
    mut item: T,
    shutdown: &AtomicBool,
    poll_interval: Duration,
) -> bool {
    loop {
        if shutdown.load(Ordering::Acquire) {
            return false;
        }
        match tx.send_timeout(item, poll_interval) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(returned)) => item = returned,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}
