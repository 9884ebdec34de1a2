//! src/prefetch/mod.rs
//!
//! Background batch production.
//!
//! A [`PrefetchCache`] sits on top of a subtree and runs whole request/response
//! rounds through it on a pool of worker threads, buffering finished batches
//! so that consumer-side pulls rarely wait for I/O or augmentation.
//!
//! # Data flow
//!
//! ```text
//!   worker 0 ──round 0, 1, 2 ...──┐
//!   worker 1 ──round 0, 1, 2 ...──┼──▶ bounded buffer (capacity) ──▶ consumer pull
//!   worker N ──round 0, 1, 2 ...──┘        (FIFO by completion)
//! ```
//!
//! Each worker derives the seed of every round from the base seed, its id and
//! the round number, so two rounds never share random decisions. Workers keep
//! producing until the buffer is full and then block; a pull frees one slot.
//!
//! The cache serves one request identity at a time (the set of requested
//! keys and ROIs). A pull with a different identity discards the buffered
//! batches and restarts the workers for the new request. Batches are never
//! reused: every pull consumes a freshly sampled round.
//!
//! # Failures
//!
//! A worker whose round fails (or panics) puts the error into the buffer in
//! place of a batch and keeps going. The pull that receives it gets a
//! [`PipelineError::Worker`] naming the worker; other workers are unaffected.

mod config;
mod pool;

pub use config::{PrefetchConfig, PrefetchConfigBuilder};
pub use pool::current_worker;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, info, trace, warn};

use crate::batch::Batch;
use crate::error::{PipelineError, Result};
use crate::pipeline::Node;
use crate::provider_spec::ProviderSpec;
use crate::request::BatchRequest;
use pool::{send_or_stop, WorkerPool};

/// One finished round, as buffered for the consumer.
struct Slot {
    worker: usize,
    round: u64,
    result: Result<Batch>,
}

/// Workers serving one request identity.
struct ActivePool {
    template: BatchRequest,
    workers: WorkerPool<Slot>,
}

/// Node that runs its upstream subtree on background workers.
///
/// Must be the only consumer of its subtree. Place it at (or near) the root:
/// stages above it that issue trial requests of a different shape would force
/// a restart of the workers on every trial.
pub struct PrefetchCache {
    upstream: Arc<dyn Node>,
    config: PrefetchConfig,
    active: Mutex<Option<Arc<ActivePool>>>,
    stopped: AtomicBool,
    generation: AtomicU64,
}

impl PrefetchCache {
    pub fn new(upstream: Box<dyn Node>, config: PrefetchConfig) -> Result<Self> {
        config.validate()?;
        info!(
            upstream = upstream.name(),
            num_workers = config.num_workers,
            capacity = config.capacity,
            "prefetch cache created"
        );

        Ok(Self {
            upstream: Arc::from(upstream),
            config,
            active: Mutex::new(None),
            stopped: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &PrefetchConfig {
        &self.config
    }

    /// Returns the pool serving `request`'s identity, (re)starting workers
    /// when the identity changed.
    fn pool_for(&self, request: &BatchRequest) -> Result<Arc<ActivePool>> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(pool) = active.as_ref() {
            if !pool.workers.is_shut_down() && pool.template.same_identity(request) {
                return Ok(Arc::clone(pool));
            }
        }

        if let Some(stale) = active.take() {
            debug!(
                buffered = stale.workers.receiver().len(),
                "request changed, discarding buffered batches"
            );
            stale.workers.shutdown();
        }
        if self.stopped.load(Ordering::Acquire) {
            return Err(PipelineError::Shutdown);
        }

        let pool = Arc::new(self.spawn(request)?);
        *active = Some(Arc::clone(&pool));
        Ok(pool)
    }

    fn spawn(&self, request: &BatchRequest) -> Result<ActivePool> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let base_seed = self.config.seed.unwrap_or(request.random_seed);
        let poll_interval = self.config.poll_interval;
        let upstream = Arc::clone(&self.upstream);
        let template = request.clone();

        debug!(%request, generation, base_seed, "starting prefetch workers");

        let workers = WorkerPool::new(
            self.config.num_workers,
            self.config.capacity,
            "prefetch-worker",
            move |worker, tx, shutdown| {
                let mut round = 0u64;
                while !shutdown.load(Ordering::Acquire) {
                    let seed = round_seed(base_seed, generation, worker, round);
                    let request = template.reseeded(seed);
                    let result = run_round(&*upstream, &request);

                    if let Err(e) = &result {
                        warn!(worker, round, error = %e, "prefetch round failed");
                    } else {
                        trace!(worker, round, "batch ready");
                    }

                    let slot = Slot {
                        worker,
                        round,
                        result,
                    };
                    if !send_or_stop(&tx, slot, &shutdown, poll_interval) {
                        break;
                    }
                    round += 1;
                }
                debug!(worker, rounds = round, "prefetch worker stopped");
            },
        )?;

        Ok(ActivePool {
            template: request.clone(),
            workers,
        })
    }

    fn stop_workers(&self) {
        let stale = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pool) = stale {
            pool.workers.shutdown();
        }
    }
}

/// Seed of `round` on `worker`, unique across workers, rounds and restarts.
fn round_seed(base_seed: u64, generation: u64, worker: usize, round: u64) -> u64 {
    base_seed
        .wrapping_add(generation << 48)
        .wrapping_add(round << 16)
        .wrapping_add(worker as u64)
}

/// Runs one round, turning a panic in any stage into an error.
fn run_round(upstream: &dyn Node, request: &BatchRequest) -> Result<Batch> {
    panic::catch_unwind(AssertUnwindSafe(|| upstream.request_batch(request))).unwrap_or_else(
        |payload| {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(PipelineError::stage(
                upstream.name().to_string(),
                anyhow::anyhow!("panicked: {}", msg),
            ))
        },
    )
}

impl Node for PrefetchCache {
    fn name(&self) -> &str {
        "PrefetchCache"
    }

    fn spec(&self) -> &ProviderSpec {
        self.upstream.spec()
    }

    fn request_batch(&self, request: &BatchRequest) -> Result<Batch> {
        let deadline = self.config.timeout.map(|t| (t, Instant::now() + t));

        loop {
            if self.stopped.load(Ordering::Acquire) {
                return Err(PipelineError::Shutdown);
            }
            let pool = self.pool_for(request)?;

            // Wait on this pool until it delivers or is replaced.
            while !pool.workers.is_shut_down() {
                match pool.workers.receiver().recv_timeout(self.config.poll_interval) {
                    Ok(Slot {
                        worker,
                        round,
                        result,
                    }) => {
                        return match result {
                            Ok(batch) => {
                                debug!(worker, round, "delivering prefetched batch");
                                Ok(batch)
                            }
                            Err(source) => Err(PipelineError::Worker {
                                worker,
                                source: Box::new(source),
                            }),
                        };
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if let Some((timeout, at)) = deadline {
                            if Instant::now() >= at {
                                warn!(?timeout, "timed out waiting for a prefetched batch");
                                return Err(PipelineError::Timeout(timeout));
                            }
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(PipelineError::Shutdown);
                    }
                }
            }
        }
    }

    fn teardown(&mut self) {
        self.stopped.store(true, Ordering::Release);
        self.stop_workers();

        match Arc::get_mut(&mut self.upstream) {
            Some(upstream) => upstream.teardown(),
            None => warn!("upstream still shared after stopping workers, skipping its teardown"),
        }
        info!("prefetch cache torn down");
    }
}

impl Drop for PrefetchCache {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Release);
        self.stop_workers();
    }
}
