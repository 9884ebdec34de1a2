//! src/prefetch/config.rs
//!
//! Configuration for the prefetch cache.
//!
//! Example:
//! ```ignore
//! let config = PrefetchConfig::builder()
//!     .num_workers(4)
//!     .capacity(8)
//!     .poll_interval(Duration::from_millis(50))
//!     .build()?;
//! ```
//!
//! # Performance considerations:
//! - `num_workers`: More workers hide more upstream latency but multiply I/O
//!   and augmentation load.
//! - `capacity`: Bounds memory to `capacity` finished batches; workers block
//!   once it is reached.
//! - `poll_interval`: How quickly blocked workers and consumers notice
//!   teardown. Not an error timeout.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{PipelineError, Result};

/// Configuration for [`PrefetchCache`](super::PrefetchCache).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Number of worker threads, each running full request/response rounds.
    pub num_workers: usize,
    /// Maximum number of finished batches waiting for the consumer.
    pub capacity: usize,
    /// How often blocked workers and consumers check for teardown.
    pub poll_interval: Duration,
    /// Maximum time a pull waits for a batch. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Base seed for worker requests. Defaults to the seed of the first
    /// request seen.
    pub seed: Option<u64>,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            capacity: 4,
            poll_interval: Duration::from_millis(100),
            timeout: None,
            seed: None,
        }
    }
}

impl PrefetchConfig {
    pub fn builder() -> PrefetchConfigBuilder {
        PrefetchConfigBuilder::default()
    }

    /// Parses and validates a JSON config. Missing fields take their
    /// defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: PrefetchConfig = serde_json::from_str(json)
            .map_err(|e| PipelineError::build(format!("invalid prefetch config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(PipelineError::build(
                "prefetching needs at least one worker (num_workers = 0)",
            ));
        }
        if self.capacity == 0 {
            return Err(PipelineError::build(
                "prefetch capacity must be > 0 to prevent deadlocks",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(PipelineError::build("poll_interval must be > 0"));
        }
        Ok(())
    }
}

/// Builder for PrefetchConfig with method chaining
#[derive(Default)]
pub struct PrefetchConfigBuilder {
    config: PrefetchConfig,
}

impl PrefetchConfigBuilder {
    /// Set the number of workers (must be > 0)
    pub fn num_workers(mut self, workers: usize) -> Self {
        self.config.num_workers = workers;
        self
    }

    /// Set how many finished batches may wait for the consumer (must be > 0)
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity;
        self
    }

    /// Set the shutdown polling interval
    ///
    /// - Too low: More responsive teardown, higher CPU usage.
    /// - Too high: Less overhead, slower teardown.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Fail pulls that wait longer than `timeout` (assuming stuck workers).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// Set the base seed for reproducible worker requests.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Validate and build the final configuration.
    pub fn build(self) -> Result<PrefetchConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
