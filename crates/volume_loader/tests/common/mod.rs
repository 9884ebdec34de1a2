#![allow(dead_code)]

use anyhow::{anyhow, Result};
use ndarray::{Array2, ArrayD, IxDyn};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

use volume_loader::{Array, ArrayKey, ArraySource, ArraySpec, InMemorySource, ProviderSpec, Roi};

static LOGGING: Once = Once::new();

/// Installs the test subscriber once per test binary (`RUST_LOG` overrides).
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let _ = volume_loader::logging::init_logging("volume_loader=warn");
    });
}

/// 2D array whose value at world position `(y, x)` is `y * size + x`, so the
/// origin of any returned block tells where it was read from.
pub fn ramp(size: i64) -> Array {
    let n = size as usize;
    let data = Array2::from_shape_fn((n, n), |(r, c)| (r * n + c) as f32).into_dyn();
    Array::new(data, Roi::new([0, 0], [size, size]), [1, 1]).unwrap()
}

pub fn ramp_source(size: i64) -> InMemorySource {
    InMemorySource::new().with_array("raw", ramp(size))
}

/// World position of the first voxel of a block read from [`ramp`].
pub fn ramp_origin(array: &Array, size: i64) -> (i64, i64) {
    let first = array.data.iter().next().copied().unwrap_or(-1.0) as i64;
    (first / size, first % size)
}

/// Source of one `"raw"` array whose every read returns the read's sequence
/// number (starting at 1), optionally slow or failing.
pub struct CountingSource {
    roi: Roi,
    delay: Duration,
    fail_on: Option<usize>,
    panic_on: Option<usize>,
    reads: Arc<AtomicUsize>,
    torn_down: Arc<AtomicBool>,
}

impl CountingSource {
    pub fn new(roi: Roi) -> Self {
        Self {
            roi,
            delay: Duration::ZERO,
            fail_on: None,
            panic_on: None,
            reads: Arc::new(AtomicUsize::new(0)),
            torn_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fails the `n`-th read (1-based).
    pub fn failing_on(mut self, n: usize) -> Self {
        self.fail_on = Some(n);
        self
    }

    /// Panics in the `n`-th read (1-based).
    pub fn panicking_on(mut self, n: usize) -> Self {
        self.panic_on = Some(n);
        self
    }

    pub fn reads(&self) -> Arc<AtomicUsize> {
        self.reads.clone()
    }

    pub fn torn_down(&self) -> Arc<AtomicBool> {
        self.torn_down.clone()
    }
}

impl ArraySource for CountingSource {
    fn specs(&self) -> ProviderSpec {
        ProviderSpec::new().with_array("raw", ArraySpec::new(self.roi.clone(), [1, 1]))
    }

    fn read(&self, _key: &ArrayKey, roi: &Roi) -> Result<ArrayD<f32>> {
        let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.fail_on == Some(n) {
            return Err(anyhow!("injected failure on read {}", n));
        }
        if self.panic_on == Some(n) {
            panic!("injected panic on read {}", n);
        }

        let shape: Vec<usize> = roi.shape().iter().map(|s| s as usize).collect();
        Ok(ArrayD::from_elem(IxDyn(&shape), n as f32))
    }

    fn teardown(&mut self) {
        self.torn_down.store(true, Ordering::SeqCst);
    }
}

/// Sequence number stored in a block read from [`CountingSource`].
pub fn read_number(array: &Array) -> usize {
    array.data.iter().next().copied().unwrap_or(0.0) as usize
}
