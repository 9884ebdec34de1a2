use anyhow::{ensure, Result};

use crate::array::ArrayKey;
use crate::batch::Batch;

/// Decides whether a candidate location is good enough to be used.
///
/// The sampler requests a trial batch containing only `keys()` at the
/// candidate location and hands it to `accept`.
pub trait Acceptance: Send + Sync + 'static {
    fn keys(&self) -> Vec<ArrayKey>;

    fn accept(&self, trial: &Batch) -> Result<bool>;
}

/// Accepts locations where at least `min_fraction` of the mask is set
/// (strictly positive).
///
/// # Example
/// ```ignore
/// // Only sample where at least 10% of the voxels are labelled.
/// let sampler = RandomLocation::new()
///     .with_acceptance(MinMaskedFraction::new("labels_mask", 0.1)?);
/// ```
#[derive(Debug, Clone)]
pub struct MinMaskedFraction {
    mask: ArrayKey,
    min_fraction: f32,
}

impl MinMaskedFraction {
    pub fn new(mask: impl Into<ArrayKey>, min_fraction: f32) -> Result<Self> {
        ensure!(
            (0.0..=1.0).contains(&min_fraction),
            "min_fraction must be in [0, 1], got {}",
            min_fraction
        );
        Ok(Self {
            mask: mask.into(),
            min_fraction,
        })
    }
}

impl Acceptance for MinMaskedFraction {
    fn keys(&self) -> Vec<ArrayKey> {
        vec![self.mask.clone()]
    }

    fn accept(&self, trial: &Batch) -> Result<bool> {
        let mask = trial.get(&self.mask)?;
        if mask.data.is_empty() {
            return Ok(false);
        }
        let masked = mask.data.iter().filter(|&&v| v > 0.0).count();
        Ok(masked as f32 / mask.data.len() as f32 >= self.min_fraction)
    }
}

/// Acceptance from a closure over the trial batch.
pub struct Predicate<F> {
    keys: Vec<ArrayKey>,
    f: F,
}

impl<F> Predicate<F>
where
    F: Fn(&Batch) -> Result<bool> + Send + Sync + 'static,
{
    pub fn new(keys: impl IntoIterator<Item = impl Into<ArrayKey>>, f: F) -> Self {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            f,
        }
    }
}

impl<F> Acceptance for Predicate<F>
where
    F: Fn(&Batch) -> Result<bool> + Send + Sync + 'static,
{
    fn keys(&self) -> Vec<ArrayKey> {
        self.keys.clone()
    }

    fn accept(&self, trial: &Batch) -> Result<bool> {
        (self.f)(trial)
    }
}
