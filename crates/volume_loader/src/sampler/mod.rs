//! src/sampler/mod.rs
//!
//! Random placement of requests inside the upstream volume.
//!
//! Downstream of a [`RandomLocation`] stage every key is unbounded: consumers
//! ask for a fixed-size ROI anywhere (typically at the origin) and the stage
//! moves it to a random valid location upstream, then moves the returned data
//! back.
//!
//! # Sampling
//!
//! ```text
//!   NEGOTIATING ──▶ SAMPLING ──▶ VALIDATING ──▶ DONE
//!        │              ▲             │
//!        │              └──rejected───┘  (until max_attempts)
//!        ▼
//!   Unsatisfiable (request does not fit)
//! ```
//!
//! - NEGOTIATING: intersects, over all involved keys, the shifts that keep
//!   the request inside the upstream ROI, snapped to the LCM of their voxel
//!   sizes (see [`ShiftDomain`]).
//! - SAMPLING: draws a shift uniformly on that grid, or asks a
//!   [`LocationBias`].
//! - VALIDATING: with an [`Acceptance`] configured, fetches a trial batch
//!   of the acceptance keys at the candidate and evaluates it.
//!
//! All randomness comes from the request's seed, so a round is reproducible
//! and independent of which worker runs it.

mod acceptance;
mod bias;

pub use acceptance::{Acceptance, MinMaskedFraction, Predicate};
pub use bias::{LocationBias, WeightedPoints};

use rand::rngs::StdRng;
use rand::Rng;
use std::collections::BTreeMap;
use tracing::{debug, trace};

use crate::array::ArrayKey;
use crate::batch::Batch;
use crate::coordinate::Coordinate;
use crate::error::{PipelineError, Result};
use crate::pipeline::{BatchFilter, Prepared, Upstream};
use crate::provider_spec::ProviderSpec;
use crate::request::BatchRequest;
use crate::roi::{Roi, SnapMode};

/// Inclusive range of valid shifts on a grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShiftDomain {
    lo: Coordinate,
    hi: Coordinate,
    step: Coordinate,
}

impl ShiftDomain {
    /// Smallest valid shift.
    pub fn lo(&self) -> &Coordinate {
        &self.lo
    }

    /// Largest valid shift.
    pub fn hi(&self) -> &Coordinate {
        &self.hi
    }

    /// Grid the shifts live on.
    pub fn step(&self) -> &Coordinate {
        &self.step
    }

    /// Number of valid shifts, saturating at `i64::MAX`.
    pub fn len(&self) -> i64 {
        (0..self.lo.dims())
            .map(|d| (self.hi[d] - self.lo[d]) / self.step[d] + 1)
            .fold(1i64, i64::saturating_mul)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, shift: &Coordinate) -> bool {
        shift.zip_all(&self.lo, |s, l| s >= l)
            && shift.zip_all(&self.hi, |s, h| s <= h)
            && (shift - &self.lo).is_multiple_of(&self.step)
    }

    /// Uniform draw over the grid points of the domain.
    pub fn sample(&self, rng: &mut StdRng) -> Coordinate {
        let shift: Vec<i64> = (0..self.lo.dims())
            .map(|d| {
                let steps = (self.hi[d] - self.lo[d]) / self.step[d];
                self.lo[d] + rng.random_range(0..=steps) * self.step[d]
            })
            .collect();
        Coordinate::new(shift)
    }

    /// Closest grid point of the domain to `shift`.
    pub fn clamp(&self, shift: &Coordinate) -> Coordinate {
        let offset = (shift - &self.lo).round_nearest(&self.step);
        (&self.lo + &offset)
            .component_max(&self.lo)
            .component_min(&self.hi)
    }

    /// Where `point` ends up under each valid shift, as a region.
    fn reach_of(&self, point: &Coordinate) -> Roi {
        let ones = Coordinate::ones(point.dims());
        Roi::from_bounds(point + &self.lo, &(point + &self.hi) + &ones)
    }
}

/// Moves each request to a random location inside the upstream ROIs.
///
/// # Example
/// ```ignore
/// let pipeline = PipelineBuilder::source(source)
///     .then(
///         RandomLocation::new()
///             .with_acceptance(MinMaskedFraction::new("mask", 0.1)?)
///             .max_attempts(50),
///     )
///     .build()?;
/// // Any location works, the sampler picks the real one.
/// let request = BatchRequest::new().with_array("raw", Roi::new([0, 0, 0], [40, 128, 128]));
/// ```
pub struct RandomLocation {
    acceptance: Option<Box<dyn Acceptance>>,
    reject_probability: f64,
    max_attempts: usize,
    bias: Option<Box<dyn LocationBias>>,
    salt: u64,
    upstream: ProviderSpec,
}

impl Default for RandomLocation {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomLocation {
    pub fn new() -> Self {
        Self {
            acceptance: None,
            reject_probability: 1.0,
            max_attempts: 100,
            bias: None,
            salt: 0x5EED_1A7E,
            upstream: ProviderSpec::new(),
        }
    }

    pub fn with_acceptance(mut self, acceptance: impl Acceptance) -> Self {
        self.acceptance = Some(Box::new(acceptance));
        self
    }

    /// Probability that a location failing the acceptance test is rejected.
    /// Defaults to 1 (always rejected).
    pub fn reject_probability(mut self, p: f64) -> Self {
        self.reject_probability = p;
        self
    }

    /// How many candidates are tried before the request is declared
    /// unsatisfiable.
    pub fn max_attempts(mut self, n: usize) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn with_bias(mut self, bias: impl LocationBias) -> Self {
        self.bias = Some(Box::new(bias));
        self
    }

    /// Salt mixed into the request seed. Give several samplers in one
    /// pipeline different salts to decorrelate them.
    pub fn with_salt(mut self, salt: u64) -> Self {
        self.salt = salt;
        self
    }

    /// ROIs the chosen shift has to keep inside the upstream: every requested
    /// key, plus acceptance keys over the whole request when not requested.
    fn constrained_regions(&self, request: &BatchRequest) -> Result<BTreeMap<ArrayKey, Roi>> {
        let mut regions = request.arrays.clone();
        let total = request
            .total_roi()
            .ok_or_else(|| PipelineError::unsatisfiable("empty request has no location to sample"))?;

        if let Some(acceptance) = &self.acceptance {
            for key in acceptance.keys() {
                if regions.contains_key(&key) {
                    continue;
                }
                let spec = self.upstream.require(&key, "RandomLocation")?;
                regions.insert(key, total.snap_to_grid(&spec.voxel_size, SnapMode::Grow));
            }
        }
        Ok(regions)
    }

    /// Valid shifts for `request`, or `Unsatisfiable` if there are none.
    pub fn shift_domain(&self, request: &BatchRequest) -> Result<ShiftDomain> {
        let regions = self.constrained_regions(request)?;
        Self::negotiate(&self.upstream, &regions)
    }

    fn negotiate(upstream: &ProviderSpec, regions: &BTreeMap<ArrayKey, Roi>) -> Result<ShiftDomain> {
        let mut bounds: Option<(Coordinate, Coordinate)> = None;
        let mut step: Option<Coordinate> = None;

        for (key, roi) in regions {
            let spec = upstream
                .get(key)
                .ok_or_else(|| PipelineError::UnknownKey { key: key.clone() })?;
            step = Some(match step {
                Some(step) => step.lcm(&spec.voxel_size),
                None => spec.voxel_size.clone(),
            });

            let Some(provided) = &spec.roi else {
                continue;
            };
            let lo = provided.begin() - roi.begin();
            let hi = &provided.end() - &roi.end();
            bounds = Some(match bounds {
                Some((l, h)) => (l.component_max(&lo), h.component_min(&hi)),
                None => (lo, hi),
            });
        }

        let (Some((lo, hi)), Some(step)) = (bounds, step) else {
            return Err(PipelineError::unsatisfiable(
                "none of the requested arrays has a bounded upstream ROI",
            ));
        };

        let lo = lo.round_up(&step);
        let hi = hi.round_down(&step);
        if !hi.zip_all(&lo, |h, l| h >= l) {
            return Err(PipelineError::unsatisfiable(format!(
                "requested ROIs do not fit into the upstream ROIs (valid shifts {}..={} on grid {})",
                lo, hi, step
            )));
        }

        Ok(ShiftDomain { lo, hi, step })
    }

    fn propose(
        &self,
        domain: &ShiftDomain,
        center: &Coordinate,
        rng: &mut StdRng,
    ) -> Result<Coordinate> {
        let Some(bias) = &self.bias else {
            return Ok(domain.sample(rng));
        };

        let reach = domain.reach_of(center);
        let point = bias.propose(&reach, rng).ok_or_else(|| {
            PipelineError::unsatisfiable(format!(
                "location bias has no candidate for centers in {}",
                reach
            ))
        })?;
        Ok(domain.clamp(&(&point - center)))
    }

    fn accepts(
        &self,
        acceptance: &dyn Acceptance,
        regions: &BTreeMap<ArrayKey, Roi>,
        shift: &Coordinate,
        upstream: Upstream<'_>,
        rng: &mut StdRng,
    ) -> Result<bool> {
        let mut trial = BatchRequest::new().with_seed(rng.random());
        for key in acceptance.keys() {
            if let Some(roi) = regions.get(&key) {
                trial.insert(key, roi.shift(shift));
            }
        }

        let batch = upstream.request_batch(&trial)?;
        acceptance
            .accept(&batch)
            .map_err(|e| PipelineError::stage(self.name().to_string(), e))
    }
}

impl BatchFilter for RandomLocation {
    /// The chosen shift.
    type Context = Coordinate;

    fn setup(&mut self, upstream: &ProviderSpec) -> Result<ProviderSpec> {
        if !(0.0..=1.0).contains(&self.reject_probability) {
            return Err(PipelineError::build(format!(
                "reject_probability must be in [0, 1], got {}",
                self.reject_probability
            )));
        }
        if self.max_attempts == 0 {
            return Err(PipelineError::build("max_attempts must be > 0"));
        }
        if !upstream.iter().any(|(_, spec)| spec.roi.is_some()) {
            return Err(PipelineError::build(
                "no upstream array has a bounded ROI to sample from",
            ));
        }
        if let Some(acceptance) = &self.acceptance {
            for key in acceptance.keys() {
                upstream.require(&key, "acceptance test")?;
            }
        }
        if let Some(dims) = self.bias.as_ref().and_then(|bias| bias.dims()) {
            if let Some((key, spec)) = upstream.iter().find(|(_, spec)| spec.dims() != dims) {
                return Err(PipelineError::build(format!(
                    "location bias proposes {}-dimensional points but {} is {}-dimensional",
                    dims,
                    key,
                    spec.dims()
                )));
            }
        }

        self.upstream = upstream.clone();
        Ok(upstream
            .iter()
            .map(|(key, spec)| (key.clone(), spec.clone().with_roi(None)))
            .collect())
    }

    fn prepare(
        &self,
        request: &BatchRequest,
        upstream: Upstream<'_>,
    ) -> Result<Prepared<Coordinate>> {
        let regions = self.constrained_regions(request)?;
        let domain = Self::negotiate(&self.upstream, &regions)?;
        debug!(
            lo = %domain.lo,
            hi = %domain.hi,
            step = %domain.step,
            candidates = domain.len(),
            "negotiated shift domain"
        );

        let center = request
            .total_roi()
            .map(|roi| roi.center())
            .unwrap_or_default();
        let mut rng = request.rng(self.salt);

        for attempt in 1..=self.max_attempts {
            let shift = self.propose(&domain, &center, &mut rng)?;

            if let Some(acceptance) = &self.acceptance {
                let accepted = self.accepts(&**acceptance, &regions, &shift, upstream, &mut rng)?;
                if !accepted && rng.random::<f64>() < self.reject_probability {
                    trace!(attempt, %shift, "location rejected");
                    continue;
                }
            }

            debug!(attempt, %shift, "location chosen");
            let mut moved = request.clone();
            for roi in moved.arrays.values_mut() {
                *roi = roi.shift(&shift);
            }
            return Ok(Prepared::new(moved, shift));
        }

        Err(PipelineError::unsatisfiable(format!(
            "no acceptable location found after {} attempts",
            self.max_attempts
        )))
    }

    fn process(
        &self,
        mut batch: Batch,
        _request: &BatchRequest,
        prepared: Prepared<Coordinate>,
    ) -> Result<Batch> {
        let back = -&prepared.context;
        let arrays = std::mem::take(&mut batch.arrays);

        for (key, array) in arrays {
            // An inner sampler already recorded the true source.
            batch
                .source_rois
                .entry(key.clone())
                .or_insert_with(|| array.roi().clone());
            batch.arrays.insert(key, array.shifted(&back));
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Array;
    use crate::error::ErrorKind;
    use crate::pipeline::{InMemorySource, Pipeline, PipelineBuilder};
    use ndarray::Array2;

    fn ramp_source(size: i64, voxel: i64) -> InMemorySource {
        let n = (size / voxel) as usize;
        let data = Array2::from_shape_fn((n, n), |(r, c)| (r * n + c) as f32).into_dyn();
        let raw = Array::new(data, Roi::new([0, 0], [size, size]), [voxel, voxel]).unwrap();
        InMemorySource::new().with_array("raw", raw)
    }

    fn sampled(sampler: RandomLocation) -> Pipeline {
        PipelineBuilder::source(ramp_source(100, 1))
            .then(sampler)
            .build()
            .unwrap()
    }

    mod negotiation {
        use super::*;

        fn sampler_over(upstream: ProviderSpec) -> RandomLocation {
            let mut sampler = RandomLocation::new();
            sampler.setup(&upstream).unwrap();
            sampler
        }

        #[test]
        fn domain_keeps_request_inside() -> anyhow::Result<()> {
            let sampler = sampler_over(
                ProviderSpec::new().with_array(
                    "raw",
                    crate::array::ArraySpec::new(Roi::new([0, 0], [100, 100]), [1, 1]),
                ),
            );
            let request = BatchRequest::new().with_array("raw", Roi::new([0, 0], [20, 20]));
            let domain = sampler.shift_domain(&request)?;

            assert_eq!(domain.lo(), &Coordinate::new([0, 0]));
            assert_eq!(domain.hi(), &Coordinate::new([80, 80]));
            assert_eq!(domain.len(), 81 * 81);
            Ok(())
        }

        #[test]
        fn domain_snaps_to_common_voxel_grid() -> anyhow::Result<()> {
            use crate::array::ArraySpec;

            let sampler = sampler_over(
                ProviderSpec::new()
                    .with_array("raw", ArraySpec::new(Roi::new([0, 0], [100, 100]), [2, 2]))
                    .with_array("labels", ArraySpec::new(Roi::new([6, 6], [90, 90]), [3, 3])),
            );
            let request = BatchRequest::new()
                .with_array("raw", Roi::new([0, 0], [12, 12]))
                .with_array("labels", Roi::new([0, 0], [12, 12]));
            let domain = sampler.shift_domain(&request)?;

            assert_eq!(domain.step(), &Coordinate::new([6, 6]));
            assert_eq!(domain.lo(), &Coordinate::new([6, 6]));
            assert_eq!(domain.hi(), &Coordinate::new([84, 84]));
            Ok(())
        }

        #[test]
        fn too_large_requests_are_unsatisfiable() {
            let pipeline = sampled(RandomLocation::new());
            let request = BatchRequest::new().with_array("raw", Roi::new([0, 0], [101, 20]));

            let err = pipeline.request_batch(&request).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::RequestUnsatisfiable);
        }

        #[test]
        fn clamp_stays_on_grid() {
            let domain = ShiftDomain {
                lo: Coordinate::new([4]),
                hi: Coordinate::new([20]),
                step: Coordinate::new([4]),
            };

            assert_eq!(domain.clamp(&Coordinate::new([-50])), Coordinate::new([4]));
            assert_eq!(domain.clamp(&Coordinate::new([9])), Coordinate::new([8]));
            assert_eq!(domain.clamp(&Coordinate::new([99])), Coordinate::new([20]));
            assert!(domain.contains(&Coordinate::new([12])));
            assert!(!domain.contains(&Coordinate::new([13])));
        }

        #[test]
        fn huge_domains_saturate_their_size() {
            let domain = ShiftDomain {
                lo: Coordinate::zeros(4),
                hi: Coordinate::splat(1 << 20, 4),
                step: Coordinate::ones(4),
            };
            assert_eq!(domain.len(), i64::MAX);
            assert!(!domain.is_empty());
        }
    }

    mod sampling {
        use super::*;

        #[test]
        fn batches_come_back_at_the_requested_location() -> anyhow::Result<()> {
            let pipeline = sampled(RandomLocation::new());
            let request = BatchRequest::new().with_array("raw", Roi::new([0, 0], [10, 10]));
            let raw = ArrayKey::new("raw");

            for batch in pipeline.batches(&request).take(20) {
                let batch = batch?;
                let array = batch.get(&raw)?;
                assert_eq!(array.roi(), &Roi::new([0, 0], [10, 10]));

                // The data really comes from the recorded source ROI.
                let source = batch.source_roi(&raw).unwrap();
                let begin = source.begin();
                assert_eq!(array.data[[0, 0]], (begin[0] * 100 + begin[1]) as f32);
            }
            Ok(())
        }

        #[test]
        fn bias_of_the_wrong_rank_fails_the_build() -> anyhow::Result<()> {
            let bias = WeightedPoints::new(vec![(Coordinate::new([50, 50, 50]), 1.0)])?;
            let result = PipelineBuilder::source(ramp_source(100, 1))
                .then(RandomLocation::new().with_bias(bias))
                .build();

            let err = result.err().expect("build should fail");
            assert_eq!(err.kind(), ErrorKind::Build);
            assert!(err.to_string().contains("3-dimensional"), "{}", err);
            Ok(())
        }

        #[test]
        fn same_seed_same_location() -> anyhow::Result<()> {
            let pipeline = sampled(RandomLocation::new());
            let request = BatchRequest::new()
                .with_array("raw", Roi::new([0, 0], [10, 10]))
                .with_seed(1234);
            let raw = ArrayKey::new("raw");

            let a = pipeline.request_batch(&request)?;
            let b = pipeline.request_batch(&request.reseeded(1234))?;
            assert_eq!(a.source_roi(&raw), b.source_roi(&raw));
            Ok(())
        }

        #[test]
        fn bias_selects_the_point() -> anyhow::Result<()> {
            let bias = WeightedPoints::new(vec![(Coordinate::new([50, 60]), 1.0)])?;
            let pipeline = sampled(RandomLocation::new().with_bias(bias));
            let request = BatchRequest::new().with_array("raw", Roi::new([0, 0], [10, 10]));

            let batch = pipeline.request_batch(&request)?;
            assert_eq!(
                batch.source_roi(&ArrayKey::new("raw")),
                Some(&Roi::new([45, 55], [10, 10]))
            );
            Ok(())
        }
    }

    mod acceptance {
        use super::*;

        fn masked_pipeline(sampler: RandomLocation) -> Pipeline {
            // Only the quadrant [50, 100)^2 is labelled.
            let mask = Array2::from_shape_fn((100, 100), |(r, c)| {
                if r >= 50 && c >= 50 {
                    1.0
                } else {
                    0.0
                }
            });
            let mask = Array::new(mask.into_dyn(), Roi::new([0, 0], [100, 100]), [1, 1]).unwrap();
            let source = ramp_source(100, 1).with_labels("mask", mask);
            PipelineBuilder::source(source).then(sampler).build().unwrap()
        }

        #[test]
        fn rejected_locations_are_resampled() -> anyhow::Result<()> {
            let acceptance = MinMaskedFraction::new("mask", 1.0)?;
            let pipeline = masked_pipeline(RandomLocation::new().with_acceptance(acceptance));
            let request = BatchRequest::new().with_array("raw", Roi::new([0, 0], [10, 10]));
            let raw = ArrayKey::new("raw");

            for batch in pipeline.batches(&request).take(10) {
                let batch = batch?;
                let source = batch.source_roi(&raw).unwrap();
                assert!(Roi::new([50, 50], [50, 50]).contains(source), "{}", source);
                assert!(!batch.contains(&ArrayKey::new("mask")));
            }
            Ok(())
        }

        #[test]
        fn exhausted_attempts_are_unsatisfiable() {
            let never = Predicate::new(["mask"], |_: &Batch| Ok(false));
            let pipeline =
                masked_pipeline(RandomLocation::new().with_acceptance(never).max_attempts(5));
            let request = BatchRequest::new().with_array("raw", Roi::new([0, 0], [10, 10]));

            let err = pipeline.request_batch(&request).unwrap_err();
            assert!(matches!(err, PipelineError::Unsatisfiable(_)));
        }

        #[test]
        fn zero_reject_probability_accepts_anything() -> anyhow::Result<()> {
            let never = Predicate::new(["mask"], |_: &Batch| Ok(false));
            let pipeline = masked_pipeline(
                RandomLocation::new()
                    .with_acceptance(never)
                    .reject_probability(0.0)
                    .max_attempts(1),
            );
            let request = BatchRequest::new().with_array("raw", Roi::new([0, 0], [10, 10]));

            pipeline.request_batch(&request)?;
            Ok(())
        }

        #[test]
        fn invalid_settings_fail_the_build() {
            let result = PipelineBuilder::source(ramp_source(100, 1))
                .then(RandomLocation::new().reject_probability(2.0))
                .build();
            assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::Build));

            let missing = MinMaskedFraction::new("missing", 0.5).unwrap();
            let result = PipelineBuilder::source(ramp_source(100, 1))
                .then(RandomLocation::new().with_acceptance(missing))
                .build();
            assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::Build));
        }
    }
}
