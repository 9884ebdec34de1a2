use anyhow::{ensure, Result};
use rand::distr::{weighted::WeightedIndex, Distribution};
use rand::rngs::StdRng;

use crate::coordinate::Coordinate;
use crate::roi::Roi;

/// Non-uniform proposal distribution for [`RandomLocation`](super::RandomLocation).
///
/// `propose` returns the world point the center of the request should land
/// on. `valid` is the set of centers reachable without leaving the upstream
/// ROIs; proposals outside of it are clamped onto its border. Returning
/// `None` means the bias has nothing to offer for this request, which fails
/// the sampling.
pub trait LocationBias: Send + Sync + 'static {
    /// Rank of the proposed points, checked against the sampled arrays at
    /// build time. `None` skips the check.
    fn dims(&self) -> Option<usize> {
        None
    }

    fn propose(&self, valid: &Roi, rng: &mut StdRng) -> Option<Coordinate>;
}

/// Picks among a fixed set of points of interest, proportionally to their
/// weight. Points whose placement is not valid for the current request are
/// skipped.
///
/// # Example
/// ```ignore
/// let synapses = WeightedPoints::new(vec![
///     (Coordinate::new([120, 40]), 1.0),
///     (Coordinate::new([300, 310]), 3.0),
/// ])?;
/// let sampler = RandomLocation::new().with_bias(synapses);
/// ```
#[derive(Debug, Clone)]
pub struct WeightedPoints {
    points: Vec<Coordinate>,
    weights: Vec<f64>,
}

impl WeightedPoints {
    pub fn new(points: Vec<(Coordinate, f64)>) -> Result<Self> {
        ensure!(!points.is_empty(), "WeightedPoints needs at least one point");

        let dims = points[0].0.dims();
        for (point, weight) in &points {
            ensure!(
                point.dims() == dims,
                "point {} does not have {} dimensions",
                point,
                dims
            );
            ensure!(
                weight.is_finite() && *weight >= 0.0,
                "weight of {} must be finite and non-negative, got {}",
                point,
                weight
            );
        }

        let (points, weights) = points.into_iter().unzip();
        Ok(Self { points, weights })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

impl LocationBias for WeightedPoints {
    fn dims(&self) -> Option<usize> {
        self.points.first().map(Coordinate::dims)
    }

    fn propose(&self, valid: &Roi, rng: &mut StdRng) -> Option<Coordinate> {
        let candidates: Vec<usize> = (0..self.points.len())
            .filter(|&i| {
                let point = &self.points[i];
                self.weights[i] > 0.0
                    && point.dims() == valid.dims()
                    && valid.contains_point(point)
            })
            .collect();

        // Fails when no candidate has positive weight.
        let dist = WeightedIndex::new(candidates.iter().map(|&i| self.weights[i])).ok()?;
        Some(self.points[candidates[dist.sample(rng)]].clone())
    }
}
