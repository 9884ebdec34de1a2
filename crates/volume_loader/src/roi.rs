//! Axis-aligned regions of interest.
//!
//! A [`Roi`] is a half-open box `[begin, begin + shape)` in world units. All
//! coordinates are integers, so containment and intersection are exact. Voxel
//! size is not part of the ROI itself; it is carried by the
//! [`ArraySpec`](crate::array::ArraySpec) the ROI belongs to and passed
//! explicitly to the grid-aware operations (`is_aligned`, `snap_to_grid`).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::coordinate::Coordinate;

/// How [`Roi::snap_to_grid`] moves bounds that are not on the grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapMode {
    /// Begin moves down, end moves up. The result contains the input.
    Grow,
    /// Begin moves up, end moves down. The result is contained in the input.
    Shrink,
    /// Each bound moves to its nearest grid line.
    Closest,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Roi {
    begin: Coordinate,
    shape: Coordinate,
}

impl Roi {
    /// Creates a ROI from its begin and shape.
    ///
    /// # Panics
    /// If the ranks differ or any shape component is negative.
    pub fn new(begin: impl Into<Coordinate>, shape: impl Into<Coordinate>) -> Self {
        let begin = begin.into();
        let shape = shape.into();
        assert_eq!(begin.dims(), shape.dims(), "roi begin/shape rank mismatch");
        assert!(
            shape.all_non_negative(),
            "roi shape must be non-negative, got {}",
            shape
        );
        Self { begin, shape }
    }

    pub fn from_bounds(begin: impl Into<Coordinate>, end: impl Into<Coordinate>) -> Self {
        let begin = begin.into();
        let end = end.into();
        let shape = (&end - &begin).component_max(&Coordinate::zeros(begin.dims()));
        Self::new(begin, shape)
    }

    pub fn begin(&self) -> &Coordinate {
        &self.begin
    }

    pub fn shape(&self) -> &Coordinate {
        &self.shape
    }

    pub fn end(&self) -> Coordinate {
        &self.begin + &self.shape
    }

    pub fn dims(&self) -> usize {
        self.begin.dims()
    }

    /// Number of world units covered (product of the shape).
    pub fn size(&self) -> i64 {
        self.shape.product()
    }

    pub fn empty(&self) -> bool {
        self.shape.iter().any(|s| s == 0)
    }

    /// Center, rounded towards the begin.
    pub fn center(&self) -> Coordinate {
        self.begin.zip_map(&self.shape, |b, s| b + s.div_euclid(2))
    }

    /// Grows the ROI by `amount_begin` before the begin and `amount_end` past
    /// the end, per axis. Negative amounts shrink.
    ///
    /// # Panics
    /// If the resulting shape would be negative on any axis.
    pub fn grow(&self, amount_begin: &Coordinate, amount_end: &Coordinate) -> Roi {
        let begin = &self.begin - amount_begin;
        let shape = &(&self.shape + amount_begin) + amount_end;
        Roi::new(begin, shape)
    }

    /// Inverse of [`grow`](Self::grow).
    pub fn shrink(&self, amount_begin: &Coordinate, amount_end: &Coordinate) -> Roi {
        self.grow(&-amount_begin, &-amount_end)
    }

    pub fn shift(&self, by: &Coordinate) -> Roi {
        Roi {
            begin: &self.begin + by,
            shape: self.shape.clone(),
        }
    }

    pub fn contains_point(&self, point: &Coordinate) -> bool {
        let end = self.end();
        point.zip_all(&self.begin, |p, b| p >= b) && point.zip_all(&end, |p, e| p < e)
    }

    /// Exact containment. An empty ROI is contained in every ROI.
    pub fn contains(&self, other: &Roi) -> bool {
        if other.empty() {
            return true;
        }
        other.begin.zip_all(&self.begin, |o, s| o >= s)
            && other.end().zip_all(&self.end(), |o, s| o <= s)
    }

    /// Overlap of two ROIs, or `None` when they do not overlap.
    pub fn intersect(&self, other: &Roi) -> Option<Roi> {
        let begin = self.begin.component_max(&other.begin);
        let end = self.end().component_min(&other.end());
        if begin.zip_all(&end, |b, e| b < e) {
            Some(Roi::from_bounds(begin, end))
        } else {
            None
        }
    }

    /// Smallest ROI containing both.
    pub fn union(&self, other: &Roi) -> Roi {
        if self.empty() {
            return other.clone();
        }
        if other.empty() {
            return self.clone();
        }
        Roi::from_bounds(
            self.begin.component_min(&other.begin),
            self.end().component_max(&other.end()),
        )
    }

    /// Whether begin and shape are both multiples of `voxel_size`.
    pub fn is_aligned(&self, voxel_size: &Coordinate) -> bool {
        self.begin.is_multiple_of(voxel_size) && self.shape.is_multiple_of(voxel_size)
    }

    /// Moves the bounds onto the grid spanned by `voxel_size`.
    ///
    /// `Shrink` can produce an empty ROI when no grid cell fits inside.
    pub fn snap_to_grid(&self, voxel_size: &Coordinate, mode: SnapMode) -> Roi {
        let end = self.end();
        let (begin, end) = match mode {
            SnapMode::Grow => (self.begin.round_down(voxel_size), end.round_up(voxel_size)),
            SnapMode::Shrink => (self.begin.round_up(voxel_size), end.round_down(voxel_size)),
            SnapMode::Closest => (
                self.begin.round_nearest(voxel_size),
                end.round_nearest(voxel_size),
            ),
        };
        Roi::from_bounds(begin, end)
    }
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}] ({})", self.begin, self.end(), self.shape)
    }
}
