use anyhow::{ensure, Result};
use ndarray::{ArrayD, IxDyn, Slice};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::coordinate::Coordinate;
use crate::roi::Roi;

/// Logical identifier of an array flowing through a pipeline (e.g. `"raw"`,
/// `"labels"`). Cloning only bumps a reference count.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArrayKey(Arc<str>);

impl ArrayKey {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArrayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArrayKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Declared properties of an array: where it can be provided and on which
/// grid.
///
/// `roi == None` means "unbounded": the node can serve the key at any
/// location, which is what nodes downstream of a random-location sampler
/// declare.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArraySpec {
    pub roi: Option<Roi>,
    pub voxel_size: Coordinate,
    /// Whether values may be interpolated (intensities) or not (labels).
    pub interpolatable: bool,
}

impl ArraySpec {
    pub fn new(roi: Roi, voxel_size: impl Into<Coordinate>) -> Self {
        Self {
            roi: Some(roi),
            voxel_size: voxel_size.into(),
            interpolatable: true,
        }
    }

    pub fn unbounded(voxel_size: impl Into<Coordinate>) -> Self {
        Self {
            roi: None,
            voxel_size: voxel_size.into(),
            interpolatable: true,
        }
    }

    pub fn with_interpolatable(mut self, interpolatable: bool) -> Self {
        self.interpolatable = interpolatable;
        self
    }

    pub fn with_roi(mut self, roi: Option<Roi>) -> Self {
        self.roi = roi;
        self
    }

    pub fn dims(&self) -> usize {
        self.voxel_size.dims()
    }

    /// Whether `roi` lies within the declared bounds (always true when
    /// unbounded).
    pub fn covers(&self, roi: &Roi) -> bool {
        self.roi.as_ref().map_or(true, |provided| provided.contains(roi))
    }
}

/// Realized data for one key together with the ROI it covers.
///
/// The trailing `roi.dims()` axes of `data` are spatial and measured in
/// voxels; any leading axes are channels and are never cropped.
#[derive(Clone, Debug)]
pub struct Array {
    pub data: ArrayD<f32>,
    roi: Roi,
    voxel_size: Coordinate,
}

impl Array {
    /// Wraps `data` covering `roi`, checking that the spatial extent matches.
    pub fn new(data: ArrayD<f32>, roi: Roi, voxel_size: impl Into<Coordinate>) -> Result<Self> {
        let voxel_size = voxel_size.into();
        ensure!(
            roi.dims() == voxel_size.dims(),
            "ROI {} and voxel size {} have different ranks",
            roi,
            voxel_size
        );
        ensure!(
            roi.is_aligned(&voxel_size),
            "ROI {} is not aligned to voxel size {}",
            roi,
            voxel_size
        );
        ensure!(
            data.ndim() >= roi.dims(),
            "data has {} axes but ROI {} is {}-dimensional",
            data.ndim(),
            roi,
            roi.dims()
        );

        let expected = roi.shape() / &voxel_size;
        let spatial = &data.shape()[data.ndim() - roi.dims()..];
        ensure!(
            spatial.iter().zip(expected.iter()).all(|(&d, e)| d as i64 == e),
            "data shape {:?} does not match ROI {} at voxel size {}",
            data.shape(),
            roi,
            voxel_size
        );

        Ok(Self {
            data,
            roi,
            voxel_size,
        })
    }

    /// Array of `fill` values covering `roi`, with optional channel axes.
    pub fn filled(
        fill: f32,
        channels: &[usize],
        roi: Roi,
        voxel_size: impl Into<Coordinate>,
    ) -> Result<Self> {
        let voxel_size = voxel_size.into();
        let mut shape = channels.to_vec();
        shape.extend(
            (roi.shape() / &voxel_size)
                .iter()
                .map(|v| v.max(0) as usize),
        );
        Self::new(ArrayD::from_elem(IxDyn(&shape), fill), roi, voxel_size)
    }

    pub fn roi(&self) -> &Roi {
        &self.roi
    }

    pub fn voxel_size(&self) -> &Coordinate {
        &self.voxel_size
    }

    pub fn spec(&self) -> ArraySpec {
        ArraySpec::new(self.roi.clone(), self.voxel_size.clone())
    }

    /// Number of leading channel axes.
    pub fn channel_dims(&self) -> usize {
        self.data.ndim() - self.roi().dims()
    }

    /// Spatial shape in voxels.
    pub fn voxel_shape(&self) -> Vec<usize> {
        self.data.shape()[self.channel_dims()..].to_vec()
    }

    /// Returns the part of this array covering `roi`.
    pub fn crop(&self, roi: &Roi) -> Result<Array> {
        ensure!(
            self.roi().contains(roi),
            "cannot crop {} out of an array covering {}",
            roi,
            self.roi()
        );
        ensure!(
            roi.is_aligned(self.voxel_size()),
            "crop ROI {} is not aligned to voxel size {}",
            roi,
            self.voxel_size()
        );

        if roi == self.roi() {
            return Ok(self.clone());
        }

        let start = &(roi.begin() - self.roi().begin()) / self.voxel_size();
        let len = roi.shape() / self.voxel_size();
        let channels = self.channel_dims();
        let data = self
            .data
            .slice_each_axis(|axis| {
                let i = axis.axis.index();
                if i < channels {
                    Slice::from(..)
                } else {
                    let s = start[i - channels] as isize;
                    Slice::from(s..s + len[i - channels] as isize)
                }
            })
            .to_owned();

        Ok(Array {
            data,
            roi: roi.clone(),
            voxel_size: self.voxel_size.clone(),
        })
    }

    /// Moves the array to a different location without touching the data.
    pub fn shifted(mut self, by: &Coordinate) -> Array {
        self.roi = self.roi.shift(by);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn ramp(rows: usize, cols: usize) -> ArrayD<f32> {
        Array2::from_shape_fn((rows, cols), |(r, c)| (r * cols + c) as f32).into_dyn()
    }

    #[test]
    fn rejects_mismatched_shapes() {
        let roi = Roi::new([0, 0], [8, 8]);
        assert!(Array::new(ramp(4, 4), roi.clone(), [2, 2]).is_ok());
        assert!(Array::new(ramp(4, 5), roi.clone(), [2, 2]).is_err());
        assert!(Array::new(ramp(4, 4), Roi::new([1, 0], [8, 8]), [2, 2]).is_err());
    }

    #[test]
    fn crop_uses_voxel_units() -> Result<()> {
        let array = Array::new(ramp(4, 4), Roi::new([10, 10], [8, 8]), [2, 2])?;
        let cropped = array.crop(&Roi::new([12, 14], [4, 2]))?;

        assert_eq!(cropped.voxel_shape(), vec![2, 1]);
        assert_eq!(cropped.data[[0, 0]], 6.0);
        assert_eq!(cropped.data[[1, 0]], 10.0);
        assert_eq!(cropped.roi(), &Roi::new([12, 14], [4, 2]));
        Ok(())
    }

    #[test]
    fn crop_keeps_channel_axes() -> Result<()> {
        let array = Array::filled(1.0, &[3], Roi::new([0, 0], [4, 4]), [1, 1])?;
        let cropped = array.crop(&Roi::new([1, 1], [2, 2]))?;

        assert_eq!(cropped.data.shape(), &[3, 2, 2]);
        assert_eq!(cropped.channel_dims(), 1);
        Ok(())
    }

    #[test]
    fn keys_and_specs_serialize() -> Result<()> {
        let key = ArrayKey::new("raw");
        assert_eq!(serde_json::to_string(&key)?, "\"raw\"");
        assert_eq!(serde_json::from_str::<ArrayKey>("\"raw\"")?, key);

        let spec = ArraySpec::new(Roi::new([0, 0], [8, 8]), [2, 2]);
        let json = serde_json::to_string(&spec)?;
        assert_eq!(serde_json::from_str::<ArraySpec>(&json)?, spec);
        Ok(())
    }

    #[test]
    fn crop_outside_fails() -> Result<()> {
        let array = Array::filled(0.0, &[], Roi::new([0, 0], [4, 4]), [1, 1])?;
        assert!(array.crop(&Roi::new([2, 2], [4, 4])).is_err());
        Ok(())
    }
}
