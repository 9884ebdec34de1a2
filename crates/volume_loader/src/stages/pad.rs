use ndarray::Slice;

use crate::array::{Array, ArrayKey};
use crate::batch::Batch;
use crate::coordinate::Coordinate;
use crate::error::{PipelineError, Result};
use crate::pipeline::{BatchFilter, Prepared, Upstream};
use crate::provider_spec::ProviderSpec;
use crate::request::BatchRequest;
use crate::roi::Roi;

/// Extends the declared ROI of one key, filling reads outside the upstream
/// ROI with a constant.
///
/// With `size == None` the key becomes unbounded, so a random-location
/// sampler downstream is free to place requests partially outside the data.
///
/// # Example
/// ```ignore
/// // 8 world units of zeros around the labels
/// let pad = Pad::new("labels", Some(Coordinate::new([8, 8, 8])));
/// ```
#[derive(Debug, Clone)]
pub struct Pad {
    key: ArrayKey,
    size: Option<Coordinate>,
    value: f32,
    upstream_roi: Option<Roi>,
    voxel_size: Coordinate,
}

impl Pad {
    pub fn new(key: impl Into<ArrayKey>, size: Option<Coordinate>) -> Self {
        Self {
            key: key.into(),
            size,
            value: 0.0,
            upstream_roi: None,
            voxel_size: Coordinate::default(),
        }
    }

    pub fn with_value(mut self, value: f32) -> Self {
        self.value = value;
        self
    }

    /// Fills `requested`, copying `upstream` in when it overlaps. Channel
    /// axes always follow `upstream`.
    fn pad(&self, upstream: Array, overlaps: bool, requested: &Roi) -> anyhow::Result<Array> {
        let channels = upstream.data.shape()[..upstream.channel_dims()].to_vec();
        let mut padded = Array::filled(
            self.value,
            &channels,
            requested.clone(),
            self.voxel_size.clone(),
        )?;

        if overlaps {
            let start = &(upstream.roi().begin() - requested.begin()) / &self.voxel_size;
            let n_channels = upstream.channel_dims();
            padded
                .data
                .slice_each_axis_mut(|axis| {
                    let i = axis.axis.index();
                    if i < n_channels {
                        Slice::from(..)
                    } else {
                        let s = start[i - n_channels] as isize;
                        Slice::from(s..s + upstream.data.shape()[i] as isize)
                    }
                })
                .assign(&upstream.data);
        }
        Ok(padded)
    }
}

impl BatchFilter for Pad {
    /// Part of the requested ROI that lies inside the upstream ROI.
    type Context = Option<Roi>;

    fn setup(&mut self, upstream: &ProviderSpec) -> Result<ProviderSpec> {
        let spec = upstream.require(&self.key, "Pad")?;
        let provided = spec.roi.clone().ok_or_else(|| {
            PipelineError::build(format!("cannot pad {}: its upstream ROI is unbounded", self.key))
        })?;

        let padded = match &self.size {
            Some(size) => {
                if size.dims() != spec.dims()
                    || !size.all_non_negative()
                    || !size.is_multiple_of(&spec.voxel_size)
                {
                    return Err(PipelineError::build(format!(
                        "padding {} of {} must be non-negative and a multiple of voxel size {}",
                        size, self.key, spec.voxel_size
                    )));
                }
                Some(provided.grow(size, size))
            }
            None => None,
        };

        self.voxel_size = spec.voxel_size.clone();
        self.upstream_roi = Some(provided);

        let mut provides = upstream.clone();
        if let Some(spec) = provides.get_mut(&self.key) {
            spec.roi = padded;
        }
        Ok(provides)
    }

    fn prepare(
        &self,
        request: &BatchRequest,
        _upstream: Upstream<'_>,
    ) -> Result<Prepared<Option<Roi>>> {
        let Some(requested) = request.get(&self.key) else {
            return Ok(Prepared::new(request.clone(), None));
        };

        let inside = self
            .upstream_roi
            .as_ref()
            .and_then(|provided| provided.intersect(requested));

        // Entirely in the padding: one voxel still tells the channel shape.
        let upstream_roi = match (&inside, &self.upstream_roi) {
            (Some(roi), _) => roi.clone(),
            (None, Some(provided)) => Roi::new(provided.begin().clone(), self.voxel_size.clone()),
            (None, None) => {
                return Err(PipelineError::build(format!(
                    "Pad for {} was not set up",
                    self.key
                )))
            }
        };

        let mut upstream_request = request.clone();
        upstream_request.insert(self.key.clone(), upstream_roi);
        Ok(Prepared::new(upstream_request, inside))
    }

    fn process(
        &self,
        mut batch: Batch,
        request: &BatchRequest,
        prepared: Prepared<Option<Roi>>,
    ) -> Result<Batch> {
        let Some(requested) = request.get(&self.key) else {
            return Ok(batch);
        };
        if prepared.context.as_ref() == Some(requested) {
            return Ok(batch);
        }

        let upstream = batch.remove(&self.key).ok_or_else(|| {
            PipelineError::stage("Pad", anyhow::anyhow!("upstream did not provide {}", self.key))
        })?;
        let padded = self
            .pad(upstream, prepared.context.is_some(), requested)
            .map_err(|e| PipelineError::stage("Pad", e))?;
        batch.insert(self.key.clone(), padded);
        Ok(batch)
    }
}
