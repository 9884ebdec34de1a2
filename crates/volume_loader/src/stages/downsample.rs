use anyhow::Context as _;
use ndarray::Slice;
use tracing::debug;

use crate::array::{Array, ArrayKey, ArraySpec};
use crate::batch::Batch;
use crate::coordinate::Coordinate;
use crate::error::{PipelineError, Result};
use crate::pipeline::{BatchFilter, Prepared, Upstream};
use crate::provider_spec::ProviderSpec;
use crate::request::BatchRequest;
use crate::roi::{Roi, SnapMode};

#[derive(Debug, Clone)]
struct Downsampling {
    input: ArrayKey,
    factor: Coordinate,
    output: ArrayKey,
}

/// Provides lower-resolution copies of arrays by taking every `f`-th voxel.
///
/// The output covers the same world ROI as the input on a coarser grid
/// (voxel size `v * f`). Requests for the output are served by requesting the
/// input over the same ROI, merged with any request for the input itself.
///
/// # Example
/// ```ignore
/// let downsample = DownSample::new()
///     .with_factor("raw", [2, 2, 2], "raw_s1")
///     .with_factor("raw", [4, 4, 4], "raw_s2");
/// ```
#[derive(Debug, Clone, Default)]
pub struct DownSample {
    downsamplings: Vec<Downsampling>,
}

impl DownSample {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `output` as `input` downsampled by `factor` (per axis).
    pub fn with_factor(
        mut self,
        input: impl Into<ArrayKey>,
        factor: impl Into<Coordinate>,
        output: impl Into<ArrayKey>,
    ) -> Self {
        self.downsamplings.push(Downsampling {
            input: input.into(),
            factor: factor.into(),
            output: output.into(),
        });
        self
    }
}

fn downsample(input: &Array, roi: &Roi, factor: &Coordinate) -> anyhow::Result<Array> {
    let region = input.crop(roi)?;
    let channels = region.channel_dims();
    let data = region
        .data
        .slice_each_axis(|axis| {
            let i = axis.axis.index();
            if i < channels {
                Slice::from(..)
            } else {
                Slice::new(0, None, factor[i - channels] as isize)
            }
        })
        .to_owned();

    Array::new(data, roi.clone(), input.voxel_size() * factor)
}

impl BatchFilter for DownSample {
    type Context = ();

    fn setup(&mut self, upstream: &ProviderSpec) -> Result<ProviderSpec> {
        if self.downsamplings.is_empty() {
            return Err(PipelineError::build("DownSample without any factor"));
        }

        let mut provides = upstream.clone();
        for Downsampling {
            input,
            factor,
            output,
        } in &self.downsamplings
        {
            let spec = upstream.require(input, "DownSample")?;
            if factor.dims() != spec.dims() || !factor.all_positive() {
                return Err(PipelineError::build(format!(
                    "downsampling factor {} for {} must be positive with {} dimensions",
                    factor,
                    input,
                    spec.dims()
                )));
            }

            let voxel_size = &spec.voxel_size * factor;
            let roi = match &spec.roi {
                Some(roi) => {
                    let snapped = roi.snap_to_grid(&voxel_size, SnapMode::Shrink);
                    if snapped.empty() {
                        return Err(PipelineError::build(format!(
                            "{} at {} is too small to downsample by {}",
                            input, roi, factor
                        )));
                    }
                    Some(snapped)
                }
                None => None,
            };

            let output_spec = ArraySpec {
                roi,
                voxel_size,
                interpolatable: spec.interpolatable,
            };
            if provides.insert(output.clone(), output_spec).is_some() {
                return Err(PipelineError::build(format!(
                    "downsampled output {} is already provided",
                    output
                )));
            }
        }
        Ok(provides)
    }

    fn prepare(&self, request: &BatchRequest, _upstream: Upstream<'_>) -> Result<Prepared<()>> {
        let mut upstream_request = request.clone();

        for Downsampling { input, output, .. } in &self.downsamplings {
            let Some(roi) = request.get(output) else {
                continue;
            };
            let needed = match upstream_request.get(input) {
                Some(existing) => existing.union(roi),
                None => roi.clone(),
            };
            debug!(%input, %output, %needed, "requesting input for downsampling");
            upstream_request.insert(input.clone(), needed);
            upstream_request.remove(output);
        }
        Ok(Prepared::new(upstream_request, ()))
    }

    fn process(&self, mut batch: Batch, request: &BatchRequest, _: Prepared<()>) -> Result<Batch> {
        for Downsampling {
            input,
            factor,
            output,
        } in &self.downsamplings
        {
            let Some(roi) = request.get(output) else {
                continue;
            };
            let downsampled = batch
                .get(input)
                .and_then(|array| downsample(array, roi, factor))
                .with_context(|| format!("Failed to downsample {} into {}", input, output))
                .map_err(|e| PipelineError::stage("DownSample", e))?;
            batch.insert(output.clone(), downsampled);
        }
        // The adapter crops the input back to what was requested of it.
        Ok(batch)
    }
}
