//! Leaf stages resolving requests against backing stores.

use anyhow::{anyhow, Context};
use ndarray::ArrayD;
use std::collections::BTreeMap;
use tracing::{debug, trace};

use super::Node;
use crate::array::{Array, ArrayKey, ArraySpec};
use crate::batch::Batch;
use crate::error::{PipelineError, Result};
use crate::provider_spec::ProviderSpec;
use crate::request::BatchRequest;
use crate::roi::Roi;

/// A backing store (HDF5, Zarr, N5, ... or memory) exposing arrays with a
/// declared ROI.
///
/// Implementations must be safe for concurrent reads: below a prefetch cache
/// several workers call `read` at the same time.
pub trait ArraySource: Send + Sync + 'static {
    fn name(&self) -> &str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }

    /// Declares every provided key with a bounded ROI and its voxel size.
    fn specs(&self) -> ProviderSpec;

    /// Reads `roi` of `key`. `roi` is always aligned to the declared voxel
    /// size and inside the declared ROI. The returned data must have
    /// `roi.shape / voxel_size` voxels along its trailing axes.
    fn read(&self, key: &ArrayKey, roi: &Roi) -> anyhow::Result<ArrayD<f32>>;

    fn teardown(&mut self) {}
}

/// Tree node wrapping an [`ArraySource`].
pub struct SourceNode<S: ArraySource> {
    source: S,
    spec: ProviderSpec,
    name: String,
}

impl<S: ArraySource> SourceNode<S> {
    /// Fails when the source declares an unbounded, misaligned or empty array.
    pub fn new(source: S) -> Result<Self> {
        let name = source.name().to_string();
        let spec = source.specs();

        if spec.is_empty() {
            return Err(PipelineError::build(format!("{} declares no arrays", name)));
        }
        for (key, array_spec) in spec.iter() {
            let roi = array_spec.roi.as_ref().ok_or_else(|| {
                PipelineError::build(format!("{} declares {} without a ROI", name, key))
            })?;
            if !array_spec.voxel_size.all_positive() {
                return Err(PipelineError::build(format!(
                    "{} declares {} with non-positive voxel size {}",
                    name, key, array_spec.voxel_size
                )));
            }
            if roi.dims() != array_spec.dims() || !roi.is_aligned(&array_spec.voxel_size) {
                return Err(PipelineError::build(format!(
                    "{} declares {} with ROI {} not aligned to voxel size {}",
                    name, key, roi, array_spec.voxel_size
                )));
            }
        }
        debug!(source = %name, arrays = spec.len(), "source set up");

        Ok(Self { source, spec, name })
    }

    fn read_array(&self, key: &ArrayKey, roi: &Roi) -> Result<Array> {
        let array_spec = self
            .spec
            .get(key)
            .ok_or_else(|| PipelineError::UnknownKey { key: key.clone() })?;
        let provided = array_spec
            .roi
            .as_ref()
            .ok_or_else(|| PipelineError::build(format!("{} lost the ROI of {}", self.name, key)))?;

        if !provided.contains(roi) {
            return Err(PipelineError::OutOfBounds {
                key: key.clone(),
                requested: roi.clone(),
                provided: provided.clone(),
            });
        }
        if !roi.is_aligned(&array_spec.voxel_size) {
            return Err(PipelineError::unsatisfiable(format!(
                "{} cannot read {} at {}: not aligned to voxel size {}",
                self.name, key, roi, array_spec.voxel_size
            )));
        }

        trace!(source = %self.name, %key, %roi, "reading");
        let data = self
            .source
            .read(key, roi)
            .map_err(|source| PipelineError::SourceIo {
                key: key.clone(),
                source,
            })?;

        Array::new(data, roi.clone(), array_spec.voxel_size.clone())
            .with_context(|| format!("{} returned data of the wrong shape", self.name))
            .map_err(|source| PipelineError::SourceIo {
                key: key.clone(),
                source,
            })
    }
}

impl<S: ArraySource> Node for SourceNode<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    fn request_batch(&self, request: &BatchRequest) -> Result<Batch> {
        let mut batch = Batch::for_request(request);
        for (key, roi) in request.iter() {
            let array = self.read_array(key, roi)?;
            batch.insert(key.clone(), array);
        }
        Ok(batch)
    }

    fn teardown(&mut self) {
        self.source.teardown();
    }
}

/// Source serving arrays held in memory.
///
/// # Example
/// ```ignore
/// let raw = Array::new(data, Roi::new([0, 0], [100, 100]), [1, 1])?;
/// let source = InMemorySource::new().with_array("raw", raw);
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemorySource {
    arrays: BTreeMap<ArrayKey, (Array, bool)>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an intensity-like array.
    pub fn with_array(mut self, key: impl Into<ArrayKey>, array: Array) -> Self {
        self.arrays.insert(key.into(), (array, true));
        self
    }

    /// Adds a label-like array that must not be interpolated.
    pub fn with_labels(mut self, key: impl Into<ArrayKey>, array: Array) -> Self {
        self.arrays.insert(key.into(), (array, false));
        self
    }
}

impl ArraySource for InMemorySource {
    fn specs(&self) -> ProviderSpec {
        self.arrays
            .iter()
            .map(|(key, (array, interpolatable))| {
                let spec: ArraySpec = array.spec().with_interpolatable(*interpolatable);
                (key.clone(), spec)
            })
            .collect()
    }

    fn read(&self, key: &ArrayKey, roi: &Roi) -> anyhow::Result<ArrayD<f32>> {
        let (array, _) = self
            .arrays
            .get(key)
            .ok_or_else(|| anyhow!("No array {} in memory", key))?;
        Ok(array.crop(roi)?.data)
    }
}
