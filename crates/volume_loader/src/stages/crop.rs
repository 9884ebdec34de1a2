use crate::array::ArrayKey;
use crate::batch::Batch;
use crate::error::{PipelineError, Result};
use crate::pipeline::{BatchFilter, Prepared, Upstream};
use crate::provider_spec::ProviderSpec;
use crate::request::BatchRequest;
use crate::roi::Roi;

/// Restricts the declared ROI of one key, e.g. to hold out a validation
/// region from a random-location sampler further down.
#[derive(Debug, Clone)]
pub struct Crop {
    key: ArrayKey,
    roi: Roi,
}

impl Crop {
    pub fn new(key: impl Into<ArrayKey>, roi: Roi) -> Self {
        Self {
            key: key.into(),
            roi,
        }
    }
}

impl BatchFilter for Crop {
    type Context = ();

    fn setup(&mut self, upstream: &ProviderSpec) -> Result<ProviderSpec> {
        let spec = upstream.require(&self.key, "Crop")?;
        if !self.roi.is_aligned(&spec.voxel_size) {
            return Err(PipelineError::build(format!(
                "crop ROI {} is not aligned to voxel size {} of {}",
                self.roi, spec.voxel_size, self.key
            )));
        }

        let cropped = match &spec.roi {
            Some(provided) => provided.intersect(&self.roi).ok_or_else(|| {
                PipelineError::build(format!(
                    "crop ROI {} does not overlap {} of {}",
                    self.roi, provided, self.key
                ))
            })?,
            None => self.roi.clone(),
        };

        let mut provides = upstream.clone();
        if let Some(spec) = provides.get_mut(&self.key) {
            spec.roi = Some(cropped);
        }
        Ok(provides)
    }

    fn prepare(&self, request: &BatchRequest, _upstream: Upstream<'_>) -> Result<Prepared<()>> {
        Ok(Prepared::passthrough(request))
    }

    fn process(&self, batch: Batch, _: &BatchRequest, _: Prepared<()>) -> Result<Batch> {
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Array;
    use crate::error::ErrorKind;
    use crate::pipeline::{InMemorySource, PipelineBuilder};

    fn source() -> InMemorySource {
        let raw = Array::filled(1.0, &[], Roi::new([0, 0], [40, 40]), [2, 2]).unwrap();
        InMemorySource::new().with_array("raw", raw)
    }

    #[test]
    fn narrows_the_declared_roi() -> anyhow::Result<()> {
        let pipeline = PipelineBuilder::source(source())
            .then(Crop::new("raw", Roi::new([10, 10], [100, 100])))
            .build()?;

        let spec = pipeline.spec().get(&"raw".into()).cloned();
        assert_eq!(spec.and_then(|s| s.roi), Some(Roi::new([10, 10], [30, 30])));

        let outside = BatchRequest::new().with_array("raw", Roi::new([0, 0], [4, 4]));
        assert!(matches!(
            pipeline.request_batch(&outside),
            Err(PipelineError::OutOfBounds { .. })
        ));
        Ok(())
    }

    #[test]
    fn rejects_misaligned_and_disjoint_crops() {
        let misaligned = PipelineBuilder::source(source())
            .then(Crop::new("raw", Roi::new([1, 0], [10, 10])))
            .build();
        assert_eq!(misaligned.err().map(|e| e.kind()), Some(ErrorKind::Build));

        let disjoint = PipelineBuilder::source(source())
            .then(Crop::new("raw", Roi::new([100, 100], [10, 10])))
            .build();
        assert_eq!(disjoint.err().map(|e| e.kind()), Some(ErrorKind::Build));
    }
}
