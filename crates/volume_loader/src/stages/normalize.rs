use crate::array::ArrayKey;
use crate::batch::Batch;
use crate::error::Result;
use crate::pipeline::{BatchFilter, Prepared, Upstream};
use crate::provider_spec::ProviderSpec;
use crate::request::BatchRequest;

/// Affine intensity normalization: `x -> (x - offset) * factor`.
///
/// # Example
/// ```ignore
/// // uint8 intensities to [0, 1]
/// let normalize = Normalize::new("raw", 1.0 / 255.0);
/// // zero-centered
/// let normalize = Normalize::new("raw", 1.0 / 127.5).with_offset(127.5);
/// ```
#[derive(Debug, Clone)]
pub struct Normalize {
    key: ArrayKey,
    factor: f32,
    offset: f32,
}

impl Normalize {
    pub fn new(key: impl Into<ArrayKey>, factor: f32) -> Self {
        Self {
            key: key.into(),
            factor,
            offset: 0.0,
        }
    }

    pub fn with_offset(mut self, offset: f32) -> Self {
        self.offset = offset;
        self
    }
}

impl BatchFilter for Normalize {
    type Context = ();

    fn setup(&mut self, upstream: &ProviderSpec) -> Result<ProviderSpec> {
        upstream.require(&self.key, "Normalize")?;
        Ok(upstream.clone())
    }

    fn prepare(&self, request: &BatchRequest, _upstream: Upstream<'_>) -> Result<Prepared<()>> {
        Ok(Prepared::passthrough(request))
    }

    fn process(&self, mut batch: Batch, _: &BatchRequest, _: Prepared<()>) -> Result<Batch> {
        if let Some(array) = batch.arrays.get_mut(&self.key) {
            let (offset, factor) = (self.offset, self.factor);
            array.data.mapv_inplace(|x| (x - offset) * factor);
        }
        Ok(batch)
    }
}
