//! Augmentations and the stage adapter running them.
//!
//! An [`Augmentation`] answers two questions: how much context it needs
//! around a requested ROI (`enlarge_request`), and how to turn the enlarged
//! upstream array into the augmented one (`transform`). [`Augment`] wires
//! both into the pipeline and crops the result back.

use anyhow::ensure;
use rand::rngs::StdRng;
use rand::Rng;

use crate::array::{Array, ArrayKey};
use crate::batch::Batch;
use crate::coordinate::Coordinate;
use crate::error::{PipelineError, Result};
use crate::pipeline::{BatchFilter, Prepared, Upstream};
use crate::provider_spec::ProviderSpec;
use crate::request::BatchRequest;
use crate::roi::{Roi, SnapMode};

/// A random transformation of arrays.
///
/// Every key of one request is transformed with an RNG seeded identically,
/// so augmentations drawing their parameters first apply the same transform
/// to e.g. raw data and labels.
pub trait Augmentation: Send + Sync + 'static {
    fn name(&self) -> &str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }

    /// Keys this augmentation applies to. Empty means every requested key.
    fn keys(&self) -> Vec<ArrayKey> {
        Vec::new()
    }

    /// Upstream ROI needed to produce `roi` of `key`. Must contain `roi`.
    fn enlarge_request(&self, key: &ArrayKey, roi: &Roi) -> Roi;

    /// Transforms the upstream `array` (covering at least the enlarged ROI)
    /// into one covering `requested_roi`. Extra context is cropped away.
    fn transform(
        &self,
        array: Array,
        requested_roi: &Roi,
        rng: &mut StdRng,
    ) -> anyhow::Result<Array>;
}

/// Stage applying an [`Augmentation`].
pub struct Augment<A: Augmentation> {
    augmentation: A,
    keys: Vec<ArrayKey>,
    salt: u64,
    upstream: ProviderSpec,
    name: String,
}

impl<A: Augmentation> Augment<A> {
    pub fn new(augmentation: A) -> Self {
        let name = augmentation.name().to_string();
        Self {
            keys: augmentation.keys(),
            augmentation,
            salt: 0xA06_3E47,
            upstream: ProviderSpec::new(),
            name,
        }
    }

    pub fn with_salt(mut self, salt: u64) -> Self {
        self.salt = salt;
        self
    }

    fn applies_to(&self, key: &ArrayKey) -> bool {
        self.keys.is_empty() || self.keys.contains(key)
    }

    /// Provided ROI once the context the augmentation consumes is taken off.
    fn declared_roi(
        &self,
        key: &ArrayKey,
        provided: &Roi,
        voxel_size: &Coordinate,
    ) -> Result<Roi> {
        let enlarged = self.augmentation.enlarge_request(key, provided);
        if !enlarged.contains(provided) {
            return Err(PipelineError::build(format!(
                "{} enlarges {} of {} to {}, which does not contain it",
                self.name, provided, key, enlarged
            )));
        }

        let before = provided.begin() - enlarged.begin();
        let after = &enlarged.end() - &provided.end();
        let remaining = &(provided.shape() - &before) - &after;
        if !remaining.all_positive() {
            return Err(PipelineError::build(format!(
                "{} needs more context than {} of {} provides",
                self.name, provided, key
            )));
        }

        Ok(provided
            .shrink(&before, &after)
            .snap_to_grid(voxel_size, SnapMode::Shrink))
    }
}

impl<A: Augmentation> BatchFilter for Augment<A> {
    type Context = ();

    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&mut self, upstream: &ProviderSpec) -> Result<ProviderSpec> {
        for key in &self.keys {
            upstream.require(key, &self.name)?;
        }

        let mut provides = upstream.clone();
        for (key, spec) in provides.iter_mut() {
            if !self.applies_to(key) {
                continue;
            }
            if let Some(provided) = spec.roi.clone() {
                let declared = self.declared_roi(key, &provided, &spec.voxel_size)?;
                spec.roi = Some(declared);
            }
        }

        self.upstream = upstream.clone();
        Ok(provides)
    }

    fn prepare(&self, request: &BatchRequest, _upstream: Upstream<'_>) -> Result<Prepared<()>> {
        let mut upstream_request = request.clone();

        for (key, roi) in request.iter() {
            if !self.applies_to(key) {
                continue;
            }
            let enlarged = self.augmentation.enlarge_request(key, roi);
            if !enlarged.contains(roi) {
                return Err(PipelineError::unsatisfiable(format!(
                    "{} enlarged {} of {} to {}, which does not contain it",
                    self.name, roi, key, enlarged
                )));
            }

            let voxel_size = &self.upstream.require(key, &self.name)?.voxel_size;
            upstream_request.insert(
                key.clone(),
                enlarged.snap_to_grid(voxel_size, SnapMode::Grow),
            );
        }
        Ok(Prepared::new(upstream_request, ()))
    }

    fn process(&self, mut batch: Batch, request: &BatchRequest, _: Prepared<()>) -> Result<Batch> {
        for (key, requested) in request.iter() {
            if !self.applies_to(key) {
                continue;
            }
            let array = batch.remove(key).ok_or_else(|| {
                PipelineError::stage(
                    self.name.clone(),
                    anyhow::anyhow!("upstream did not provide {}", key),
                )
            })?;

            let mut rng = request.rng(self.salt);
            let transformed = self
                .augmentation
                .transform(array, requested, &mut rng)
                .map_err(|e| PipelineError::stage(self.name.clone(), e))?;
            batch.insert(key.clone(), transformed);
        }
        Ok(batch)
    }
}

/// Requests a fixed margin of context around every ROI and returns the data
/// unchanged, e.g. to make room for valid convolutions.
#[derive(Debug, Clone)]
pub struct ContextPadding {
    margin: Coordinate,
    keys: Vec<ArrayKey>,
}

impl ContextPadding {
    pub fn new(margin: impl Into<Coordinate>) -> Self {
        Self {
            margin: margin.into(),
            keys: Vec::new(),
        }
    }

    pub fn with_keys(mut self, keys: impl IntoIterator<Item = impl Into<ArrayKey>>) -> Self {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }
}

impl Augmentation for ContextPadding {
    fn keys(&self) -> Vec<ArrayKey> {
        self.keys.clone()
    }

    fn enlarge_request(&self, _key: &ArrayKey, roi: &Roi) -> Roi {
        roi.grow(&self.margin, &self.margin)
    }

    fn transform(&self, array: Array, _: &Roi, _: &mut StdRng) -> anyhow::Result<Array> {
        Ok(array)
    }
}

/// Random intensity change `x -> x * scale + shift`, with `scale` and `shift`
/// drawn uniformly per request.
#[derive(Debug, Clone)]
pub struct IntensityAugment {
    key: ArrayKey,
    scale: (f32, f32),
    shift: (f32, f32),
    clip: Option<(f32, f32)>,
}

impl IntensityAugment {
    pub fn new(
        key: impl Into<ArrayKey>,
        scale: (f32, f32),
        shift: (f32, f32),
    ) -> anyhow::Result<Self> {
        for (name, (lo, hi)) in [("scale", scale), ("shift", shift)] {
            ensure!(
                lo.is_finite() && hi.is_finite() && lo <= hi,
                "{} range must be finite and ordered, got ({}, {})",
                name,
                lo,
                hi
            );
        }
        Ok(Self {
            key: key.into(),
            scale,
            shift,
            clip: None,
        })
    }

    /// Clamps the result to `[min, max]`.
    pub fn with_clip(mut self, min: f32, max: f32) -> Self {
        self.clip = Some((min, max));
        self
    }
}

impl Augmentation for IntensityAugment {
    fn keys(&self) -> Vec<ArrayKey> {
        vec![self.key.clone()]
    }

    fn enlarge_request(&self, _key: &ArrayKey, roi: &Roi) -> Roi {
        roi.clone()
    }

    fn transform(
        &self,
        mut array: Array,
        _requested_roi: &Roi,
        rng: &mut StdRng,
    ) -> anyhow::Result<Array> {
        let scale = rng.random_range(self.scale.0..=self.scale.1);
        let shift = rng.random_range(self.shift.0..=self.shift.1);

        match self.clip {
            Some((min, max)) => array
                .data
                .mapv_inplace(|x| (x * scale + shift).clamp(min, max)),
            None => array.data.mapv_inplace(|x| x * scale + shift),
        }
        Ok(array)
    }
}
