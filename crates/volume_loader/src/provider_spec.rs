use std::collections::BTreeMap;

use crate::array::{ArrayKey, ArraySpec};
use crate::error::{PipelineError, Result};
use crate::request::BatchRequest;

/// The arrays a node declares it can provide, fixed at build time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProviderSpec {
    arrays: BTreeMap<ArrayKey, ArraySpec>,
}

impl ProviderSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_array(mut self, key: impl Into<ArrayKey>, spec: ArraySpec) -> Self {
        self.arrays.insert(key.into(), spec);
        self
    }

    pub fn insert(&mut self, key: ArrayKey, spec: ArraySpec) -> Option<ArraySpec> {
        self.arrays.insert(key, spec)
    }

    pub fn remove(&mut self, key: &ArrayKey) -> Option<ArraySpec> {
        self.arrays.remove(key)
    }

    pub fn get(&self, key: &ArrayKey) -> Option<&ArraySpec> {
        self.arrays.get(key)
    }

    pub fn get_mut(&mut self, key: &ArrayKey) -> Option<&mut ArraySpec> {
        self.arrays.get_mut(key)
    }

    pub fn contains(&self, key: &ArrayKey) -> bool {
        self.arrays.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &ArrayKey> {
        self.arrays.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ArrayKey, &ArraySpec)> {
        self.arrays.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ArrayKey, &mut ArraySpec)> {
        self.arrays.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    /// Build-time lookup: a stage depending on `key` fails construction when
    /// nothing upstream provides it.
    pub fn require(&self, key: &ArrayKey, stage: &str) -> Result<&ArraySpec> {
        self.arrays.get(key).ok_or_else(|| {
            PipelineError::build(format!(
                "{} needs {} but upstream only provides [{}]",
                stage,
                key,
                self.key_list()
            ))
        })
    }

    /// Checks a request against this spec before it is propagated: every key
    /// must be provided, ROIs must sit on the voxel grid and inside bounded
    /// ROIs.
    pub fn validate(&self, request: &BatchRequest) -> Result<()> {
        for (key, roi) in request.iter() {
            let spec = self
                .arrays
                .get(key)
                .ok_or_else(|| PipelineError::UnknownKey { key: key.clone() })?;

            if roi.dims() != spec.dims() {
                return Err(PipelineError::unsatisfiable(format!(
                    "{} is {}-dimensional but {} was requested",
                    key,
                    spec.dims(),
                    roi
                )));
            }
            if !roi.is_aligned(&spec.voxel_size) {
                return Err(PipelineError::unsatisfiable(format!(
                    "requested {} for {} is not aligned to voxel size {}",
                    roi, key, spec.voxel_size
                )));
            }
            if let Some(provided) = &spec.roi {
                if !provided.contains(roi) {
                    return Err(PipelineError::OutOfBounds {
                        key: key.clone(),
                        requested: roi.clone(),
                        provided: provided.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn key_list(&self) -> String {
        self.arrays
            .keys()
            .map(ArrayKey::name)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl FromIterator<(ArrayKey, ArraySpec)> for ProviderSpec {
    fn from_iter<I: IntoIterator<Item = (ArrayKey, ArraySpec)>>(iter: I) -> Self {
        Self {
            arrays: iter.into_iter().collect(),
        }
    }
}
