use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;

use crate::array::{Array, ArrayKey};
use crate::request::{BatchRequest, RequestId};
use crate::roi::Roi;

/// The result of one request/response round: realized arrays keyed by
/// [`ArrayKey`], each covering (at least) the ROI requested for it.
///
/// Batches are moved from stage to stage by value; no two stages ever hold the
/// same batch.
#[derive(Clone, Debug)]
pub struct Batch {
    pub arrays: BTreeMap<ArrayKey, Array>,
    /// World ROIs actually read for each key, recorded by samplers that moved
    /// the request before sending it upstream.
    pub source_rois: BTreeMap<ArrayKey, Roi>,
    request_id: Option<RequestId>,
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

impl Batch {
    pub fn new() -> Self {
        Self {
            arrays: BTreeMap::new(),
            source_rois: BTreeMap::new(),
            request_id: None,
        }
    }

    pub fn for_request(request: &BatchRequest) -> Self {
        Self {
            request_id: Some(request.id()),
            ..Self::new()
        }
    }

    /// Id of the request this batch answers, if known.
    pub fn request_id(&self) -> Option<RequestId> {
        self.request_id
    }

    pub fn with_array(mut self, key: impl Into<ArrayKey>, array: Array) -> Self {
        self.arrays.insert(key.into(), array);
        self
    }

    pub fn insert(&mut self, key: ArrayKey, array: Array) -> Option<Array> {
        self.arrays.insert(key, array)
    }

    pub fn remove(&mut self, key: &ArrayKey) -> Option<Array> {
        self.arrays.remove(key)
    }

    pub fn get(&self, key: &ArrayKey) -> Result<&Array> {
        self.arrays
            .get(key)
            .ok_or_else(|| anyhow!("Array {} not found in batch", key))
    }

    pub fn get_mut(&mut self, key: &ArrayKey) -> Result<&mut Array> {
        self.arrays
            .get_mut(key)
            .ok_or_else(|| anyhow!("Array {} not found in batch", key))
    }

    pub fn contains(&self, key: &ArrayKey) -> bool {
        self.arrays.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &ArrayKey> {
        self.arrays.keys()
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    /// World ROI a sampler read for `key`, if the request was moved.
    pub fn source_roi(&self, key: &ArrayKey) -> Option<&Roi> {
        self.source_rois.get(key)
    }

    /// Moves arrays and recorded source ROIs of `other` into this batch.
    pub fn merge(&mut self, other: Batch) {
        self.arrays.extend(other.arrays);
        self.source_rois.extend(other.source_rois);
    }

    /// Keys of `request` this batch is missing or does not fully cover.
    pub fn uncovered<'a>(&self, request: &'a BatchRequest) -> Vec<(&'a ArrayKey, &'a Roi)> {
        request
            .iter()
            .filter(|(key, roi)| {
                self.arrays
                    .get(*key)
                    .map_or(true, |array| !array.roi().contains(roi))
            })
            .collect()
    }

    /// Reduces the batch to exactly `request`: unrequested arrays are dropped
    /// and requested ones are cropped to their requested ROI.
    pub fn crop_to(mut self, request: &BatchRequest) -> Result<Batch> {
        let mut arrays = BTreeMap::new();
        for (key, roi) in request.iter() {
            let array = self
                .arrays
                .remove(key)
                .ok_or_else(|| anyhow!("Array {} requested but not provided", key))?;
            let array = if array.roi() == roi {
                array
            } else {
                array
                    .crop(roi)
                    .with_context(|| format!("Failed to crop {} to the requested ROI", key))?
            };
            arrays.insert(key.clone(), array);
        }
        self.source_rois.retain(|key, _| request.contains(key));

        Ok(Batch {
            arrays,
            source_rois: self.source_rois,
            request_id: Some(request.id()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn array(roi: Roi) -> Array {
        Array::filled(1.0, &[], roi, [1, 1]).unwrap()
    }

    #[test]
    fn crop_to_drops_and_crops() -> Result<()> {
        let batch = Batch::new()
            .with_array("raw", array(Roi::new([0, 0], [10, 10])))
            .with_array("extra", array(Roi::new([0, 0], [2, 2])));
        let request = BatchRequest::new().with_array("raw", Roi::new([2, 2], [4, 4]));

        let cropped = batch.crop_to(&request)?;
        assert_eq!(cropped.len(), 1);
        assert_eq!(cropped.get(&"raw".into())?.voxel_shape(), vec![4, 4]);
        assert_eq!(cropped.request_id(), Some(request.id()));
        Ok(())
    }

    #[test]
    fn uncovered_lists_missing_and_short_arrays() {
        let batch = Batch::new().with_array("raw", array(Roi::new([0, 0], [4, 4])));
        let request = BatchRequest::new()
            .with_array("raw", Roi::new([0, 0], [8, 8]))
            .with_array("labels", Roi::new([0, 0], [4, 4]));

        let missing: Vec<_> = batch.uncovered(&request).into_iter().map(|(k, _)| k.name()).collect();
        assert_eq!(missing, vec!["labels", "raw"]);
    }
}
