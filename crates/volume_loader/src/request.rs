use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::array::ArrayKey;
use crate::roi::Roi;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id of one request/response round, used to correlate log
/// lines across stages and workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a consumer (or a downstream stage) asks for: a ROI per array key,
/// plus the seed every random decision for this round is derived from.
///
/// # Example
/// ```ignore
/// let request = BatchRequest::new()
///     .with_array("raw", Roi::new([0, 0], [20, 20]))
///     .with_seed(42);
/// ```
#[derive(Clone, Debug)]
pub struct BatchRequest {
    pub arrays: BTreeMap<ArrayKey, Roi>,
    pub random_seed: u64,
    id: RequestId,
}

impl Default for BatchRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchRequest {
    /// Creates an empty request with a random seed.
    pub fn new() -> Self {
        Self {
            arrays: BTreeMap::new(),
            random_seed: rand::random(),
            id: RequestId::next(),
        }
    }

    pub fn with_array(mut self, key: impl Into<ArrayKey>, roi: Roi) -> Self {
        self.arrays.insert(key.into(), roi);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn get(&self, key: &ArrayKey) -> Option<&Roi> {
        self.arrays.get(key)
    }

    pub fn insert(&mut self, key: ArrayKey, roi: Roi) -> Option<Roi> {
        self.arrays.insert(key, roi)
    }

    pub fn remove(&mut self, key: &ArrayKey) -> Option<Roi> {
        self.arrays.remove(key)
    }

    pub fn contains(&self, key: &ArrayKey) -> bool {
        self.arrays.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &ArrayKey> {
        self.arrays.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ArrayKey, &Roi)> {
        self.arrays.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    /// Bounding box of all requested ROIs, or `None` for an empty request.
    pub fn total_roi(&self) -> Option<Roi> {
        self.arrays.values().cloned().reduce(|a, b| a.union(&b))
    }

    /// Two requests have the same identity when they ask for the same ROIs,
    /// regardless of seed and id.
    pub fn same_identity(&self, other: &BatchRequest) -> bool {
        self.arrays == other.arrays
    }

    /// Request for a subset of keys, sharing seed and id.
    pub fn subset<'a>(&self, keys: impl IntoIterator<Item = &'a ArrayKey>) -> BatchRequest {
        let arrays = keys
            .into_iter()
            .filter_map(|k| self.arrays.get(k).map(|roi| (k.clone(), roi.clone())))
            .collect();
        Self {
            arrays,
            random_seed: self.random_seed,
            id: self.id,
        }
    }

    /// Copy of this request with a different seed and a fresh id.
    pub fn reseeded(&self, seed: u64) -> BatchRequest {
        Self {
            arrays: self.arrays.clone(),
            random_seed: seed,
            id: RequestId::next(),
        }
    }

    /// Deterministic RNG for one stage, derived from the request seed.
    ///
    /// Mixing in `salt` keeps stages sharing a request from drawing the same
    /// sequence.
    pub fn rng(&self, salt: u64) -> StdRng {
        StdRng::seed_from_u64(self.random_seed ^ salt.wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }
}

impl fmt::Display for BatchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request {} {{", self.id)?;
        for (i, (key, roi)) in self.arrays.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, " {}: {}", key, roi)?;
        }
        write!(f, " }}")
    }
}
