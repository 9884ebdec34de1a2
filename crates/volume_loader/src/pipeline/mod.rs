//! src/pipeline/mod.rs
//!
//! Composition of stages into an executable tree.
//!
//! # Architecture Overview
//!
//! ```text
//!      consumer ──request──▶ Pipeline (validates against root spec)
//!                               │
//!                               ▼
//!                        ┌──────────────┐
//!                        │ PrefetchCache│  (optional, worker pool)
//!                        └──────┬───────┘
//!                               │ prepare ▼   ▲ process
//!                        ┌──────────────┐
//!                        │  FilterNode  │  (Normalize, Augment, ...)
//!                        └──────┬───────┘
//!                        ┌──────────────┐
//!                        │RandomLocation│  (moves the request)
//!                        └──────┬───────┘
//!                        ┌──────────────┐
//!                        │  MergeNode   │  (splits by key)
//!                        └──┬────────┬──┘
//!                     SourceNode  SourceNode
//! ```
//!
//! Requests descend depth-first, each stage rewriting (usually enlarging)
//! them; batches ascend along the same path, each stage post-processing and
//! cropping back to what its caller asked for. A failure anywhere aborts the
//! whole round; no partial batch is returned.
//!
//! # Module Structure
//!
//! ```text
//! src/pipeline/
//! ├── mod.rs      # Node trait, Pipeline handle, PipelineBuilder
//! ├── filter.rs   # BatchFilter contract and FilterNode adapter
//! ├── source.rs   # ArraySource contract, SourceNode, InMemorySource
//! └── merge.rs    # MergeNode joining disjoint subtrees
//! ```
//!
//! # Example Usage
//!
//! ```ignore
//! let pipeline = PipelineBuilder::source(source)
//!     .then(RandomLocation::new())
//!     .then(Normalize::new("raw", 1.0 / 255.0))
//!     .prefetch(PrefetchConfig::builder().num_workers(4).capacity(8).build()?)
//!     .build()?;
//!
//! let request = BatchRequest::new().with_array("raw", Roi::new([0, 0], [64, 64]));
//! for batch in pipeline.batches(&request).take(1000) {
//!     let batch = batch?;
//!     // train on batch.get(&"raw".into())?.data
//! }
//! ```

mod filter;
mod merge;
mod source;

pub use filter::{BatchFilter, FilterNode, Prepared, Upstream};
pub use merge::MergeNode;
pub use source::{ArraySource, InMemorySource, SourceNode};

use tracing::{debug, debug_span, info};

use crate::batch::Batch;
use crate::error::{PipelineError, Result};
use crate::prefetch::{PrefetchCache, PrefetchConfig};
use crate::provider_spec::ProviderSpec;
use crate::request::BatchRequest;

/// An element of the pipeline tree.
///
/// Nodes are shared read-only between prefetch workers, hence `Send + Sync`
/// and `&self` for request handling. Any per-request state lives on the call
/// stack of `request_batch`.
pub trait Node: Send + Sync {
    fn name(&self) -> &str;

    /// Arrays this node provides, fixed at build time.
    fn spec(&self) -> &ProviderSpec;

    /// Runs one full request/response round through this node's subtree.
    fn request_batch(&self, request: &BatchRequest) -> Result<Batch>;

    /// Lifecycle hook, called once when the pipeline is torn down. Must
    /// propagate to upstream nodes.
    fn teardown(&mut self) {}
}

/// Composes stages into a [`Pipeline`].
///
/// Construction errors are recorded and reported by [`build`](Self::build),
/// so a chain can be written without intermediate `?`.
pub struct PipelineBuilder {
    root: Result<Box<dyn Node>>,
}

impl PipelineBuilder {
    /// Starts a chain at a source stage.
    pub fn source<S: ArraySource>(source: S) -> Self {
        Self {
            root: SourceNode::new(source).map(|node| Box::new(node) as Box<dyn Node>),
        }
    }

    /// Starts a chain at an arbitrary node.
    pub fn node(node: impl Node + 'static) -> Self {
        Self {
            root: Ok(Box::new(node)),
        }
    }

    /// Joins independently built chains providing disjoint keys.
    pub fn merge(branches: impl IntoIterator<Item = PipelineBuilder>) -> Self {
        let root = branches
            .into_iter()
            .map(|branch| branch.root)
            .collect::<Result<Vec<_>>>()
            .and_then(MergeNode::new)
            .map(|node| Box::new(node) as Box<dyn Node>);
        Self { root }
    }

    /// Adds `filter` downstream of the current chain.
    pub fn then<F: BatchFilter>(self, filter: F) -> Self {
        let root = self
            .root
            .and_then(|upstream| FilterNode::new(filter, upstream))
            .map(|node| Box::new(node) as Box<dyn Node>);
        Self { root }
    }

    /// Runs the current chain on a pool of background workers.
    pub fn prefetch(self, config: PrefetchConfig) -> Self {
        let root = self
            .root
            .and_then(|upstream| PrefetchCache::new(upstream, config))
            .map(|node| Box::new(node) as Box<dyn Node>);
        Self { root }
    }

    pub fn build(self) -> Result<Pipeline> {
        let root = self.root?;
        info!(root = root.name(), arrays = root.spec().len(), "pipeline built");
        Ok(Pipeline {
            root,
            torn_down: false,
        })
    }
}

/// Consumer handle of a built pipeline.
///
/// The tree is immutable after construction. `teardown` (or dropping the
/// handle) stops background workers and calls every stage's teardown hook.
pub struct Pipeline {
    root: Box<dyn Node>,
    torn_down: bool,
}

impl Pipeline {
    pub fn builder<S: ArraySource>(source: S) -> PipelineBuilder {
        PipelineBuilder::source(source)
    }

    pub fn spec(&self) -> &ProviderSpec {
        self.root.spec()
    }

    /// Checks keys, alignment and bounds of `request` without running it.
    pub fn validate_request(&self, request: &BatchRequest) -> Result<()> {
        self.root.spec().validate(request)
    }

    /// Runs one request/response round and returns a batch covering exactly
    /// the requested ROIs.
    pub fn request_batch(&self, request: &BatchRequest) -> Result<Batch> {
        if self.torn_down {
            return Err(PipelineError::Shutdown);
        }

        let span = debug_span!("request", request = %request.id());
        let _guard = span.enter();

        self.validate_request(request)?;
        debug!(%request, "requesting batch");

        let batch = self.root.request_batch(request)?;
        if let Some((key, roi)) = batch.uncovered(request).first() {
            return Err(PipelineError::stage(
                self.root.name().to_string(),
                anyhow::anyhow!("returned batch does not cover requested {} for {}", roi, key),
            ));
        }
        batch
            .crop_to(request)
            .map_err(|e| PipelineError::stage(self.root.name().to_string(), e))
    }

    /// Endless stream of batches for `request`, each round with a fresh seed
    /// derived from the request's seed.
    pub fn batches<'a>(&'a self, request: &BatchRequest) -> Batches<'a> {
        Batches {
            pipeline: self,
            template: request.clone(),
            round: 0,
        }
    }

    /// Stops workers and runs teardown hooks. Idempotent.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.root.teardown();
        info!("pipeline torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Iterator returned by [`Pipeline::batches`].
pub struct Batches<'a> {
    pipeline: &'a Pipeline,
    template: BatchRequest,
    round: u64,
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let seed = self
            .template
            .random_seed
            .wrapping_add(self.round.wrapping_mul(0x2545_F491_4F6C_DD1D));
        self.round += 1;
        Some(self.pipeline.request_batch(&self.template.reseeded(seed)))
    }
}
