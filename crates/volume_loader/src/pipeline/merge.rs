use tracing::debug_span;

use super::Node;
use crate::batch::Batch;
use crate::error::{PipelineError, Result};
use crate::provider_spec::ProviderSpec;
use crate::request::BatchRequest;

/// Joins several subtrees providing disjoint sets of keys.
///
/// A request is split by key, each part is sent to the subtree declaring those
/// keys, and the resulting batches are merged. Subtrees are queried one after
/// another on the calling thread.
pub struct MergeNode {
    upstreams: Vec<Box<dyn Node>>,
    spec: ProviderSpec,
}

impl MergeNode {
    pub fn new(upstreams: Vec<Box<dyn Node>>) -> Result<Self> {
        if upstreams.len() < 2 {
            return Err(PipelineError::build(format!(
                "merging needs at least two upstreams, got {}",
                upstreams.len()
            )));
        }

        let mut spec = ProviderSpec::new();
        for upstream in &upstreams {
            for (key, array_spec) in upstream.spec().iter() {
                if spec.insert(key.clone(), array_spec.clone()).is_some() {
                    return Err(PipelineError::build(format!(
                        "{} is provided by more than one merged upstream",
                        key
                    )));
                }
            }
        }

        Ok(Self { upstreams, spec })
    }
}

impl Node for MergeNode {
    fn name(&self) -> &str {
        "Merge"
    }

    fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    fn request_batch(&self, request: &BatchRequest) -> Result<Batch> {
        let span = debug_span!("merge", request = %request.id());
        let _guard = span.enter();

        let mut batch = Batch::for_request(request);
        for upstream in &self.upstreams {
            let part = request.subset(upstream.spec().keys());
            if part.is_empty() {
                continue;
            }
            batch.merge(upstream.request_batch(&part)?);
        }
        Ok(batch)
    }

    fn teardown(&mut self) {
        for upstream in &mut self.upstreams {
            upstream.teardown();
        }
    }
}
