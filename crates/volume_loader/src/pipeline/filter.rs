//! The stage contract and its adapter into the pipeline tree.
//!
//! A [`BatchFilter`] sees one request/response round as two calls:
//!
//! ```text
//!   downstream request ──prepare──▶ upstream request ──▶ (upstream subtree)
//!   downstream batch   ◀─process─── upstream batch   ◀──
//! ```
//!
//! Whatever `prepare` needs to remember for `process` is returned as the
//! filter's `Context` inside [`Prepared`]. The adapter keeps it on the stack of
//! the current call, so one filter instance can serve any number of concurrent
//! rounds (e.g. from several prefetch workers) without shared mutable state.

use tracing::{debug, debug_span};

use super::Node;
use crate::batch::Batch;
use crate::error::{PipelineError, Result};
use crate::provider_spec::ProviderSpec;
use crate::request::BatchRequest;

/// Output of [`BatchFilter::prepare`]: the request to send upstream plus the
/// per-call context handed back to [`BatchFilter::process`].
#[derive(Debug)]
pub struct Prepared<C> {
    pub request: BatchRequest,
    pub context: C,
}

impl<C> Prepared<C> {
    pub fn new(request: BatchRequest, context: C) -> Self {
        Self { request, context }
    }
}

impl Prepared<()> {
    /// Forwards `request` upstream unchanged.
    pub fn passthrough(request: &BatchRequest) -> Self {
        Self::new(request.clone(), ())
    }
}

/// Read-only view of the subtree a filter depends on.
///
/// Besides the declared spec, filters may issue additional trial requests
/// while preparing (the random-location sampler does this to validate
/// candidate locations).
#[derive(Clone, Copy)]
pub struct Upstream<'a> {
    node: &'a dyn Node,
}

impl<'a> Upstream<'a> {
    pub fn new(node: &'a dyn Node) -> Self {
        Self { node }
    }

    pub fn spec(&self) -> &'a ProviderSpec {
        self.node.spec()
    }

    pub fn request_batch(&self, request: &BatchRequest) -> Result<Batch> {
        self.node.request_batch(request)
    }
}

/// A stage with exactly one upstream.
///
/// Implementations must be `Send + Sync`: below a prefetch cache the same
/// instance is driven by several worker threads at once.
pub trait BatchFilter: Send + Sync + 'static {
    /// Per-call state remembered between `prepare` and `process`.
    type Context: Send;

    fn name(&self) -> &str {
        let full = std::any::type_name::<Self>();
        let base = full.split('<').next().unwrap_or(full);
        base.rsplit("::").next().unwrap_or(base)
    }

    /// Build-time hook: validates the upstream spec and declares what this
    /// stage provides downstream. Errors here abort pipeline construction.
    fn setup(&mut self, upstream: &ProviderSpec) -> Result<ProviderSpec>;

    /// Computes the upstream request for `request`.
    fn prepare(
        &self,
        request: &BatchRequest,
        upstream: Upstream<'_>,
    ) -> Result<Prepared<Self::Context>>;

    /// Turns the upstream batch into the batch for `request`. The result may
    /// cover more than requested; the adapter crops it.
    fn process(
        &self,
        batch: Batch,
        request: &BatchRequest,
        prepared: Prepared<Self::Context>,
    ) -> Result<Batch>;

    fn teardown(&mut self) {}
}

/// Tree node running a [`BatchFilter`] on top of its upstream node.
pub struct FilterNode<F: BatchFilter> {
    filter: F,
    upstream: Box<dyn Node>,
    spec: ProviderSpec,
    name: String,
}

impl<F: BatchFilter> FilterNode<F> {
    pub fn new(mut filter: F, upstream: Box<dyn Node>) -> Result<Self> {
        let name = filter.name().to_string();
        let spec = filter.setup(upstream.spec()).map_err(|e| match e {
            PipelineError::Build(msg) => PipelineError::Build(format!("{}: {}", name, msg)),
            other => other,
        })?;
        debug!(stage = %name, arrays = spec.len(), "filter set up");

        Ok(Self {
            filter,
            upstream,
            spec,
            name,
        })
    }
}

impl<F: BatchFilter> Node for FilterNode<F> {
    fn name(&self) -> &str {
        &self.name
    }

    fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    fn request_batch(&self, request: &BatchRequest) -> Result<Batch> {
        let span = debug_span!("filter", stage = %self.name, request = %request.id());
        let _guard = span.enter();

        let prepared = self
            .filter
            .prepare(request, Upstream::new(&*self.upstream))?;
        debug!(upstream_request = %prepared.request, "prepared");

        let upstream_batch = self.upstream.request_batch(&prepared.request)?;
        let batch = self.filter.process(upstream_batch, request, prepared)?;

        let uncovered = batch.uncovered(request);
        if let Some((key, roi)) = uncovered.first() {
            return Err(PipelineError::stage(
                self.name.clone(),
                anyhow::anyhow!(
                    "processed batch does not cover requested {} for {}",
                    roi,
                    key
                ),
            ));
        }

        batch
            .crop_to(request)
            .map_err(|e| PipelineError::stage(self.name.clone(), e))
    }

    fn teardown(&mut self) {
        self.filter.teardown();
        self.upstream.teardown();
    }
}
