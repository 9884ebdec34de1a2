pub mod array;
pub mod batch;
pub mod coordinate;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod prefetch;
pub mod provider_spec;
pub mod request;
pub mod roi;
pub mod sampler;
pub mod stages;

pub use array::{Array, ArrayKey, ArraySpec};
pub use batch::Batch;
pub use coordinate::Coordinate;
pub use error::{ErrorKind, PipelineError, Result};
pub use pipeline::{
    ArraySource, BatchFilter, InMemorySource, Node, Pipeline, PipelineBuilder, Prepared, Upstream,
};
pub use prefetch::{PrefetchCache, PrefetchConfig};
pub use provider_spec::ProviderSpec;
pub use request::{BatchRequest, RequestId};
pub use roi::{Roi, SnapMode};
pub use sampler::RandomLocation;
