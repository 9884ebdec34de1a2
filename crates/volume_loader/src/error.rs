//! Error taxonomy for pipeline construction and batch requests.
//!
//! Every failure surfaced to a consumer is a [`PipelineError`]. Stage and source
//! implementations are external collaborators and report `anyhow::Error`s, which
//! the pipeline wraps with the key or stage that produced them.

use std::time::Duration;

use crate::array::ArrayKey;
use crate::roi::Roi;

/// Coarse classification of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed pipeline or request, detected before any I/O happens.
    Build,
    /// The request cannot be served (ROI too small, sampling exhausted).
    RequestUnsatisfiable,
    /// A backing store or stage implementation failed.
    SourceIo,
    /// A prefetch worker failed while producing a buffered batch.
    WorkerFailure,
    /// The pipeline has been torn down or timed out waiting on workers.
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid pipeline: {0}")]
    Build(String),

    #[error("array {key} is not provided by this pipeline")]
    UnknownKey { key: ArrayKey },

    #[error("request cannot be satisfied: {0}")]
    Unsatisfiable(String),

    #[error("requested {requested} for {key} lies outside the provided {provided}")]
    OutOfBounds {
        key: ArrayKey,
        requested: Roi,
        provided: Roi,
    },

    #[error("reading {key} failed")]
    SourceIo {
        key: ArrayKey,
        #[source]
        source: anyhow::Error,
    },

    #[error("stage {stage} failed")]
    Stage {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("prefetch worker {worker} failed")]
    Worker {
        worker: usize,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("no batch became ready within {0:?}")]
    Timeout(Duration),

    #[error("pipeline has been torn down")]
    Shutdown,
}

impl PipelineError {
    pub(crate) fn build(msg: impl Into<String>) -> Self {
        Self::Build(msg.into())
    }

    pub(crate) fn unsatisfiable(msg: impl Into<String>) -> Self {
        Self::Unsatisfiable(msg.into())
    }

    pub(crate) fn stage(stage: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Stage {
            stage: stage.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Build(_) | Self::UnknownKey { .. } => ErrorKind::Build,
            Self::Unsatisfiable(_) | Self::OutOfBounds { .. } => ErrorKind::RequestUnsatisfiable,
            Self::SourceIo { .. } | Self::Stage { .. } => ErrorKind::SourceIo,
            Self::Worker { .. } => ErrorKind::WorkerFailure,
            Self::Timeout(_) | Self::Shutdown => ErrorKind::Shutdown,
        }
    }

    /// Returns the innermost error, looking through worker wrappers.
    pub fn root(&self) -> &PipelineError {
        match self {
            Self::Worker { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
