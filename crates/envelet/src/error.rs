//! Pipeline error taxonomy.

use std::path::PathBuf;

use crate::forwarder::ForwardError;
use crate::segment::TransformError;

/// Failure of one pipeline run or recommendation request.
///
/// Every variant carries a machine-readable [`reason`](PipelineError::reason)
/// that transports put in their error bodies.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("No file uploaded")]
    MissingInput,
    #[error("simulation failed: {0}")]
    SimulationFailed(String),
    #[error("simulation completed but no output file was generated at {}", .0.display())]
    ArtifactMissing(PathBuf),
    #[error(transparent)]
    TransformFailed(#[from] TransformError),
    #[error(transparent)]
    ForwardingFailed(#[from] ForwardError),
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl PipelineError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingInput => "missing_input",
            Self::SimulationFailed(_) => "simulation_failed",
            Self::ArtifactMissing(_) => "artifact_missing",
            Self::TransformFailed(_) => "transform_failed",
            Self::ForwardingFailed(_) => "forwarding_failed",
            Self::Storage(_) => "storage_failed",
        }
    }
}
