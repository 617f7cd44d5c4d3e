//! envelet: runs building-envelope simulations on uploaded CSV files and
//! forwards the results to prediction and recommendation services.

pub mod artifact;
pub mod config;
mod error;
pub mod forwarder;
mod health;
pub mod pipeline;
pub mod registry;
pub mod segment;
pub mod service;
pub mod simulation;
pub mod storage;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::PipelineError;
pub use forwarder::{ForwardError, Forwarder, ForwarderConfig};
pub use health::{ENVELET_VERSION, HealthSnapshot, ServiceStatus};
pub use pipeline::{Pipeline, PipelineResult};
pub use registry::{RegistryConfig, RunId, RunRegistry, RunSnapshot, RunStage};
pub use segment::{SegmentFormat, SegmentRecord, SegmentSet, TransformError};
pub use service::{BodyLimits, PipelineService, RecommendationInput, StagedInput};
pub use simulation::{ProcessSimulator, SimulationCommand, SimulationJob, Simulator};
pub use transport::{ServerConfig, serve};
