//! One upload's trip through simulation, artifact polling, transformation and
//! prediction forwarding.
//!
//! A run ends in exactly one [`PipelineResult`]. Downstream trouble after the
//! artifact exists degrades to [`PipelineResult::PredictionUnavailable`]; the
//! artifact stays retrievable either way.

use std::sync::Arc;

use serde_json::Value;

use crate::artifact::{PollConfig, wait_for_artifact};
use crate::error::PipelineError;
use crate::forwarder::Forwarder;
use crate::registry::{RunCompletion, RunId, RunRegistry, RunStage};
use crate::segment::{SegmentFormat, read_segment_set};
use crate::simulation::{SimulationJob, Simulator};
use crate::storage::Storage;

pub const PREDICTION_UNREACHABLE: &str = "Could not reach prediction API";
pub const RESULTS_UNREADABLE: &str = "Could not read simulation results";

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineResult {
    SimulationFailed { reason: String },
    ArtifactMissing,
    PredictionUnavailable { result_url: String, warning: String },
    Success { result_url: String, prediction: Value },
}

impl PipelineResult {
    pub fn stage(&self) -> RunStage {
        match self {
            Self::SimulationFailed { .. } => RunStage::SimulationFailed,
            Self::ArtifactMissing => RunStage::ArtifactMissing,
            Self::PredictionUnavailable { .. } => RunStage::PredictionUnavailable,
            Self::Success { .. } => RunStage::Succeeded,
        }
    }

    pub fn result_url(&self) -> Option<&str> {
        match self {
            Self::PredictionUnavailable { result_url, .. } | Self::Success { result_url, .. } => {
                Some(result_url)
            }
            _ => None,
        }
    }
}

pub struct Pipeline {
    storage: Arc<Storage>,
    simulator: Arc<dyn Simulator>,
    forwarder: Arc<Forwarder>,
    registry: Arc<RunRegistry>,
    poll: PollConfig,
    format: SegmentFormat,
}

impl Pipeline {
    pub fn new(
        storage: Arc<Storage>,
        simulator: Arc<dyn Simulator>,
        forwarder: Arc<Forwarder>,
        registry: Arc<RunRegistry>,
        poll: PollConfig,
        format: SegmentFormat,
    ) -> Self {
        Self {
            storage,
            simulator,
            forwarder,
            registry,
            poll,
            format,
        }
    }

    /// Drive a registered run whose input is already staged.
    pub async fn run(&self, run_id: &RunId) -> PipelineResult {
        let result = self.execute(run_id).await;

        let artifact = result
            .result_url()
            .map(|_| self.storage.artifact_paths(run_id).artifact);
        let error = match &result {
            PipelineResult::SimulationFailed { reason } => Some(reason.clone()),
            PipelineResult::ArtifactMissing => Some("no output file was generated".to_string()),
            PipelineResult::PredictionUnavailable { warning, .. } => Some(warning.clone()),
            PipelineResult::Success { .. } => None,
        };
        self.registry.complete(
            run_id,
            result.stage(),
            RunCompletion {
                result_url: result.result_url().map(str::to_string),
                error,
                artifact,
            },
        );

        tracing::info!(run_id = %run_id, stage = ?result.stage(), "Run finished");
        result
    }

    async fn execute(&self, run_id: &RunId) -> PipelineResult {
        let job = SimulationJob {
            run_id: run_id.clone(),
            input_path: self.storage.input_path(run_id),
            artifact: self.storage.artifact_paths(run_id),
        };

        self.registry.advance(run_id, RunStage::Running);
        if let Err(e) = self.simulator.run(&job).await {
            let reason = match e {
                PipelineError::SimulationFailed(reason) => reason,
                other => other.to_string(),
            };
            return PipelineResult::SimulationFailed { reason };
        }

        self.registry.advance(run_id, RunStage::WaitingArtifact);
        if wait_for_artifact(&job.artifact, &self.poll).await.is_err() {
            return PipelineResult::ArtifactMissing;
        }

        let result_url = self.storage.result_url(run_id);

        self.registry.advance(run_id, RunStage::Transforming);
        let segments = match read_segment_set(&job.artifact.artifact, self.format).await {
            Ok(segments) => segments,
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "Failed to transform artifact");
                return PipelineResult::PredictionUnavailable {
                    result_url,
                    warning: RESULTS_UNREADABLE.to_string(),
                };
            }
        };
        tracing::info!(run_id = %run_id, segments = segments.len(), "Artifact transformed");

        self.registry.advance(run_id, RunStage::Forwarding);
        match self.forwarder.predict(&segments).await {
            Ok(prediction) => PipelineResult::Success {
                result_url,
                prediction,
            },
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "Prediction service unavailable");
                PipelineResult::PredictionUnavailable {
                    result_url,
                    warning: PREDICTION_UNREACHABLE.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{StubSimulator, TestHarness};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn staged(harness: &TestHarness) -> RunId {
        let run = RunId::new();
        harness.storage.prepare_run(&run).await.unwrap();
        tokio::fs::write(harness.storage.input_path(&run), "ObjectName\nWall A\n")
            .await
            .unwrap();
        harness.registry.register(run.clone());
        run
    }

    #[tokio::test]
    async fn success_forwards_transformed_segments() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predict"))
            .and(body_partial_json(json!({
                "segments": [{"label": "North Wall", "material": "brick", "temp": 21.5}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"risk": "low"})))
            .expect(1)
            .mount(&server)
            .await;

        let harness = TestHarness::new(&server.uri(), StubSimulator::succeeding()).await;
        let run = staged(&harness).await;

        let result = harness.pipeline().run(&run).await;

        let PipelineResult::Success {
            result_url,
            prediction,
        } = result
        else {
            panic!("expected success, got {result:?}");
        };
        assert_eq!(prediction, json!({"risk": "low"}));
        assert_eq!(result_url, harness.storage.result_url(&run));

        let snapshot = harness.registry.get(&run).unwrap();
        assert_eq!(snapshot.stage, RunStage::Succeeded);
        assert_eq!(snapshot.result_url.as_deref(), Some(result_url.as_str()));
        assert_eq!(
            harness.registry.latest_artifact(),
            Some(harness.storage.artifact_paths(&run).artifact)
        );
    }

    #[tokio::test]
    async fn downstream_error_degrades_to_warning() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predict"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let harness = TestHarness::new(&server.uri(), StubSimulator::succeeding()).await;
        let run = staged(&harness).await;

        let result = harness.pipeline().run(&run).await;

        assert_eq!(
            result,
            PipelineResult::PredictionUnavailable {
                result_url: harness.storage.result_url(&run),
                warning: PREDICTION_UNREACHABLE.to_string(),
            }
        );
        assert!(harness.storage.artifact_paths(&run).artifact.exists());
        assert_eq!(
            harness.registry.get(&run).unwrap().stage,
            RunStage::PredictionUnavailable
        );
    }

    #[tokio::test]
    async fn simulation_failure_skips_downstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let harness =
            TestHarness::new(&server.uri(), StubSimulator::failing("exit status: 1")).await;
        let run = staged(&harness).await;

        let result = harness.pipeline().run(&run).await;

        assert_eq!(
            result,
            PipelineResult::SimulationFailed {
                reason: "exit status: 1".to_string()
            }
        );
        let snapshot = harness.registry.get(&run).unwrap();
        assert_eq!(snapshot.stage, RunStage::SimulationFailed);
        assert!(snapshot.result_url.is_none());
        assert!(harness.registry.latest_artifact().is_none());
    }

    #[tokio::test]
    async fn silent_simulation_is_artifact_missing() {
        let server = MockServer::start().await;
        let harness = TestHarness::new(&server.uri(), StubSimulator::silent()).await;
        let run = staged(&harness).await;

        let result = harness.pipeline().run(&run).await;

        assert_eq!(result, PipelineResult::ArtifactMissing);
        assert_eq!(
            harness.registry.get(&run).unwrap().stage,
            RunStage::ArtifactMissing
        );
    }

    #[tokio::test]
    async fn unreadable_artifact_keeps_result_url() {
        let server = MockServer::start().await;
        let harness = TestHarness::new(
            &server.uri(),
            StubSimulator::writing(b"\xff\xfeArea\n12\n".to_vec()),
        )
        .await;
        let run = staged(&harness).await;

        let result = harness.pipeline().run(&run).await;

        assert_eq!(
            result,
            PipelineResult::PredictionUnavailable {
                result_url: harness.storage.result_url(&run),
                warning: RESULTS_UNREADABLE.to_string(),
            }
        );
    }

    #[tokio::test]
    async fn runs_do_not_share_artifacts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predict"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let harness = TestHarness::new(&server.uri(), StubSimulator::succeeding()).await;
        let pipeline = harness.pipeline();
        let a = staged(&harness).await;
        let b = staged(&harness).await;

        let (ra, rb) = tokio::join!(pipeline.run(&a), pipeline.run(&b));

        assert_ne!(ra.result_url(), rb.result_url());
        assert_eq!(harness.simulator.invocations(), 2);
    }
}
