//! PipelineService: transport-agnostic entry point.
//!
//! Owns storage, the run registry, the pipeline and the downstream forwarder.
//! Transports stage uploads and ask for recommendations through this service
//! and only translate its results into wire responses.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::config::Config;
use crate::error::PipelineError;
use crate::forwarder::Forwarder;
use crate::health::HealthSnapshot;
use crate::pipeline::{Pipeline, PipelineResult};
use crate::registry::{RunId, RunRegistry, RunSnapshot};
use crate::segment::{SegmentFormat, SegmentRecord, SegmentSet, read_segment_set};
use crate::simulation::ProcessSimulator;
use crate::storage::Storage;

/// Request body limits, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyLimits {
    pub json: usize,
    pub upload: usize,
}

impl Default for BodyLimits {
    fn default() -> Self {
        Self {
            json: 10 * 1024 * 1024,
            upload: 256 * 1024 * 1024,
        }
    }
}

/// An upload being written to a fresh run's staging directory.
///
/// Finish with [`PipelineService::commit_input`] or
/// [`PipelineService::discard_input`]; the run is not registered before
/// that.
pub struct StagedInput {
    run_id: RunId,
    file: tokio::fs::File,
    bytes: u64,
}

impl StagedInput {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), PipelineError> {
        self.file.write_all(chunk).await?;
        self.bytes += chunk.len() as u64;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RecommendationInput {
    pub image_base64: String,
    pub timestamp: Option<String>,
    pub run_id: Option<RunId>,
}

pub struct PipelineService {
    storage: Arc<Storage>,
    registry: Arc<RunRegistry>,
    pipeline: Pipeline,
    forwarder: Arc<Forwarder>,
    format: SegmentFormat,
    limits: BodyLimits,
}

impl PipelineService {
    pub fn new(
        storage: Arc<Storage>,
        registry: Arc<RunRegistry>,
        pipeline: Pipeline,
        forwarder: Arc<Forwarder>,
        format: SegmentFormat,
        limits: BodyLimits,
    ) -> Self {
        Self {
            storage,
            registry,
            pipeline,
            forwarder,
            format,
            limits,
        }
    }

    /// Wire up the production components.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let storage = Arc::new(Storage::provision(&config.storage).await?);
        let registry = RunRegistry::with_config(config.registry);
        let forwarder = Arc::new(Forwarder::new(config.forwarder.clone())?);
        let simulator = Arc::new(ProcessSimulator::new(config.simulation.clone()));

        tracing::info!(
            command = %config.simulation.command_line,
            predict_url = %config.forwarder.predict_url,
            recommend_url = %config.forwarder.recommend_url,
            format = ?config.format,
            "Pipeline configured"
        );

        let pipeline = Pipeline::new(
            Arc::clone(&storage),
            simulator,
            Arc::clone(&forwarder),
            Arc::clone(&registry),
            config.poll.clone(),
            config.format,
        );

        Ok(Self::new(
            storage,
            registry,
            pipeline,
            forwarder,
            config.format,
            config.limits,
        ))
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn limits(&self) -> BodyLimits {
        self.limits
    }

    /// Create a fresh run's directories and open its input file.
    pub async fn open_input(&self) -> Result<StagedInput, PipelineError> {
        let run_id = RunId::new();
        self.storage.prepare_run(&run_id).await?;

        let input_path = self.storage.input_path(&run_id);
        let file = tokio::fs::File::create(&input_path).await.map_err(|e| {
            tracing::error!(run_id = %run_id, path = %input_path.display(), error = %e, "Failed to create input file");
            e
        })?;

        Ok(StagedInput {
            run_id,
            file,
            bytes: 0,
        })
    }

    /// Flush a staged upload and register its run.
    pub async fn commit_input(&self, mut staged: StagedInput) -> Result<RunId, PipelineError> {
        if let Err(e) = staged.file.flush().await {
            tracing::error!(run_id = %staged.run_id, error = %e, "Failed to flush input");
            self.discard_input(staged).await;
            return Err(e.into());
        }

        let StagedInput { run_id, bytes, .. } = staged;
        self.registry.register(run_id.clone());
        tracing::info!(run_id = %run_id, bytes, "Input staged");
        Ok(run_id)
    }

    /// Drop a staged upload that will not be run.
    pub async fn discard_input(&self, staged: StagedInput) {
        let StagedInput { run_id, file, .. } = staged;
        drop(file);
        if let Err(e) = self.storage.discard_run(&run_id).await {
            tracing::warn!(run_id = %run_id, error = %e, "Failed to remove discarded upload");
        }
    }

    /// Persist an in-memory upload under a fresh run and register the run.
    pub async fn stage_input(&self, contents: &[u8]) -> Result<RunId, PipelineError> {
        let mut staged = self.open_input().await?;
        if let Err(e) = staged.write(contents).await {
            self.discard_input(staged).await;
            return Err(e);
        }
        self.commit_input(staged).await
    }

    pub async fn execute(&self, run_id: &RunId) -> PipelineResult {
        self.pipeline.run(run_id).await
    }

    /// Forward an image plus the best available segments to the
    /// recommendation service.
    pub async fn recommend(&self, input: RecommendationInput) -> Result<Value, PipelineError> {
        if input.image_base64.is_empty() {
            return Err(PipelineError::MissingInput);
        }

        let segments = self.recommendation_segments(input.run_id.as_ref()).await?;
        tracing::info!(
            run_id = ?input.run_id.as_ref().map(RunId::as_str),
            timestamp = ?input.timestamp,
            segments = segments.len(),
            image_bytes = input.image_base64.len(),
            "Requesting recommendation"
        );

        self.forwarder
            .recommend(&segments, &input.image_base64)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Recommendation service failed");
                PipelineError::from(e)
            })
    }

    async fn recommendation_segments(
        &self,
        run_id: Option<&RunId>,
    ) -> Result<SegmentSet, PipelineError> {
        match self.recommendation_artifact(run_id) {
            Some(artifact) => Ok(read_segment_set(artifact, self.format).await?),
            None => {
                tracing::warn!("No simulation results available, using placeholder segment");
                Ok(SegmentSet::Typed(vec![SegmentRecord::placeholder()]))
            }
        }
    }

    fn recommendation_artifact(&self, run_id: Option<&RunId>) -> Option<PathBuf> {
        let artifact = match run_id {
            Some(id) => self.registry.artifact(id).or_else(|| {
                tracing::warn!(run_id = %id, "Run has no artifact, falling back to latest");
                self.registry.latest_artifact()
            }),
            None => self.registry.latest_artifact(),
        };
        artifact.filter(|path| path.is_file())
    }

    pub fn run_snapshot(&self, run_id: &RunId) -> Option<RunSnapshot> {
        self.registry.get(run_id)
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot::now(self.registry.active_count())
    }
}
