//! Shared fixtures for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::artifact::PollConfig;
use crate::error::PipelineError;
use crate::forwarder::{Forwarder, ForwarderConfig};
use crate::pipeline::Pipeline;
use crate::registry::RunRegistry;
use crate::segment::SegmentFormat;
use crate::service::{BodyLimits, PipelineService};
use crate::simulation::{SimulationJob, Simulator};
use crate::storage::{DEFAULT_ARTIFACT_NAME, Storage, StorageConfig};

pub const SAMPLE_ARTIFACT: &str = "\
ObjectName,Material_type,FinalWallTemperature_C,Humidity,Area
North Wall,BRICK,21.5,40,12.25
,Concrete,n/a,55,3
";

enum Behaviour {
    Write(Vec<u8>),
    Delayed(Duration, Vec<u8>),
    Fail(String),
    Silent,
}

/// Simulator that writes a fixed artifact instead of running anything.
pub struct StubSimulator {
    behaviour: Behaviour,
    invocations: AtomicUsize,
}

impl StubSimulator {
    pub fn succeeding() -> Arc<Self> {
        Self::writing(SAMPLE_ARTIFACT.as_bytes().to_vec())
    }

    pub fn writing(contents: Vec<u8>) -> Arc<Self> {
        Self::with(Behaviour::Write(contents))
    }

    /// Writes the sample artifact after `delay`.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Self::with(Behaviour::Delayed(delay, SAMPLE_ARTIFACT.as_bytes().to_vec()))
    }

    pub fn failing(reason: &str) -> Arc<Self> {
        Self::with(Behaviour::Fail(reason.to_string()))
    }

    /// Exits cleanly without producing an artifact.
    pub fn silent() -> Arc<Self> {
        Self::with(Behaviour::Silent)
    }

    fn with(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            invocations: AtomicUsize::new(0),
        })
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Simulator for StubSimulator {
    async fn run(&self, job: &SimulationJob) -> Result<(), PipelineError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        assert!(job.input_path.exists(), "input not staged before simulation");
        match &self.behaviour {
            Behaviour::Write(contents) => {
                tokio::fs::write(&job.artifact.artifact, contents)
                    .await
                    .map_err(|e| PipelineError::SimulationFailed(e.to_string()))?;
                Ok(())
            }
            Behaviour::Delayed(delay, contents) => {
                tokio::time::sleep(*delay).await;
                tokio::fs::write(&job.artifact.artifact, contents)
                    .await
                    .map_err(|e| PipelineError::SimulationFailed(e.to_string()))?;
                Ok(())
            }
            Behaviour::Fail(reason) => Err(PipelineError::SimulationFailed(reason.clone())),
            Behaviour::Silent => Ok(()),
        }
    }
}

pub fn fast_poll() -> PollConfig {
    PollConfig {
        initial_delay: Duration::ZERO,
        max_attempts: 3,
        backoff_base: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        require_marker: false,
    }
}

/// Storage in a temp dir, a stub simulator and a forwarder aimed at a mock
/// server.
pub struct TestHarness {
    _dir: tempfile::TempDir,
    pub storage: Arc<Storage>,
    pub registry: Arc<RunRegistry>,
    pub forwarder: Arc<Forwarder>,
    pub simulator: Arc<StubSimulator>,
}

impl TestHarness {
    pub async fn new(downstream: &str, simulator: Arc<StubSimulator>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::provision(&StorageConfig {
            uploads_dir: dir.path().join("uploads"),
            results_dir: dir.path().join("results"),
            artifact_name: DEFAULT_ARTIFACT_NAME.to_string(),
        })
        .await
        .unwrap();
        let forwarder = Forwarder::new(ForwarderConfig {
            timeout: Duration::from_secs(5),
            ..ForwarderConfig::with_base_url(downstream)
        })
        .unwrap();

        Self {
            _dir: dir,
            storage: Arc::new(storage),
            registry: RunRegistry::new(),
            forwarder: Arc::new(forwarder),
            simulator,
        }
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(
            Arc::clone(&self.storage),
            self.simulator.clone(),
            Arc::clone(&self.forwarder),
            Arc::clone(&self.registry),
            fast_poll(),
            SegmentFormat::Segments,
        )
    }

    pub fn service(&self) -> Arc<PipelineService> {
        Arc::new(PipelineService::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.registry),
            self.pipeline(),
            Arc::clone(&self.forwarder),
            SegmentFormat::Segments,
            BodyLimits::default(),
        ))
    }
}
