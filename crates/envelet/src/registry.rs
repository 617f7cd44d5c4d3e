//! Run registry - keyed table of pipeline runs.
//!
//! Each upload gets its own [`RunId`]; stages only move forward and a run is
//! frozen once it reaches a terminal stage. Lock-free concurrent access via
//! DashMap. Only the most recent terminal runs are retained; runs still in
//! flight are never evicted.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use dashmap::DashMap;
use serde::Serialize;

const RUN_ID_PREFIX: &str = "run_";

pub const DEFAULT_RETAINED_RUNS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Terminal runs kept for lookup before the oldest is evicted.
    pub retained_runs: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            retained_runs: DEFAULT_RETAINED_RUNS,
        }
    }
}

/// Identity of one pipeline run. Safe to use as a path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new() -> Self {
        Self(format!("{RUN_ID_PREFIX}{}", uuid::Uuid::new_v4().simple()))
    }

    /// Accept only ids shaped like the ones [`RunId::new`] generates.
    pub fn parse(raw: &str) -> Option<Self> {
        let hex = raw.strip_prefix(RUN_ID_PREFIX)?;
        let valid = hex.len() == 32 && hex.bytes().all(|b| b.is_ascii_hexdigit());
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Received,
    Running,
    WaitingArtifact,
    Transforming,
    Forwarding,
    Succeeded,
    PredictionUnavailable,
    SimulationFailed,
    ArtifactMissing,
}

impl RunStage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded
                | Self::PredictionUnavailable
                | Self::SimulationFailed
                | Self::ArtifactMissing
        )
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Received => 0,
            Self::Running => 1,
            Self::WaitingArtifact => 2,
            Self::Transforming => 3,
            Self::Forwarding => 4,
            _ => 5,
        }
    }
}

/// Run state snapshot for API responses.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub id: RunId,
    pub stage: RunStage,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct RunEntry {
    snapshot: RunSnapshot,
    artifact: Option<PathBuf>,
}

/// Terminal details recorded by [`RunRegistry::complete`].
#[derive(Debug, Clone, Default)]
pub struct RunCompletion {
    pub result_url: Option<String>,
    pub error: Option<String>,
    pub artifact: Option<PathBuf>,
}

pub struct RunRegistry {
    runs: DashMap<RunId, RunEntry>,
    /// Terminal runs, oldest completion first.
    completed: StdMutex<VecDeque<RunId>>,
    latest_artifact: StdMutex<Option<PathBuf>>,
    retained_runs: usize,
}

impl RunRegistry {
    pub fn new() -> Arc<Self> {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            runs: DashMap::new(),
            completed: StdMutex::new(VecDeque::new()),
            latest_artifact: StdMutex::new(None),
            retained_runs: config.retained_runs.max(1),
        })
    }

    pub fn register(&self, id: RunId) {
        let snapshot = RunSnapshot {
            id: id.clone(),
            stage: RunStage::Received,
            started_at: chrono::Utc::now().to_rfc3339(),
            completed_at: None,
            result_url: None,
            error: None,
        };
        self.runs.insert(
            id,
            RunEntry {
                snapshot,
                artifact: None,
            },
        );
    }

    /// Move a run to a later stage. Backward moves and moves out of a
    /// terminal stage are ignored.
    pub fn advance(&self, id: &RunId, stage: RunStage) -> bool {
        let Some(mut entry) = self.runs.get_mut(id) else {
            tracing::warn!(run_id = %id, ?stage, "Stage update for unknown run");
            return false;
        };

        let current = entry.snapshot.stage;
        if current.is_terminal() || stage.rank() <= current.rank() {
            tracing::warn!(run_id = %id, ?current, ?stage, "Ignoring out-of-order stage update");
            return false;
        }

        entry.snapshot.stage = stage;
        if stage.is_terminal() {
            entry.snapshot.completed_at = Some(chrono::Utc::now().to_rfc3339());
        }
        tracing::debug!(run_id = %id, ?stage, "Run advanced");
        true
    }

    /// Record a terminal stage with its details.
    pub fn complete(&self, id: &RunId, stage: RunStage, completion: RunCompletion) {
        if !stage.is_terminal() || !self.advance(id, stage) {
            return;
        }

        if let Some(mut entry) = self.runs.get_mut(id) {
            entry.snapshot.result_url = completion.result_url;
            entry.snapshot.error = completion.error;
            entry.artifact = completion.artifact.clone();
        }

        if let Some(artifact) = completion.artifact {
            match self.latest_artifact.lock() {
                Ok(mut latest) => *latest = Some(artifact),
                Err(_) => tracing::error!("Latest artifact mutex poisoned"),
            }
        }

        self.retain(id);
    }

    /// Queue a newly terminal run and drop the oldest terminal runs past the
    /// retention bound.
    fn retain(&self, id: &RunId) {
        let evicted: Vec<RunId> = match self.completed.lock() {
            Ok(mut completed) => {
                completed.push_back(id.clone());
                let excess = completed.len().saturating_sub(self.retained_runs);
                completed.drain(..excess).collect()
            }
            Err(_) => {
                tracing::error!("Completed runs mutex poisoned");
                return;
            }
        };

        for old in evicted {
            self.runs.remove(&old);
            tracing::debug!(run_id = %old, "Evicted terminal run");
        }
    }

    pub fn get(&self, id: &RunId) -> Option<RunSnapshot> {
        self.runs.get(id).map(|e| e.snapshot.clone())
    }

    pub fn artifact(&self, id: &RunId) -> Option<PathBuf> {
        self.runs.get(id).and_then(|e| e.artifact.clone())
    }

    /// Artifact of the most recently completed run that produced one.
    pub fn latest_artifact(&self) -> Option<PathBuf> {
        self.latest_artifact
            .lock()
            .ok()
            .and_then(|latest| latest.clone())
    }

    pub fn active_count(&self) -> usize {
        self.runs
            .iter()
            .filter(|e| !e.snapshot.stage.is_terminal())
            .count()
    }

    pub fn exists(&self, id: &RunId) -> bool {
        self.runs.contains_key(id)
    }
}
