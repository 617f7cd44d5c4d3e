//! Completion polling for the simulation artifact.
//!
//! A simulator exiting does not mean its output is on disk yet. After the exit
//! the poller waits `initial_delay`, then observes the artifact with
//! exponential backoff until it is complete or attempts run out:
//! - with `require_marker`, complete means the `.done` marker exists next to
//!   an existing artifact
//! - otherwise, complete means the artifact size did not change between two
//!   consecutive observations

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::PipelineError;

const MARKER_SUFFIX: &str = ".done";

/// Where a run's simulator writes its output and completion marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub artifact: PathBuf,
    pub marker: PathBuf,
}

impl ArtifactPaths {
    pub fn new(artifact: PathBuf) -> Self {
        let mut marker = artifact.clone().into_os_string();
        marker.push(MARKER_SUFFIX);
        Self {
            artifact,
            marker: PathBuf::from(marker),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub initial_delay: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
    pub require_marker: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_attempts: 8,
            backoff_base: Duration::from_millis(250),
            max_backoff: Duration::from_secs(4),
            require_marker: false,
        }
    }
}

impl PollConfig {
    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(1 << attempt.min(10))
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observation {
    Absent,
    Present { len: u64 },
    Marked,
}

async fn file_len(path: &Path) -> Option<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Some(meta.len()),
        _ => None,
    }
}

async fn observe(paths: &ArtifactPaths, require_marker: bool) -> Observation {
    let Some(len) = file_len(&paths.artifact).await else {
        return Observation::Absent;
    };
    if require_marker && file_len(&paths.marker).await.is_some() {
        return Observation::Marked;
    }
    Observation::Present { len }
}

/// Wait until the artifact is completely written.
///
/// Resolves `ArtifactMissing` instead of erroring out when the artifact never
/// shows up (or, with `require_marker`, is never marked complete).
pub async fn wait_for_artifact(
    paths: &ArtifactPaths,
    config: &PollConfig,
) -> Result<(), PipelineError> {
    tokio::time::sleep(config.initial_delay).await;

    let attempts = config.max_attempts.max(1);
    let mut previous_len = None;
    let mut last = Observation::Absent;

    for attempt in 0..attempts {
        last = observe(paths, config.require_marker).await;
        match last {
            Observation::Marked => return Ok(()),
            Observation::Present { len } if !config.require_marker => {
                if previous_len == Some(len) {
                    return Ok(());
                }
                previous_len = Some(len);
            }
            _ => previous_len = None,
        }

        if attempt + 1 < attempts {
            let backoff = config.backoff(attempt);
            tracing::debug!(
                artifact = %paths.artifact.display(),
                attempt,
                backoff_ms = backoff.as_millis(),
                "Artifact not ready, retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    if !config.require_marker && matches!(last, Observation::Present { .. }) {
        tracing::warn!(
            artifact = %paths.artifact.display(),
            "Artifact still changing after final attempt, using it as is"
        );
        return Ok(());
    }

    tracing::warn!(
        artifact = %paths.artifact.display(),
        attempts,
        require_marker = config.require_marker,
        "Artifact not found after polling"
    );
    Err(PipelineError::ArtifactMissing(paths.artifact.clone()))
}
