//! Staging and artifact directories.
//!
//! Both directories are created once at startup and live for the process
//! lifetime. Each run gets its own subdirectory in both, named by its
//! [`RunId`].

use std::path::{Component, Path, PathBuf};

use crate::artifact::ArtifactPaths;
use crate::registry::RunId;

pub const INPUT_FILE_NAME: &str = "simulation_input.csv";
pub const DEFAULT_ARTIFACT_NAME: &str = "simulation_results.csv";

/// URL prefix the artifact directory is served under.
pub const RESULTS_ROUTE: &str = "/results";

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub uploads_dir: PathBuf,
    pub results_dir: PathBuf,
    pub artifact_name: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            uploads_dir: PathBuf::from("uploads"),
            results_dir: PathBuf::from("results"),
            artifact_name: DEFAULT_ARTIFACT_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Storage {
    uploads_dir: PathBuf,
    results_dir: PathBuf,
    artifact_name: String,
}

impl Storage {
    /// Create both directories and resolve them to absolute paths, so the
    /// simulator can be handed paths regardless of its working directory.
    pub async fn provision(config: &StorageConfig) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&config.uploads_dir).await?;
        tokio::fs::create_dir_all(&config.results_dir).await?;

        let storage = Self {
            uploads_dir: tokio::fs::canonicalize(&config.uploads_dir).await?,
            results_dir: tokio::fs::canonicalize(&config.results_dir).await?,
            artifact_name: config.artifact_name.clone(),
        };

        tracing::info!(
            uploads = %storage.uploads_dir.display(),
            results = %storage.results_dir.display(),
            "Storage provisioned"
        );
        Ok(storage)
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads_dir
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    pub fn input_path(&self, run: &RunId) -> PathBuf {
        self.uploads_dir.join(run.as_str()).join(INPUT_FILE_NAME)
    }

    pub fn artifact_paths(&self, run: &RunId) -> ArtifactPaths {
        ArtifactPaths::new(self.results_dir.join(run.as_str()).join(&self.artifact_name))
    }

    /// Create the run's staging and artifact subdirectories.
    pub async fn prepare_run(&self, run: &RunId) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.uploads_dir.join(run.as_str())).await?;
        tokio::fs::create_dir_all(self.results_dir.join(run.as_str())).await?;
        Ok(())
    }

    /// Remove everything stored for a run that never started.
    pub async fn discard_run(&self, run: &RunId) -> std::io::Result<()> {
        for dir in [&self.uploads_dir, &self.results_dir] {
            match tokio::fs::remove_dir_all(dir.join(run.as_str())).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }

    /// Public URL of a run's artifact.
    pub fn result_url(&self, run: &RunId) -> String {
        format!("{RESULTS_ROUTE}/{}/{}", run, self.artifact_name)
    }

    /// Map a path below the results route to a file in the artifact
    /// directory. Anything but plain components is rejected.
    pub fn resolve_result(&self, relative: &str) -> Option<PathBuf> {
        let relative = Path::new(relative);
        let mut resolved = self.results_dir.clone();
        let mut depth = 0;
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                _ => return None,
            }
        }
        (depth > 0).then_some(resolved)
    }
}
