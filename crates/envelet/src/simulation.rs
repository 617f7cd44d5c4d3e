//! External simulation runner.
//!
//! The simulation is an opaque batch command. It receives its input path
//! through an environment variable, writes its artifact where
//! `SIM_OUTPUT_PATH` points and may touch `SIM_DONE_PATH` once the artifact
//! is flushed. Output is streamed into the log line by line while the command
//! runs. There is no timeout and no retry.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use crate::artifact::ArtifactPaths;
use crate::error::PipelineError;
use crate::registry::RunId;

pub const DEFAULT_INPUT_ENV: &str = "SIM_INPUT_PATH";
pub const OUTPUT_PATH_ENV: &str = "SIM_OUTPUT_PATH";
pub const DONE_PATH_ENV: &str = "SIM_DONE_PATH";
pub const RUN_ID_ENV: &str = "SIM_RUN_ID";

/// stderr lines kept for the failure reason.
const STDERR_TAIL_LINES: usize = 20;

/// One simulation invocation.
#[derive(Debug, Clone)]
pub struct SimulationJob {
    pub run_id: RunId,
    pub input_path: PathBuf,
    pub artifact: ArtifactPaths,
}

/// Seam between the pipeline and whatever produces the artifact.
///
/// Lets the pipeline be exercised without a real simulation executable.
#[async_trait]
pub trait Simulator: Send + Sync {
    /// Run to completion. `Err` only as `PipelineError::SimulationFailed`.
    async fn run(&self, job: &SimulationJob) -> Result<(), PipelineError>;
}

#[derive(Debug, Clone)]
pub struct SimulationCommand {
    /// Full command line, run through the platform shell.
    pub command_line: String,
    pub working_dir: PathBuf,
    /// Name of the variable carrying the input path.
    pub input_env: String,
}

impl Default for SimulationCommand {
    fn default() -> Self {
        Self {
            command_line: r#"matlab -batch "run('matlabSimulation.m')""#.to_string(),
            working_dir: PathBuf::from("."),
            input_env: DEFAULT_INPUT_ENV.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("{0} not captured")]
    Pipe(&'static str),
}

#[cfg(not(windows))]
fn shell(command_line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(command_line);
    command
}

#[cfg(windows)]
fn shell(command_line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(command_line);
    command
}

/// Runs the simulation as a child process.
pub struct ProcessSimulator {
    command: SimulationCommand,
}

impl ProcessSimulator {
    pub fn new(command: SimulationCommand) -> Self {
        Self { command }
    }

    fn spawn(&self, job: &SimulationJob) -> Result<Child, SpawnError> {
        let child = shell(&self.command.command_line)
            .current_dir(&self.command.working_dir)
            .env(&self.command.input_env, &job.input_path)
            .env(OUTPUT_PATH_ENV, &job.artifact.artifact)
            .env(DONE_PATH_ENV, &job.artifact.marker)
            .env(RUN_ID_ENV, job.run_id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        Ok(child)
    }

    fn describe_failure(&self, status: ExitStatus, stderr_tail: &VecDeque<String>) -> String {
        let mut reason = format!("`{}` exited with {}", self.command.command_line, status);
        if !stderr_tail.is_empty() {
            let tail: Vec<&str> = stderr_tail.iter().map(String::as_str).collect();
            reason.push_str("; stderr: ");
            reason.push_str(&tail.join("\n"));
        }
        reason
    }
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Re-emit each line of a child stream as a log event, keeping the last
/// `keep` lines.
async fn forward_lines<R>(
    stream: R,
    kind: OutputStream,
    run_id: RunId,
    keep: usize,
) -> VecDeque<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut tail = VecDeque::with_capacity(keep);

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\r', '\n']);
                match kind {
                    OutputStream::Stdout => {
                        tracing::info!(target: "envelet::simulation", run_id = %run_id, "{}", line)
                    }
                    OutputStream::Stderr => {
                        tracing::warn!(target: "envelet::simulation", run_id = %run_id, "{}", line)
                    }
                }
                if keep > 0 {
                    if tail.len() == keep {
                        tail.pop_front();
                    }
                    tail.push_back(line.to_string());
                }
            }
            Err(e) => {
                tracing::warn!(run_id = %run_id, ?kind, error = %e, "Failed to read simulation output");
                break;
            }
        }
    }

    tail
}

#[async_trait]
impl Simulator for ProcessSimulator {
    async fn run(&self, job: &SimulationJob) -> Result<(), PipelineError> {
        tracing::info!(
            run_id = %job.run_id,
            command = %self.command.command_line,
            input = %job.input_path.display(),
            "Spawning simulation"
        );

        let mut child = self.spawn(job).map_err(|e| {
            tracing::error!(run_id = %job.run_id, error = %e, "Simulation spawn failed");
            PipelineError::SimulationFailed(e.to_string())
        })?;

        let stdout = child.stdout.take().ok_or(SpawnError::Pipe("stdout"));
        let stderr = child.stderr.take().ok_or(SpawnError::Pipe("stderr"));
        let (stdout, stderr) = match (stdout, stderr) {
            (Ok(out), Ok(err)) => (out, err),
            (Err(e), _) | (_, Err(e)) => {
                let _ = child.start_kill();
                return Err(PipelineError::SimulationFailed(e.to_string()));
            }
        };

        let stdout_task = tokio::spawn(forward_lines(
            stdout,
            OutputStream::Stdout,
            job.run_id.clone(),
            0,
        ));
        let stderr_task = tokio::spawn(forward_lines(
            stderr,
            OutputStream::Stderr,
            job.run_id.clone(),
            STDERR_TAIL_LINES,
        ));

        let status = child.wait().await;

        let _ = stdout_task.await;
        let stderr_tail = stderr_task.await.unwrap_or_default();

        match status {
            Ok(status) if status.success() => {
                tracing::info!(run_id = %job.run_id, "Simulation exited successfully");
                Ok(())
            }
            Ok(status) => {
                let reason = self.describe_failure(status, &stderr_tail);
                tracing::error!(run_id = %job.run_id, %reason, "Simulation failed");
                Err(PipelineError::SimulationFailed(reason))
            }
            Err(e) => {
                tracing::error!(run_id = %job.run_id, error = %e, "Failed to wait for simulation");
                Err(PipelineError::SimulationFailed(format!(
                    "failed to wait for simulation: {e}"
                )))
            }
        }
    }
}
