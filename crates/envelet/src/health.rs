//! Health status reported by the service.

use serde::Serialize;

/// envelet version from Cargo.toml
pub const ENVELET_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    #[default]
    Running,
}

/// Snapshot of service health for transports to report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: ServiceStatus,
    /// Current time (RFC 3339).
    pub timestamp: String,
    pub version: &'static str,
    /// Runs registered and not yet terminal.
    pub active_runs: usize,
}

impl HealthSnapshot {
    pub fn now(active_runs: usize) -> Self {
        Self {
            status: ServiceStatus::Running,
            timestamp: chrono::Utc::now().to_rfc3339(),
            version: ENVELET_VERSION,
            active_runs,
        }
    }
}
