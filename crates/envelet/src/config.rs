//! Environment-driven configuration.
//!
//! Read once at startup. A variable that is set but does not parse falls back
//! to its default with a warning.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::artifact::PollConfig;
use crate::forwarder::ForwarderConfig;
use crate::registry::RegistryConfig;
use crate::segment::SegmentFormat;
use crate::service::BodyLimits;
use crate::simulation::SimulationCommand;
use crate::storage::StorageConfig;
use crate::transport::ServerConfig;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub simulation: SimulationCommand,
    pub poll: PollConfig,
    pub forwarder: ForwarderConfig,
    pub format: SegmentFormat,
    pub limits: BodyLimits,
    pub registry: RegistryConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let vars = Vars(&lookup);
        let defaults = Config::default();

        let server = ServerConfig {
            host: vars.string("HOST", defaults.server.host),
            port: vars.parsed("PORT", defaults.server.port),
        };

        let storage = StorageConfig {
            uploads_dir: vars.path("UPLOADS_DIR", defaults.storage.uploads_dir),
            results_dir: vars.path("RESULTS_DIR", defaults.storage.results_dir),
            artifact_name: vars.string("SIM_ARTIFACT_NAME", defaults.storage.artifact_name),
        };

        let simulation = SimulationCommand {
            command_line: vars.string("SIM_COMMAND", defaults.simulation.command_line),
            working_dir: vars.path("SIM_WORKDIR", defaults.simulation.working_dir),
            input_env: vars.string("SIM_INPUT_ENV", defaults.simulation.input_env),
        };

        let poll = PollConfig {
            initial_delay: vars.millis("SIM_POLL_INITIAL_DELAY_MS", defaults.poll.initial_delay),
            max_attempts: vars.parsed("SIM_POLL_ATTEMPTS", defaults.poll.max_attempts),
            backoff_base: vars.millis("SIM_POLL_BACKOFF_MS", defaults.poll.backoff_base),
            max_backoff: defaults.poll.max_backoff,
            require_marker: vars.flag("SIM_REQUIRE_MARKER", defaults.poll.require_marker),
        };

        let base = match lookup("PREDICTION_SERVICE_URL") {
            Some(url) if !url.trim().is_empty() => ForwarderConfig::with_base_url(url.trim()),
            _ => defaults.forwarder,
        };
        let forwarder = ForwarderConfig {
            predict_url: vars.string("PREDICT_URL", base.predict_url),
            recommend_url: vars.string("RECOMMEND_URL", base.recommend_url),
            timeout: Duration::from_secs(
                vars.parsed("DOWNSTREAM_TIMEOUT_SECS", base.timeout.as_secs()),
            ),
        };

        let limits = BodyLimits {
            json: vars.parsed("MAX_BODY_BYTES", defaults.limits.json),
            upload: vars.parsed("MAX_UPLOAD_BYTES", defaults.limits.upload),
        };

        let registry = RegistryConfig {
            retained_runs: vars.parsed("RETAINED_RUNS", defaults.registry.retained_runs),
        };

        Self {
            server,
            storage,
            simulation,
            poll,
            forwarder,
            format: vars.parsed("PREDICTION_FORMAT", defaults.format),
            limits,
            registry,
        }
    }
}

struct Vars<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: String) -> String {
        self.raw(key).unwrap_or(default)
    }

    fn path(&self, key: &str, default: PathBuf) -> PathBuf {
        self.raw(key).map(PathBuf::from).unwrap_or(default)
    }

    fn parsed<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.raw(key) {
            None => default,
            Some(value) => value.parse().unwrap_or_else(|e| {
                tracing::warn!(key, %value, error = %e, "Invalid configuration value, using default");
                default
            }),
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        Duration::from_millis(self.parsed(key, default.as_millis() as u64))
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        match self.raw(key).map(|v| v.to_ascii_lowercase()).as_deref() {
            None => default,
            Some("1" | "true" | "yes" | "on") => true,
            Some("0" | "false" | "no" | "off") => false,
            Some(other) => {
                tracing::warn!(key, value = other, "Invalid boolean, using default");
                default
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = config_from(&[]);
        assert_eq!(config.server.port, 4200);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.storage.uploads_dir, PathBuf::from("uploads"));
        assert_eq!(config.storage.artifact_name, "simulation_results.csv");
        assert_eq!(config.simulation.input_env, "SIM_INPUT_PATH");
        assert!(config.simulation.command_line.starts_with("matlab -batch"));
        assert_eq!(config.forwarder.predict_url, "http://127.0.0.1:5002/predict");
        assert_eq!(config.format, SegmentFormat::Segments);
        assert_eq!(config.limits.json, 10 * 1024 * 1024);
        assert!(!config.poll.require_marker);
        assert_eq!(config.registry.retained_runs, 1024);
    }

    #[test]
    fn environment_overrides() {
        let config = config_from(&[
            ("PORT", "8080"),
            ("SIM_COMMAND", "./run_sim.sh"),
            ("SIM_INPUT_ENV", "MODEL_INPUT"),
            ("SIM_POLL_ATTEMPTS", "3"),
            ("SIM_POLL_INITIAL_DELAY_MS", "2000"),
            ("SIM_REQUIRE_MARKER", "yes"),
            ("PREDICTION_FORMAT", "fields"),
            ("DOWNSTREAM_TIMEOUT_SECS", "5"),
            ("RETAINED_RUNS", "16"),
        ]);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.simulation.command_line, "./run_sim.sh");
        assert_eq!(config.simulation.input_env, "MODEL_INPUT");
        assert_eq!(config.poll.max_attempts, 3);
        assert_eq!(config.poll.initial_delay, Duration::from_secs(2));
        assert!(config.poll.require_marker);
        assert_eq!(config.format, SegmentFormat::Fields);
        assert_eq!(config.forwarder.timeout, Duration::from_secs(5));
        assert_eq!(config.registry.retained_runs, 16);
    }

    #[test]
    fn base_url_sets_both_endpoints() {
        let config = config_from(&[("PREDICTION_SERVICE_URL", "http://ml:9000/")]);
        assert_eq!(config.forwarder.predict_url, "http://ml:9000/predict");
        assert_eq!(config.forwarder.recommend_url, "http://ml:9000/recommend");
    }

    #[test]
    fn explicit_endpoint_wins_over_base_url() {
        let config = config_from(&[
            ("PREDICTION_SERVICE_URL", "http://ml:9000"),
            ("RECOMMEND_URL", "http://vlm:7000/v1/recommend"),
        ]);
        assert_eq!(config.forwarder.predict_url, "http://ml:9000/predict");
        assert_eq!(config.forwarder.recommend_url, "http://vlm:7000/v1/recommend");
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = config_from(&[
            ("PORT", "not-a-port"),
            ("SIM_REQUIRE_MARKER", "maybe"),
            ("PREDICTION_FORMAT", "xml"),
        ]);
        assert_eq!(config.server.port, 4200);
        assert!(!config.poll.require_marker);
        assert_eq!(config.format, SegmentFormat::Segments);
    }
}
