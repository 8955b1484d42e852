//! Agent configuration

use anyhow::{Context, Result};
use reclaim_lib::ReclamationThresholds;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Base name of the optional configuration file (`reclaimer.toml`)
pub const CONFIG_FILE: &str = "reclaimer";

/// Prefix of configuration environment variables
pub const ENV_PREFIX: &str = "RECLAIMER";

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ReclaimerConfig {
    /// Cluster the agent reclaims memory on, used in logs and reports
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// API server port for health, metrics and run control
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// JSON fleet description served by the in-memory backend
    #[serde(default)]
    pub inventory_file: Option<PathBuf>,

    /// Start a run as soon as the agent is ready
    #[serde(default)]
    pub run_on_start: bool,

    #[serde(default)]
    pub thresholds: ReclamationThresholds,
}

fn default_cluster_name() -> String {
    "default".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            cluster_name: default_cluster_name(),
            api_port: default_api_port(),
            inventory_file: None,
            run_on_start: false,
            thresholds: ReclamationThresholds::default(),
        }
    }
}

impl ReclaimerConfig {
    /// Load configuration from `reclaimer.toml` (if present) and `RECLAIMER_*`
    /// environment variables. Nested threshold keys use a double underscore,
    /// e.g. `RECLAIMER_THRESHOLDS__STALL_ROUNDS=5`.
    pub fn load() -> Result<Self> {
        Self::build(config::File::with_name(CONFIG_FILE).required(false))
    }

    /// Load configuration from an explicit file, still honoring the environment
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::build(config::File::from(path).required(true))
    }

    fn build<S>(file: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let config: Self = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("Failed to read reclaimer configuration")?
            .try_deserialize()
            .context("Invalid reclaimer configuration")?;

        config
            .thresholds
            .validate()
            .context("Invalid reclamation thresholds")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = ReclaimerConfig::default();
        assert_eq!(config.cluster_name, "default");
        assert_eq!(config.api_port, 8080);
        assert!(config.inventory_file.is_none());
        assert!(!config.run_on_start);
        assert_eq!(config.thresholds, ReclamationThresholds::default());
    }

    #[test]
    fn test_load_from_file_with_partial_thresholds() {
        let file = write_config(
            r#"
cluster_name = "lab-east"
api_port = 9191
inventory_file = "/etc/reclaimer/fleet.json"

[thresholds]
stall_rounds = 4
poll_interval = 5
"#,
        );

        let config = ReclaimerConfig::load_from(file.path()).unwrap();

        assert_eq!(config.cluster_name, "lab-east");
        assert_eq!(config.api_port, 9191);
        assert_eq!(
            config.inventory_file.as_deref(),
            Some(Path::new("/etc/reclaimer/fleet.json"))
        );
        assert_eq!(config.thresholds.stall_rounds, 4);
        assert_eq!(config.thresholds.poll_interval, Duration::from_secs(5));
        assert_eq!(config.thresholds.idle_threshold, 0.25);
        assert_eq!(config.thresholds.exclude_prefix, "sc-");
    }

    #[test]
    fn test_invalid_thresholds_are_rejected() {
        let file = write_config(
            r#"
[thresholds]
drain_ceiling = 150
"#,
        );

        let err = ReclaimerConfig::load_from(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("drain_ceiling"));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = ReclaimerConfig::load_from(Path::new("/nonexistent/reclaimer.toml"));
        assert!(result.is_err());
    }
}
