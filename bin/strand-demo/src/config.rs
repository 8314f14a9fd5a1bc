use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Parser;
use serde::Deserialize;
use strand_config::{ConfigurationLoader, GenericConfiguration};
use strand_core::RuntimeConfiguration;
use strand_error::{ErrorContext as _, GenericError};

#[derive(Parser)]
#[command(about = "Runs a supervised resource pipeline on the strand effect runtime.")]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short = 'c', long = "config", default_value = "strand.yaml")]
    pub config: PathBuf,
}

/// Settings for the demo pipeline.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PipelineConfiguration {
    /// Number of connections opened, and jobs run, concurrently.
    pub connections: usize,

    /// Base duration of a job, scaled by its connection index.
    pub job_duration_ms: u64,

    /// How long a job may run before it is canceled.
    pub job_timeout_ms: u64,

    /// Interval between heartbeats of the background monitor.
    pub heartbeat_interval_ms: u64,
}

impl PipelineConfiguration {
    pub fn job_duration(&self, connection_id: usize) -> Duration {
        Duration::from_millis(self.job_duration_ms.saturating_mul(connection_id as u64 + 1))
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

impl Default for PipelineConfiguration {
    fn default() -> Self {
        Self {
            connections: 4,
            job_duration_ms: 100,
            job_timeout_ms: 350,
            heartbeat_interval_ms: 50,
        }
    }
}

/// Configuration for a demo run.
pub struct DemoConfiguration {
    pub runtime: RuntimeConfiguration,
    pub pipeline: PipelineConfiguration,
}

impl DemoConfiguration {
    /// Creates a new `DemoConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If either section is present but cannot be deserialized, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(Self {
            runtime: config
                .try_get_typed("runtime")
                .error_context("Failed to read runtime configuration.")?
                .unwrap_or_default(),
            pipeline: config
                .try_get_typed("pipeline")
                .error_context("Failed to read pipeline configuration.")?
                .unwrap_or_default(),
        })
    }
}

/// Loads the demo configuration from `path`, if it exists, overridden by `STRAND_`-prefixed environment variables.
pub fn load_configuration(path: &Path) -> Result<DemoConfiguration, GenericError> {
    let config = ConfigurationLoader::default()
        .try_from_yaml(path)
        .from_environment("STRAND")?
        .into_generic();
    DemoConfiguration::from_configuration(&config)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn sections_are_read_from_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "runtime:\n  worker_threads: 2\n  tracing:\n    enabled: true\npipeline:\n  connections: 7\n"
        )
        .unwrap();

        let config = ConfigurationLoader::default().from_yaml(file.path()).unwrap().into_generic();
        let demo = DemoConfiguration::from_configuration(&config).unwrap();

        assert_eq!(demo.runtime.worker_threads(), 2);
        assert!(demo.runtime.tracing_enabled());
        assert_eq!(demo.pipeline.connections, 7);
        assert_eq!(demo.pipeline.job_timeout_ms, 350);
    }

    #[test]
    fn missing_sections_use_defaults() {
        let config = ConfigurationLoader::default().into_generic();
        let demo = DemoConfiguration::from_configuration(&config).unwrap();

        assert!(!demo.runtime.tracing_enabled());
        assert_eq!(demo.pipeline.connections, 4);
    }

    #[test]
    fn job_duration_scales_with_connection() {
        let pipeline = PipelineConfiguration::default();
        assert_eq!(pipeline.job_duration(0), Duration::from_millis(100));
        assert_eq!(pipeline.job_duration(3), Duration::from_millis(400));
    }
}
