//! Configuration management
//!
//! Handles:
//! - Command-line flags (interval, reserved per-core flag, config path)
//! - Optional TOML config file in the OS-specific config directory
//! - Validation of intervals, timeouts and the token command

use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::execution::default_tool_path;

/// Shortest interval that stays clear of the monitoring API write rate limit
pub const MIN_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Parser)]
#[command(name = "gpu-agent", version, about = "Reports nvidia-smi GPU metrics to Cloud Monitoring")]
pub struct Cli {
    /// Seconds between two reports (at least 10)
    #[arg(long, value_name = "SECS")]
    pub interval: Option<u64>,

    /// Report metrics per GPU core (not implemented yet, accepted and ignored)
    #[arg(long)]
    pub per_core: bool,

    /// Path to a TOML config file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub interval_secs: u64,
    pub tool_path: PathBuf,
    pub tool_timeout_secs: u64,
    pub metadata_url: String,
    pub monitoring_url: String,
    pub token_command: String,
    pub token_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            interval_secs: MIN_INTERVAL_SECS,
            tool_path: default_tool_path(),
            tool_timeout_secs: 30,
            metadata_url: "http://metadata.google.internal/computeMetadata/v1/instance/".to_string(),
            monitoring_url: "https://monitoring.googleapis.com".to_string(),
            token_command: "gcloud auth print-access-token".to_string(),
            token_timeout_secs: 30,
            request_timeout_secs: 30,
        }
    }
}

impl AgentConfig {
    /// Build the effective config: file (explicit or default location), then CLI overrides
    pub async fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = match &cli.config {
            Some(path) => Self::load(path).await?,
            None => match Self::config_file_path().filter(|p| p.exists()) {
                Some(path) => Self::load(&path).await?,
                None => Self::default(),
            },
        };

        if let Some(interval) = cli.interval {
            config.interval_secs = interval;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load config from a TOML file; missing keys take their defaults
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Option<PathBuf> {
        let mut path = dirs::config_dir()?;
        path.push("gpu-agent");
        path.push("config.toml");
        Some(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs < MIN_INTERVAL_SECS {
            return Err(ConfigError::IntervalTooShort {
                min: MIN_INTERVAL_SECS,
                got: self.interval_secs,
            });
        }

        for (name, secs) in [
            ("tool_timeout_secs", self.tool_timeout_secs),
            ("token_timeout_secs", self.token_timeout_secs),
            ("request_timeout_secs", self.request_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::ZeroTimeout(name));
            }
        }

        self.token_argv().map(|_| ())
    }

    /// Token command split with shell quoting rules
    pub fn token_argv(&self) -> Result<Vec<String>, ConfigError> {
        let argv = shell_words::split(&self.token_command)
            .map_err(|e| ConfigError::TokenCommand(e.to_string()))?;
        if argv.is_empty() {
            return Err(ConfigError::TokenCommand("command is empty".to_string()));
        }
        Ok(argv)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn token_timeout(&self) -> Duration {
        Duration::from_secs(self.token_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
