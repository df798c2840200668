//! Daemon configuration
//!
//! An optional TOML file layered under `FACTORYD_*` environment variables.
//! The same tree yields the factory settings and the daemon-only settings.

use anyhow::{Context, Result};
use factory_lib::{ConfigSnapshot, FactoryConfig};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/etc/factoryd/factoryd.toml";

/// Settings only the daemon reads
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonSettings {
    /// Seconds between control cycles
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

fn default_cycle_interval() -> u64 {
    60
}

fn default_api_port() -> u16 {
    8080
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub path: PathBuf,
    pub factory: FactoryConfig,
    pub daemon: DaemonSettings,
}

impl DaemonConfig {
    /// Load configuration from the config file and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var("FACTORYD_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(path)
    }

    pub fn load_from(path: PathBuf) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(
                config::File::from(path.as_path())
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix("FACTORYD")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("reading {}", path.display()))?;

        let (factory, daemon) = Self::split(config)?;
        Ok(Self {
            path,
            factory,
            daemon,
        })
    }

    fn split(config: config::Config) -> Result<(FactoryConfig, DaemonSettings)> {
        let factory = config
            .clone()
            .try_deserialize::<FactoryConfig>()
            .context("invalid factory settings")?;
        let daemon = config
            .try_deserialize::<DaemonSettings>()
            .context("invalid daemon settings")?;
        Ok((factory, daemon))
    }

    /// Validate the factory settings into a snapshot
    pub fn snapshot(&self) -> Result<ConfigSnapshot> {
        ConfigSnapshot::from_config(&self.factory)
            .with_context(|| format!("validating {}", self.path.display()))
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.daemon.cycle_interval_secs.max(1))
    }
}
