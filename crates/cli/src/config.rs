//! Configuration management for the CLI

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Space queried when `--space` is not given
    pub space: Option<String>,
    /// Factories queried when no peers are named on the command line
    #[serde(default)]
    pub factories: Vec<String>,
    /// Status port of the peers
    pub port: Option<u16>,
}

impl Config {
    /// Load configuration from file
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        serde_json::from_str(&content).context("Failed to parse config file")
    }

    /// Get the configuration file path
    fn config_path() -> Result<PathBuf> {
        let home = dirs_next::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".config").join("fquery").join("config.json"))
    }

    /// Command-line space first, then the configured one
    pub fn space(&self, flag: Option<String>) -> Result<String> {
        match flag.or_else(|| self.space.clone()) {
            Some(space) if !space.trim().is_empty() => Ok(space),
            _ => bail!("No space given; use --space or set \"space\" in the config file"),
        }
    }

    /// Command-line peers first, then the configured factories
    pub fn peers(&self, named: Vec<String>) -> Result<Vec<String>> {
        let peers = if named.is_empty() {
            self.factories.clone()
        } else {
            named
        };
        if peers.is_empty() {
            bail!("No factories to query; name them or set \"factories\" in the config file");
        }
        Ok(peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();

        assert!(config.space.is_none());
        assert!(config.factories.is_empty());
        assert!(config.space(None).is_err());
        assert!(config.peers(Vec::new()).is_err());
    }

    #[test]
    fn test_command_line_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"space": "space.example.com", "factories": ["vac01.example.com", "vac02.example.com"]}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();

        assert_eq!(config.space(None).unwrap(), "space.example.com");
        assert_eq!(config.space(Some("other.org".into())).unwrap(), "other.org");
        assert_eq!(config.peers(Vec::new()).unwrap().len(), 2);
        assert_eq!(
            config.peers(vec!["vac03.example.com".into()]).unwrap(),
            vec!["vac03.example.com".to_string()]
        );
        assert_eq!(config.port, None);
    }
}
