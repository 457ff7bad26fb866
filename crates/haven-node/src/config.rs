//! Node configuration types.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Configuration for a Haven node.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listen address.
    pub listen_addr: SocketAddr,
    /// Directory holding one subdirectory per vault.
    pub data_dir: PathBuf,
    /// Log level.
    pub log_level: String,
    /// Peers allowed to fetch, per vault. An empty map means every peer
    /// may access every vault.
    pub allowed_peers: std::collections::HashMap<String, Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8420".parse().expect("valid literal addr"),
            data_dir: PathBuf::from("./vaults"),
            log_level: "info".to_string(),
            allowed_peers: std::collections::HashMap::new(),
        }
    }
}

impl Config {
    /// Loads YAML configuration from a file, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.data_dir, PathBuf::from("./vaults"));
        assert!(config.allowed_peers.is_empty());
    }

    #[test]
    fn test_partial_yaml_merges_with_defaults() {
        let config: Config = serde_yaml::from_str("data_dir: /srv/haven\n").unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/haven"));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let config = Config::load(Path::new("/nonexistent/haven.yaml")).unwrap();
        assert_eq!(config.log_level, "info");
    }
}
