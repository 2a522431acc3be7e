//! Persisted agent configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// On-disk agent configuration.
///
/// All fields are optional; command-line flags override stored values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// WebSocket endpoint of the control plane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Directory tool execution is confined to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_directory: Option<PathBuf>,
    /// Stored pre-issued credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Stable machine label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
}

/// Configuration load/store error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine a configuration directory")]
    NoConfigDir,
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is not valid configuration JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl AgentConfig {
    /// Default config file location (`<config_dir>/remote-ops/config.json`).
    ///
    /// # Errors
    /// Fails when the platform exposes no configuration directory.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join("remote-ops").join("config.json"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load from `path`; a missing file yields defaults.
    ///
    /// # Errors
    /// Fails when the file is unreadable or not valid JSON.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };
        serde_json::from_str(&raw).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            source: err,
        })
    }

    /// Persist to `path`, creating parent directories as needed.
    ///
    /// # Errors
    /// Fails when the directory or file cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| ConfigError::Write {
                path: path.to_path_buf(),
                source: err,
            })?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw).map_err(|err| ConfigError::Write {
            path: path.to_path_buf(),
            source: err,
        })
    }

    /// Merge the set fields of `update` over this configuration.
    pub fn merge(&mut self, update: Self) {
        if update.endpoint.is_some() {
            self.endpoint = update.endpoint;
        }
        if update.project_directory.is_some() {
            self.project_directory = update.project_directory;
        }
        if update.access_token.is_some() {
            self.access_token = update.access_token;
        }
        if update.machine_id.is_some() {
            self.machine_id = update.machine_id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AgentConfig::load_from(&dir.path().join("config.json")).unwrap();
        assert!(config.endpoint.is_none());
        assert!(config.access_token.is_none());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = AgentConfig {
            endpoint: Some("wss://example.test/ws".to_string()),
            project_directory: Some(PathBuf::from("/srv/project")),
            access_token: Some("token-1".to_string()),
            machine_id: None,
        };
        config.save_to(&path).unwrap();

        let loaded = AgentConfig::load_from(&path).unwrap();
        assert_eq!(loaded.endpoint.as_deref(), Some("wss://example.test/ws"));
        assert_eq!(loaded.access_token.as_deref(), Some("token-1"));
        assert!(loaded.machine_id.is_none());
    }

    #[test]
    fn test_merge_keeps_unset_fields() {
        let mut config = AgentConfig {
            endpoint: Some("wss://example.test/ws".to_string()),
            access_token: Some("token-1".to_string()),
            ..AgentConfig::default()
        };

        config.merge(AgentConfig {
            access_token: Some("token-2".to_string()),
            ..AgentConfig::default()
        });

        assert_eq!(config.access_token.as_deref(), Some("token-2"));
        assert_eq!(config.endpoint.as_deref(), Some("wss://example.test/ws"));
    }

    #[test]
    fn test_invalid_json_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = AgentConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
