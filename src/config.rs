//! Agent configuration.
//!
//! Read from a single YAML file. Every field carries a default so a missing
//! file yields a fully working configuration; a present but malformed file is
//! a startup error.

use crate::defaults;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error reading config file `{path}`: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("error parsing config file `{path}`: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Cloud controller endpoint for the control channel.
    pub server_url: Url,
    /// Container engine API socket.
    pub engine_socket: PathBuf,
    /// Network-monitor sidecar event socket.
    pub netmon_socket: PathBuf,
    /// Directory holding the persisted runtime registry.
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub debug_log_dir: PathBuf,
    /// Directory holding the client key/certificate pair. Defaults to `~/.mtls`.
    pub credentials_dir: Option<PathBuf>,
    /// Canonical reference of the runtime container image.
    pub runtime_image: String,
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub heartbeat_interval: Duration,
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub debounce_window: Duration,
    #[serde(deserialize_with = "duration_str::deserialize_duration")]
    pub engine_timeout: Duration,
    /// Upper bound on concurrently reconfigured containers.
    pub reconfigure_concurrency: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: Url::parse("wss://fleet.openplc.cloud/agent")
                .expect("default server url must parse"),
            engine_socket: PathBuf::from(defaults::ENGINE_SOCKET_PATH),
            netmon_socket: PathBuf::from(defaults::NETMON_SOCKET_PATH),
            data_dir: PathBuf::from(defaults::AGENT_DATA_DIR),
            log_dir: PathBuf::from(defaults::AGENT_LOG_DIR),
            debug_log_dir: PathBuf::from(defaults::AGENT_DEBUG_LOG_DIR),
            credentials_dir: None,
            runtime_image: defaults::RUNTIME_IMAGE.to_string(),
            heartbeat_interval: defaults::HEARTBEAT_INTERVAL,
            debounce_window: defaults::NETWORK_DEBOUNCE_WINDOW,
            engine_timeout: defaults::ENGINE_CALL_TIMEOUT,
            reconfigure_concurrency: defaults::DEFAULT_RECONFIGURE_CONCURRENCY,
        }
    }
}

impl AgentConfig {
    /// Loads the configuration from `path`. A missing file is not an error:
    /// the defaults cover a standard installation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join(defaults::REGISTRY_FILE_NAME)
    }

    /// Resolved credentials directory, `~/.mtls` unless overridden.
    pub fn credentials_dir(&self) -> PathBuf {
        self.credentials_dir.clone().unwrap_or_else(|| {
            let home = std::env::var_os("HOME").unwrap_or_else(|| "/root".into());
            PathBuf::from(home).join(defaults::MTLS_DIR)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let config = AgentConfig::load(Path::new("/nonexistent/config.yaml")).unwrap();
        assert_eq!(config, AgentConfig::default());
    }

    #[test]
    fn partial_file_overrides_defaults_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "server_url: wss://example.test/agent\nreconfigure_concurrency: 2\nheartbeat_interval: 10s"
        )
        .unwrap();

        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.server_url.as_str(), "wss://example.test/agent");
        assert_eq!(config.reconfigure_concurrency, 2);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.engine_socket, AgentConfig::default().engine_socket);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "no_such_field: true\n").unwrap();

        let err = AgentConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn credentials_dir_defaults_to_home_mtls() {
        let config = AgentConfig::default();
        assert!(config.credentials_dir().ends_with(".mtls"));
    }
}
