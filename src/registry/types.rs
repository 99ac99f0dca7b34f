use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::Deref;
use thiserror::Error;

const CONTAINER_NAME_MAX_LENGTH: usize = 63;

/// Name of a managed runtime container. Matches the engine-side container
/// name, so it is restricted to what the engine accepts: alphanumeric start,
/// then alphanumerics, dashes, underscores and dots.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Hash, Eq, PartialOrd, Ord)]
#[serde(try_from = "String")]
pub struct ContainerName(String);

#[derive(Error, Debug, PartialEq)]
pub enum ContainerNameError {
    #[error(
        "container name must be 63 characters at most, start alphanumeric and contain only alphanumerics, '-', '_' or '.'"
    )]
    InvalidFormat,
}

impl ContainerName {
    pub fn new(s: &str) -> Result<Self, ContainerNameError> {
        Self::try_from(s.to_string())
    }

    fn is_valid_format(s: &str) -> bool {
        !s.is_empty()
            && s.len() <= CONTAINER_NAME_MAX_LENGTH
            && s.starts_with(|c: char| c.is_ascii_alphanumeric())
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    }
}

impl TryFrom<String> for ContainerName {
    type Error = ContainerNameError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        if Self::is_valid_format(&s) {
            Ok(Self(s))
        } else {
            Err(ContainerNameError::InvalidFormat)
        }
    }
}

impl Deref for ContainerName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for ContainerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.as_str())
    }
}

/// Addressing mode of a virtual interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    Dhcp,
    Manual,
}

/// Persisted intent describing how a container attaches to a host parent
/// interface. In `manual` mode `ip_address`/`subnet`/`gateway` are required
/// and reapplied on every reconfiguration; `mac_address`, when provided, is
/// stable across reconfigurations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VnicConfig {
    pub name: String,
    pub parent_interface: String,
    #[serde(rename = "network_mode")]
    pub mode: NetworkMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_subnet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

#[derive(Error, Debug, PartialEq)]
pub enum VnicConfigError {
    #[error("vnic `{vnic}`: `{field}` is required in manual mode")]
    MissingManualField { vnic: String, field: &'static str },
}

impl VnicConfig {
    /// Checks the mode-dependent field constraints.
    pub fn validate(&self) -> Result<(), VnicConfigError> {
        if self.mode == NetworkMode::Manual {
            for (field, value) in [
                ("ip_address", &self.ip_address),
                ("subnet", &self.subnet),
                ("gateway", &self.gateway),
            ] {
                if value.is_none() {
                    return Err(VnicConfigError::MissingManualField {
                        vnic: self.name.clone(),
                        field,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Engine-facing lifecycle of a managed container. Not persisted: a loaded
/// record starts as `Running` and startup reconciliation demotes entries the
/// engine no longer knows about to `Orphan`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    Creating,
    #[default]
    Running,
    Deleting,
    Orphan,
}

/// One managed container: its vNIC intents plus the IP it last presented on
/// the `{name}_internal` network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeRecord {
    pub vnics: Vec<VnicConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_ip: Option<String>,
    #[serde(skip, default)]
    pub state: LifecycleState,
}

impl RuntimeRecord {
    pub fn new(vnics: Vec<VnicConfig>) -> Self {
        Self {
            vnics,
            internal_ip: None,
            state: LifecycleState::Creating,
        }
    }
}
