//! Capability seam over the container engine.
//!
//! The agent's lifecycle logic is written against this trait; production
//! wires in the Docker-backed implementation from [`super::docker`], tests
//! use the generated mock.

use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine refused a network create because its address pool overlaps
    /// an existing network. The caller may be able to reuse that network.
    #[error("address pool overlaps an existing network")]
    PoolOverlap,
    #[error("engine error: `{0}`")]
    Api(String),
}

/// What a network create needs: the driver and its addressing.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkSpec {
    /// Per-container control-plane bridge, isolated from the outside.
    InternalBridge { name: String },
    /// Externally visible attachment bound to a host parent interface.
    Macvlan {
        name: String,
        parent_interface: String,
        subnet: String,
        gateway: Option<String>,
    },
}

impl NetworkSpec {
    pub fn name(&self) -> &str {
        match self {
            NetworkSpec::InternalBridge { name } => name,
            NetworkSpec::Macvlan { name, .. } => name,
        }
    }
}

/// A container to create: image, name, restart policy always, and no
/// networks attached until the caller connects them explicitly.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
}

/// Static addressing constraints applied when connecting a container to a
/// network. Empty for DHCP-mode attachments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointOptions {
    pub ipv4_address: Option<String>,
    pub mac_address: Option<String>,
}

/// An engine network as reported by the list call.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSummary {
    pub name: String,
    pub driver: String,
    /// The `parent` driver option, set for macvlan networks.
    pub parent_interface: Option<String>,
    pub subnets: Vec<String>,
}

/// Point-in-time container details.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerDetails {
    pub id: String,
    pub state: String,
    /// network name -> assigned IPv4 address (empty string when unassigned).
    pub networks: HashMap<String, String>,
}

/// One-shot resource usage sample for a container.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSample {
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
}

#[cfg_attr(test, mockall::automock)]
pub trait ContainerEngine {
    /// Pulls `reference` from its registry.
    fn pull_image(&self, reference: &str) -> Result<(), EngineError>;

    /// Whether a local image with `reference` exists.
    fn image_exists(&self, reference: &str) -> Result<bool, EngineError>;

    /// Creates the container (restart policy always, no networks) and
    /// returns its engine id.
    fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    fn start_container(&self, name: &str) -> Result<(), EngineError>;

    /// Force-removes the container. Returns `false` when it did not exist.
    fn remove_container(&self, name: &str) -> Result<bool, EngineError>;

    fn create_network(&self, spec: &NetworkSpec) -> Result<(), EngineError>;

    /// Removes the network. Absent networks are not an error.
    fn remove_network(&self, name: &str) -> Result<(), EngineError>;

    fn list_networks(&self) -> Result<Vec<NetworkSummary>, EngineError>;

    /// Number of containers currently attached to `network`.
    fn network_attachment_count(&self, network: &str) -> Result<usize, EngineError>;

    fn connect_network(
        &self,
        network: &str,
        container: &str,
        options: &EndpointOptions,
    ) -> Result<(), EngineError>;

    fn disconnect_network(&self, network: &str, container: &str) -> Result<(), EngineError>;

    /// Returns `None` when the engine knows no container by that name.
    fn inspect_container(&self, name: &str) -> Result<Option<ContainerDetails>, EngineError>;

    fn container_stats(&self, name: &str) -> Result<StatsSample, EngineError>;
}
