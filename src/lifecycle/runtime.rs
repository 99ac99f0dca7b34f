//! The container lifecycle operations.
//!
//! Everything here is idempotent where the cloud can retry: creating an
//! already-provisioned runtime reuses the existing networks, deleting an
//! absent one succeeds with `already_absent`, and replaying an unchanged
//! interface state is a no-op.

use super::engine::{
    ContainerEngine, ContainerSpec, EndpointOptions, EngineError, NetworkSpec, StatsSample,
};
use super::operations::{Operation, OperationInProgress, OperationTracker};
use crate::defaults::{INTERNAL_NETWORK_SUFFIX, MACVLAN_NETWORK_PREFIX};
use crate::netmon::InterfaceCache;
use crate::registry::{
    ContainerName, LifecycleState, NetworkMode, RegistryError, RuntimeRecord, RuntimeRegistry,
    VnicConfig,
};
use crate::registry::types::VnicConfigError;
use crate::utils::retry::retry;
use crate::utils::threads::spawn_named_thread;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Busy(#[from] OperationInProgress),
    #[error("runtime image unavailable: {0}")]
    ImageUnavailable(String),
    #[error("cannot resolve subnet/gateway for interface `{0}`")]
    NetworkUnresolvable(String),
    #[error("address pool overlap could not be resolved for `{0}`")]
    NetworkOverlapUnresolved(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    InvalidVnic(#[from] VnicConfigError),
}

impl LifecycleError {
    /// Stable error kind carried in reply envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleError::Busy(_) => "busy",
            LifecycleError::ImageUnavailable(_) => "image_unavailable",
            LifecycleError::NetworkUnresolvable(_) => "network_unresolvable",
            LifecycleError::NetworkOverlapUnresolved(_) => "network_overlap_unresolved",
            LifecycleError::Engine(_) => "engine_error",
            LifecycleError::Registry(_) => "registry_error",
            LifecycleError::InvalidVnic(_) => "validation_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyAbsent,
}

/// Snapshot returned by `inspect_device`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_ip: Option<String>,
    /// attachment network name -> assigned IP.
    pub attachments: HashMap<String, String>,
}

pub struct RuntimeManager<E: ContainerEngine> {
    engine: E,
    registry: Arc<RuntimeRegistry>,
    tracker: OperationTracker,
    interfaces: Arc<InterfaceCache>,
    runtime_image: String,
    /// The agent's own container, connected to every `{name}_internal`
    /// network for control-plane access. `None` when not containerized.
    agent_container: Option<String>,
}

/// One vNIC with its parent addressing settled, either from the config
/// itself or from the interface cache.
struct ResolvedVnic {
    vnic: VnicConfig,
    parent_subnet: String,
    parent_gateway: Option<String>,
}

impl<E: ContainerEngine> RuntimeManager<E> {
    pub fn new(
        engine: E,
        registry: Arc<RuntimeRegistry>,
        tracker: OperationTracker,
        interfaces: Arc<InterfaceCache>,
        runtime_image: String,
        agent_container: Option<String>,
    ) -> Self {
        Self {
            engine,
            registry,
            tracker,
            interfaces,
            runtime_image,
            agent_container,
        }
    }

    pub fn registry(&self) -> &Arc<RuntimeRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &OperationTracker {
        &self.tracker
    }

    /// Claims the `creating` slot and provisions the runtime on a background
    /// thread. Returns as soon as the slot is claimed so the caller can
    /// acknowledge immediately; the terminal outcome is logged and observable
    /// through `inspect_device`.
    pub fn create_runtime(
        self: &Arc<Self>,
        name: ContainerName,
        vnics: Vec<VnicConfig>,
    ) -> Result<(), LifecycleError>
    where
        E: Send + Sync + 'static,
    {
        for vnic in &vnics {
            vnic.validate()?;
        }
        let guard = self.tracker.begin(&name, Operation::Creating)?;

        let manager = self.clone();
        spawn_named_thread(format!("create-{name}"), move || {
            let _slot = guard;
            match manager.provision(&name, vnics) {
                Ok(()) => info!(container = %name, "runtime container created"),
                Err(e) => {
                    error!(container = %name, kind = e.kind(), error_msg = %e, "runtime creation failed")
                }
            }
        });
        Ok(())
    }

    /// The synchronous provisioning flow behind [`Self::create_runtime`].
    pub(crate) fn provision(
        &self,
        name: &ContainerName,
        vnics: Vec<VnicConfig>,
    ) -> Result<(), LifecycleError> {
        self.ensure_image()?;
        self.ensure_internal_network(name)?;

        let resolved = self.resolve_vnics(&vnics)?;

        // One attachment network per distinct (parent interface, subnet).
        let mut attachment_networks: HashMap<(String, String), String> = HashMap::new();
        for r in &resolved {
            let key = (r.vnic.parent_interface.clone(), r.parent_subnet.clone());
            if !attachment_networks.contains_key(&key) {
                let network = self.ensure_attachment_network(
                    &r.vnic.parent_interface,
                    &r.parent_subnet,
                    r.parent_gateway.as_deref(),
                )?;
                attachment_networks.insert(key, network);
            }
        }

        if self.engine.inspect_container(name)?.is_none() {
            self.engine.create_container(&ContainerSpec {
                name: name.to_string(),
                image: self.runtime_image.clone(),
            })?;
        } else {
            debug!(container = %name, "container already exists, reusing");
        }

        let internal = internal_network_name(name);
        self.connect_if_absent(&internal, name, &EndpointOptions::default())?;
        for r in &resolved {
            let key = (r.vnic.parent_interface.clone(), r.parent_subnet.clone());
            let network = &attachment_networks[&key];
            self.connect_if_absent(network, name, &endpoint_options(&r.vnic))?;
        }

        self.engine.start_container(name)?;
        self.connect_agent_to_internal(&internal);

        let mut record = RuntimeRecord::new(vnics);
        record.state = LifecycleState::Running;
        record.internal_ip = self.query_internal_ip(name, &internal)?;
        if let Err(e) = self.registry.put(name.clone(), record) {
            warn!(container = %name, error_msg = %e, "registry persistence failed, keeping in-memory state");
        }
        Ok(())
    }

    /// Removes the container, its internal network, and any attachment
    /// network no other container still uses. Idempotent.
    pub fn delete_device(&self, name: &ContainerName) -> Result<DeleteOutcome, LifecycleError> {
        let _slot = self.tracker.begin(name, Operation::Deleting)?;
        self.registry.set_state(name, LifecycleState::Deleting);

        let attachments = self.candidate_attachment_networks(name)?;
        let existed = self.engine.remove_container(name)?;
        self.engine.remove_network(&internal_network_name(name))?;

        for network in attachments {
            match self.engine.network_attachment_count(&network) {
                Ok(0) => {
                    debug!(network = %network, "attachment network unreferenced, removing");
                    self.engine.remove_network(&network)?;
                }
                Ok(n) => debug!(network = %network, containers = n, "attachment network still in use, keeping"),
                Err(e) => warn!(network = %network, error_msg = %e, "cannot count attachments, keeping network"),
            }
        }

        if let Err(e) = self.registry.remove(name) {
            warn!(container = %name, error_msg = %e, "registry persistence failed, keeping in-memory state");
        }

        if existed {
            info!(container = %name, "runtime container deleted");
            Ok(DeleteOutcome::Deleted)
        } else {
            debug!(container = %name, "delete requested for absent container");
            Ok(DeleteOutcome::AlreadyAbsent)
        }
    }

    pub fn inspect_device(&self, name: &ContainerName) -> Result<DeviceStatus, LifecycleError> {
        let Some(details) = self.engine.inspect_container(name)? else {
            return Ok(DeviceStatus {
                present: false,
                state: None,
                internal_ip: None,
                attachments: HashMap::new(),
            });
        };

        let internal = internal_network_name(name);
        let internal_ip = details.networks.get(&internal).cloned().filter(|ip| !ip.is_empty());
        let attachments = details
            .networks
            .iter()
            .filter(|(network, _)| network.starts_with(MACVLAN_NETWORK_PREFIX))
            .map(|(network, ip)| (network.clone(), ip.clone()))
            .collect();

        Ok(DeviceStatus {
            present: true,
            state: Some(details.state),
            internal_ip,
            attachments,
        })
    }

    /// Rewrites the attachments of `name` bound to `interface` after the
    /// host side changed. Manual-mode vNICs keep their static IP (verbatim,
    /// even if the new subnet no longer contains it) and their MAC.
    pub fn reconfigure_attachment(
        &self,
        name: &ContainerName,
        interface: &str,
    ) -> Result<(), LifecycleError> {
        let _slot = self.tracker.begin(name, Operation::Reconfiguring)?;

        let Some(record) = self.registry.get(name) else {
            debug!(container = %name, "not in registry, nothing to reconfigure");
            return Ok(());
        };
        let affected: Vec<&VnicConfig> = record
            .vnics
            .iter()
            .filter(|vnic| vnic.parent_interface == interface)
            .collect();
        if affected.is_empty() {
            return Ok(());
        }

        let Some(state) = self.interfaces.lookup(interface) else {
            return Err(LifecycleError::NetworkUnresolvable(interface.to_string()));
        };
        let subnet = state
            .primary_subnet()
            .ok_or_else(|| LifecycleError::NetworkUnresolvable(interface.to_string()))?
            .to_string();

        let Some(details) = self.engine.inspect_container(name)? else {
            warn!(container = %name, "container missing from engine, marking orphan");
            self.registry.set_state(name, LifecycleState::Orphan);
            return Ok(());
        };

        let target = self.ensure_attachment_network(interface, &subnet, state.gateway.as_deref())?;

        let stale_prefix = attachment_network_prefix(interface);
        for network in details.networks.keys() {
            if network.starts_with(&stale_prefix) && *network != target {
                debug!(container = %name, network = %network, "disconnecting stale attachment");
                self.engine.disconnect_network(network, name)?;
            }
        }

        if !details.networks.contains_key(&target) {
            for vnic in affected {
                if vnic.mode == NetworkMode::Manual {
                    if let Some(subnet_cidr) = &vnic.subnet {
                        if vnic
                            .ip_address
                            .as_deref()
                            .is_some_and(|ip| !subnet_contains(&subnet, ip) && subnet_contains(subnet_cidr, ip))
                        {
                            warn!(
                                container = %name,
                                ip = vnic.ip_address.as_deref().unwrap_or_default(),
                                new_subnet = %subnet,
                                "static address is outside the new parent subnet, reapplying verbatim"
                            );
                        }
                    }
                }
                self.engine
                    .connect_network(&target, name, &endpoint_options(vnic))?;
            }
            info!(container = %name, interface, network = %target, "attachment reconfigured");
        } else {
            debug!(container = %name, network = %target, "already attached, no-op");
        }
        Ok(())
    }

    /// Marks registry entries the engine no longer knows about as orphans
    /// and refreshes the internal-IP fingerprint of the ones it does.
    pub fn reconcile_on_start(&self) {
        for (name, _) in self.registry.snapshot() {
            match self.engine.inspect_container(&name) {
                Ok(None) => {
                    warn!(container = %name, "registered container missing from engine, marking orphan");
                    self.registry.set_state(&name, LifecycleState::Orphan);
                }
                Ok(Some(details)) => {
                    let internal = internal_network_name(&name);
                    let ip = details.networks.get(&internal).cloned().filter(|ip| !ip.is_empty());
                    if let Err(e) = self.registry.set_internal_ip(&name, ip) {
                        warn!(container = %name, error_msg = %e, "registry persistence failed during reconciliation");
                    }
                }
                Err(e) => {
                    warn!(container = %name, error_msg = %e, "cannot inspect container during reconciliation");
                }
            }
        }
    }

    /// One-shot engine stats for a managed container.
    pub fn device_stats(&self, name: &ContainerName) -> Result<StatsSample, LifecycleError> {
        Ok(self.engine.container_stats(name)?)
    }

    pub fn internal_ip(&self, name: &ContainerName) -> Option<String> {
        self.registry.get(name).and_then(|record| record.internal_ip)
    }

    /// Removes the agent's own container. Used by the self-remove command.
    pub fn remove_self(&self) -> Result<(), LifecycleError> {
        match &self.agent_container {
            Some(own) => {
                info!(container = %own, "removing orchestrator container");
                self.engine.remove_container(own)?;
                Ok(())
            }
            None => {
                warn!("agent is not containerized, nothing to self-remove");
                Ok(())
            }
        }
    }

    fn ensure_image(&self) -> Result<(), LifecycleError> {
        let reference = self.runtime_image.as_str();
        let pull = retry(2, Duration::from_secs(1), || self.engine.pull_image(reference));
        if let Err(pull_err) = pull {
            if self.engine.image_exists(reference)? {
                warn!(image = reference, error_msg = %pull_err, "pull failed, using local image");
            } else {
                return Err(LifecycleError::ImageUnavailable(pull_err.to_string()));
            }
        }
        Ok(())
    }

    fn ensure_internal_network(&self, name: &ContainerName) -> Result<(), LifecycleError> {
        let internal = internal_network_name(name);
        let exists = self
            .engine
            .list_networks()?
            .iter()
            .any(|network| network.name == internal);
        if !exists {
            self.engine
                .create_network(&NetworkSpec::InternalBridge { name: internal })?;
        }
        Ok(())
    }

    /// Get-or-create the attachment network for `(interface, subnet)`.
    /// Returns the name of the network to connect to, which is the canonical
    /// one unless an engine-side network with the same parent and subnet
    /// already exists (address pools cannot overlap, so it is reused).
    fn ensure_attachment_network(
        &self,
        interface: &str,
        subnet: &str,
        gateway: Option<&str>,
    ) -> Result<String, LifecycleError> {
        if let Some(existing) = self.find_matching_network(interface, subnet)? {
            debug!(network = %existing, interface, subnet, "reusing existing attachment network");
            return Ok(existing);
        }

        let canonical = attachment_network_name(interface, subnet);
        let spec = NetworkSpec::Macvlan {
            name: canonical.clone(),
            parent_interface: interface.to_string(),
            subnet: subnet.to_string(),
            gateway: gateway.map(str::to_string),
        };
        match self.engine.create_network(&spec) {
            Ok(()) => Ok(canonical),
            Err(EngineError::PoolOverlap) => self
                .find_matching_network(interface, subnet)?
                .ok_or_else(|| {
                    LifecycleError::NetworkOverlapUnresolved(format!("{interface}/{subnet}"))
                }),
            Err(e) => Err(e.into()),
        }
    }

    fn find_matching_network(
        &self,
        interface: &str,
        subnet: &str,
    ) -> Result<Option<String>, LifecycleError> {
        Ok(self
            .engine
            .list_networks()?
            .into_iter()
            .find(|network| {
                network.parent_interface.as_deref() == Some(interface)
                    && network.subnets.iter().any(|s| s == subnet)
            })
            .map(|network| network.name))
    }

    fn resolve_vnics(&self, vnics: &[VnicConfig]) -> Result<Vec<ResolvedVnic>, LifecycleError> {
        vnics
            .iter()
            .map(|vnic| {
                let cached = self.interfaces.lookup(&vnic.parent_interface);
                let parent_subnet = vnic
                    .parent_subnet
                    .clone()
                    .or_else(|| cached.as_ref().and_then(|s| s.primary_subnet().map(str::to_string)))
                    .ok_or_else(|| {
                        LifecycleError::NetworkUnresolvable(vnic.parent_interface.clone())
                    })?;
                let parent_gateway = vnic
                    .parent_gateway
                    .clone()
                    .or_else(|| cached.as_ref().and_then(|s| s.gateway.clone()));
                Ok(ResolvedVnic {
                    vnic: vnic.clone(),
                    parent_subnet,
                    parent_gateway,
                })
            })
            .collect()
    }

    fn connect_if_absent(
        &self,
        network: &str,
        name: &ContainerName,
        options: &EndpointOptions,
    ) -> Result<(), LifecycleError> {
        let already_connected = self
            .engine
            .inspect_container(name)?
            .map(|details| details.networks.contains_key(network))
            .unwrap_or(false);
        if !already_connected {
            self.engine.connect_network(network, name, options)?;
        }
        Ok(())
    }

    fn connect_agent_to_internal(&self, internal: &str) {
        let Some(own) = &self.agent_container else {
            warn!("agent is not containerized, skipping internal network attachment");
            return;
        };
        let already = self
            .engine
            .inspect_container(own)
            .ok()
            .flatten()
            .map(|details| details.networks.contains_key(internal))
            .unwrap_or(false);
        if already {
            return;
        }
        if let Err(e) = self
            .engine
            .connect_network(internal, own, &EndpointOptions::default())
        {
            warn!(network = internal, error_msg = %e, "cannot connect agent to internal network");
        }
    }

    fn query_internal_ip(
        &self,
        name: &ContainerName,
        internal: &str,
    ) -> Result<Option<String>, LifecycleError> {
        Ok(self
            .engine
            .inspect_container(name)?
            .and_then(|details| details.networks.get(internal).cloned())
            .filter(|ip| !ip.is_empty()))
    }

    /// Attachment networks to consider for cleanup when deleting `name`:
    /// the ones the container is connected to, or, if the container is
    /// already gone, unreferenced macvlan networks on its parents.
    fn candidate_attachment_networks(
        &self,
        name: &ContainerName,
    ) -> Result<Vec<String>, LifecycleError> {
        if let Some(details) = self.engine.inspect_container(name)? {
            return Ok(details
                .networks
                .into_keys()
                .filter(|network| network.starts_with(MACVLAN_NETWORK_PREFIX))
                .collect());
        }

        let Some(record) = self.registry.get(name) else {
            return Ok(Vec::new());
        };
        let parents: HashSet<&str> = record
            .vnics
            .iter()
            .map(|vnic| vnic.parent_interface.as_str())
            .collect();
        Ok(self
            .engine
            .list_networks()?
            .into_iter()
            .filter(|network| {
                network.name.starts_with(MACVLAN_NETWORK_PREFIX)
                    && network
                        .parent_interface
                        .as_deref()
                        .is_some_and(|parent| parents.contains(parent))
            })
            .map(|network| network.name)
            .collect())
    }
}

pub fn internal_network_name(name: &ContainerName) -> String {
    format!("{name}{INTERNAL_NETWORK_SUFFIX}")
}

/// `macvlan_{interface}_{subnet with '/' replaced}`, e.g.
/// `macvlan_ens37_192.168.1.0_24`.
pub fn attachment_network_name(interface: &str, subnet: &str) -> String {
    format!(
        "{MACVLAN_NETWORK_PREFIX}{interface}_{}",
        subnet.replace('/', "_")
    )
}

fn attachment_network_prefix(interface: &str) -> String {
    format!("{MACVLAN_NETWORK_PREFIX}{interface}_")
}

fn endpoint_options(vnic: &VnicConfig) -> EndpointOptions {
    EndpointOptions {
        ipv4_address: (vnic.mode == NetworkMode::Manual)
            .then(|| vnic.ip_address.clone())
            .flatten(),
        mac_address: vnic.mac_address.clone(),
    }
}

/// Whether `ip` falls inside the CIDR `subnet`. Malformed input is treated
/// as not contained.
fn subnet_contains(subnet: &str, ip: &str) -> bool {
    let Some((network, prefixlen)) = subnet.split_once('/') else {
        return false;
    };
    let (Ok(network), Ok(ip), Ok(prefixlen)) = (
        network.parse::<std::net::Ipv4Addr>(),
        ip.parse::<std::net::Ipv4Addr>(),
        prefixlen.parse::<u32>(),
    ) else {
        return false;
    };
    if prefixlen > 32 {
        return false;
    }
    let mask = if prefixlen == 0 { 0 } else { u32::MAX << (32 - prefixlen) };
    (u32::from(network) & mask) == (u32::from(ip) & mask)
}

////////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::engine::{ContainerDetails, MockContainerEngine, NetworkSummary};
    use crate::netmon::cache::{InterfaceState, Ipv4Address};
    use assert_matches::assert_matches;
    use mockall::predicate::eq;
    use mockall::Sequence;

    fn name(s: &str) -> ContainerName {
        ContainerName::new(s).unwrap()
    }

    fn dhcp_vnic(parent: &str) -> VnicConfig {
        VnicConfig {
            name: "eth0".to_string(),
            parent_interface: parent.to_string(),
            mode: NetworkMode::Dhcp,
            parent_subnet: None,
            parent_gateway: None,
            ip_address: None,
            subnet: None,
            gateway: None,
            dns: vec![],
            mac_address: None,
        }
    }

    fn manual_vnic(parent: &str, ip: &str, mac: &str) -> VnicConfig {
        VnicConfig {
            name: "eth0".to_string(),
            parent_interface: parent.to_string(),
            mode: NetworkMode::Manual,
            parent_subnet: None,
            parent_gateway: None,
            ip_address: Some(ip.to_string()),
            subnet: Some("192.168.1.0/24".to_string()),
            gateway: Some("192.168.1.1".to_string()),
            dns: vec![],
            mac_address: Some(mac.to_string()),
        }
    }

    fn cache_with(interface: &str, subnet: &str, gateway: &str) -> Arc<InterfaceCache> {
        let cache = InterfaceCache::new();
        cache.apply_discovery(vec![InterfaceState {
            interface: interface.to_string(),
            index: 2,
            operstate: "UP".to_string(),
            ipv4_addresses: vec![Ipv4Address {
                address: "192.168.1.50".to_string(),
                prefixlen: 24,
                subnet: subnet.to_string(),
                network_address: subnet.split('/').next().unwrap().to_string(),
            }],
            gateway: Some(gateway.to_string()),
            timestamp: None,
        }]);
        Arc::new(cache)
    }

    fn manager(
        engine: MockContainerEngine,
        interfaces: Arc<InterfaceCache>,
    ) -> (RuntimeManager<MockContainerEngine>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(RuntimeRegistry::load(&dir.path().join("reg.json")));
        let manager = RuntimeManager::new(
            engine,
            registry,
            OperationTracker::new(),
            interfaces,
            "registry.test/vplc/runtime:latest".to_string(),
            Some("orchestrator".to_string()),
        );
        (manager, dir)
    }

    fn inspect_returns(
        engine: &mut MockContainerEngine,
        container: &'static str,
        networks: Vec<(&'static str, &'static str)>,
    ) {
        engine
            .expect_inspect_container()
            .with(eq(container))
            .returning(move |_| {
                Ok(Some(ContainerDetails {
                    id: "abc123".to_string(),
                    state: "running".to_string(),
                    networks: networks
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                }))
            });
    }

    #[test]
    fn provision_dhcp_runtime_creates_networks_and_connects_in_order() {
        let mut engine = MockContainerEngine::new();
        let mut seq = Sequence::new();

        engine
            .expect_pull_image()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        // Internal network ensure: nothing exists yet.
        engine
            .expect_list_networks()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec![]));
        engine
            .expect_create_network()
            .withf(|spec| matches!(spec, NetworkSpec::InternalBridge { name } if name == "plc-001_internal"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        // Attachment network ensure: scan finds nothing, canonical is created.
        engine
            .expect_list_networks()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec![]));
        engine
            .expect_create_network()
            .withf(|spec| {
                matches!(
                    spec,
                    NetworkSpec::Macvlan { name, parent_interface, subnet, gateway }
                        if name == "macvlan_ens37_192.168.1.0_24"
                            && parent_interface == "ens37"
                            && subnet == "192.168.1.0/24"
                            && gateway.as_deref() == Some("192.168.1.1")
                )
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        // Container does not exist yet.
        engine
            .expect_inspect_container()
            .with(eq("plc-001"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        engine
            .expect_create_container()
            .withf(|spec| spec.name == "plc-001" && spec.image == "registry.test/vplc/runtime:latest")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok("abc123".to_string()));
        // connect_if_absent(internal): not connected yet.
        engine
            .expect_inspect_container()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(Some(ContainerDetails {
                    id: "abc123".to_string(),
                    state: "created".to_string(),
                    networks: HashMap::new(),
                }))
            });
        engine
            .expect_connect_network()
            .with(eq("plc-001_internal"), eq("plc-001"), eq(EndpointOptions::default()))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        // connect_if_absent(attachment).
        engine
            .expect_inspect_container()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(Some(ContainerDetails {
                    id: "abc123".to_string(),
                    state: "created".to_string(),
                    networks: HashMap::from([("plc-001_internal".to_string(), String::new())]),
                }))
            });
        engine
            .expect_connect_network()
            .with(
                eq("macvlan_ens37_192.168.1.0_24"),
                eq("plc-001"),
                eq(EndpointOptions::default()),
            )
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        engine
            .expect_start_container()
            .with(eq("plc-001"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        // Agent self-attachment: inspect own container, then connect.
        engine
            .expect_inspect_container()
            .with(eq("orchestrator"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(Some(ContainerDetails {
                    id: "self".to_string(),
                    state: "running".to_string(),
                    networks: HashMap::new(),
                }))
            });
        engine
            .expect_connect_network()
            .with(eq("plc-001_internal"), eq("orchestrator"), eq(EndpointOptions::default()))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        // Final inspect for the internal IP fingerprint.
        engine
            .expect_inspect_container()
            .with(eq("plc-001"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(Some(ContainerDetails {
                    id: "abc123".to_string(),
                    state: "running".to_string(),
                    networks: HashMap::from([
                        ("plc-001_internal".to_string(), "172.28.0.2".to_string()),
                        ("macvlan_ens37_192.168.1.0_24".to_string(), "192.168.1.73".to_string()),
                    ]),
                }))
            });

        let (manager, _dir) = manager(engine, cache_with("ens37", "192.168.1.0/24", "192.168.1.1"));
        manager
            .provision(&name("plc-001"), vec![dhcp_vnic("ens37")])
            .unwrap();

        let record = manager.registry().get(&name("plc-001")).unwrap();
        assert_eq!(record.state, LifecycleState::Running);
        assert_eq!(record.internal_ip.as_deref(), Some("172.28.0.2"));
        assert_eq!(record.vnics.len(), 1);
    }

    #[test]
    fn provision_reuses_overlapping_network() {
        let mut engine = MockContainerEngine::new();
        engine.expect_pull_image().returning(|_| Ok(()));
        // First list: the internal ensure. Later lists: the attachment scans.
        engine.expect_list_networks().returning(|| {
            Ok(vec![NetworkSummary {
                name: "existing-mv".to_string(),
                driver: "macvlan".to_string(),
                parent_interface: Some("ens37".to_string()),
                subnets: vec!["192.168.1.0/24".to_string()],
            }])
        });
        // The internal bridge still has to be created (only existing-mv is there).
        engine
            .expect_create_network()
            .withf(|spec| matches!(spec, NetworkSpec::InternalBridge { .. }))
            .times(1)
            .returning(|_| Ok(()));
        engine
            .expect_inspect_container()
            .with(eq("plc-001"))
            .returning(|_| Ok(None));
        engine
            .expect_create_container()
            .returning(|_| Ok("abc123".to_string()));
        // No macvlan create: the scan matched existing-mv before any attempt.
        engine
            .expect_connect_network()
            .withf(|network, _, _| network == "plc-001_internal" || network == "existing-mv")
            .times(3)
            .returning(|_, _, _| Ok(()));
        engine.expect_start_container().returning(|_| Ok(()));
        engine
            .expect_inspect_container()
            .with(eq("orchestrator"))
            .returning(|_| Ok(None));

        let (manager, _dir) = manager(engine, cache_with("ens37", "192.168.1.0/24", "192.168.1.1"));
        manager
            .provision(&name("plc-001"), vec![dhcp_vnic("ens37")])
            .unwrap();
    }

    #[test]
    fn provision_resolves_overlap_error_by_scanning() {
        let mut engine = MockContainerEngine::new();
        engine.expect_pull_image().returning(|_| Ok(()));

        // The matching network only becomes visible after the engine reports
        // the overlap (created concurrently by another actor).
        let mut lists = Sequence::new();
        engine
            .expect_list_networks()
            .times(2)
            .in_sequence(&mut lists)
            .returning(|| Ok(vec![]));
        engine
            .expect_list_networks()
            .times(1)
            .in_sequence(&mut lists)
            .returning(|| {
                Ok(vec![NetworkSummary {
                    name: "existing-mv".to_string(),
                    driver: "macvlan".to_string(),
                    parent_interface: Some("ens37".to_string()),
                    subnets: vec!["192.168.1.0/24".to_string()],
                }])
            });

        engine
            .expect_create_network()
            .withf(|spec| matches!(spec, NetworkSpec::InternalBridge { .. }))
            .returning(|_| Ok(()));
        engine
            .expect_create_network()
            .withf(|spec| matches!(spec, NetworkSpec::Macvlan { .. }))
            .times(1)
            .returning(|_| Err(EngineError::PoolOverlap));
        engine
            .expect_inspect_container()
            .with(eq("plc-001"))
            .returning(|_| Ok(None));
        engine
            .expect_create_container()
            .returning(|_| Ok("abc123".to_string()));
        engine
            .expect_connect_network()
            .withf(|network, _, _| network == "plc-001_internal" || network == "existing-mv")
            .times(3)
            .returning(|_, _, _| Ok(()));
        engine.expect_start_container().returning(|_| Ok(()));
        engine
            .expect_inspect_container()
            .with(eq("orchestrator"))
            .returning(|_| Ok(None));

        let (manager, _dir) = manager(engine, cache_with("ens37", "192.168.1.0/24", "192.168.1.1"));
        manager
            .provision(&name("plc-001"), vec![dhcp_vnic("ens37")])
            .unwrap();
    }

    #[test]
    fn provision_overlap_without_match_is_unresolved() {
        let mut engine = MockContainerEngine::new();
        engine.expect_pull_image().returning(|_| Ok(()));
        engine.expect_list_networks().returning(|| Ok(vec![]));
        engine
            .expect_create_network()
            .withf(|spec| matches!(spec, NetworkSpec::InternalBridge { .. }))
            .returning(|_| Ok(()));
        engine
            .expect_create_network()
            .withf(|spec| matches!(spec, NetworkSpec::Macvlan { .. }))
            .returning(|_| Err(EngineError::PoolOverlap));

        let (manager, _dir) = manager(engine, cache_with("ens37", "192.168.1.0/24", "192.168.1.1"));
        let err = manager
            .provision(&name("plc-001"), vec![dhcp_vnic("ens37")])
            .unwrap_err();
        assert_eq!(err.kind(), "network_overlap_unresolved");
    }

    #[test]
    fn provision_fails_when_subnet_is_unresolvable() {
        let mut engine = MockContainerEngine::new();
        engine.expect_pull_image().returning(|_| Ok(()));
        engine.expect_list_networks().returning(|| Ok(vec![]));
        engine
            .expect_create_network()
            .withf(|spec| matches!(spec, NetworkSpec::InternalBridge { .. }))
            .returning(|_| Ok(()));

        // Cache has no entry for ens99 and the vnic carries no parent subnet.
        let (manager, _dir) = manager(engine, Arc::new(InterfaceCache::new()));
        let err = manager
            .provision(&name("plc-001"), vec![dhcp_vnic("ens99")])
            .unwrap_err();
        assert_matches!(err, LifecycleError::NetworkUnresolvable(interface) => {
            assert_eq!(interface, "ens99");
        });
    }

    #[test]
    fn pull_failure_falls_back_to_local_image() {
        let mut engine = MockContainerEngine::new();
        // Retried exactly once: two attempts total.
        engine
            .expect_pull_image()
            .times(2)
            .returning(|_| Err(EngineError::Api("registry unreachable".to_string())));
        engine.expect_image_exists().returning(|_| Ok(true));
        engine.expect_list_networks().returning(|| Ok(vec![]));
        engine
            .expect_create_network()
            .returning(|_| Ok(()));
        engine
            .expect_inspect_container()
            .with(eq("plc-001"))
            .returning(|_| Ok(None));
        engine
            .expect_create_container()
            .returning(|_| Ok("abc123".to_string()));
        engine.expect_connect_network().returning(|_, _, _| Ok(()));
        engine.expect_start_container().returning(|_| Ok(()));
        engine
            .expect_inspect_container()
            .with(eq("orchestrator"))
            .returning(|_| Ok(None));

        let (manager, _dir) = manager(engine, cache_with("ens37", "192.168.1.0/24", "192.168.1.1"));
        manager
            .provision(&name("plc-001"), vec![dhcp_vnic("ens37")])
            .unwrap();
    }

    #[test]
    fn pull_failure_without_local_image_is_unavailable() {
        let mut engine = MockContainerEngine::new();
        engine
            .expect_pull_image()
            .times(2)
            .returning(|_| Err(EngineError::Api("registry unreachable".to_string())));
        engine.expect_image_exists().returning(|_| Ok(false));

        let (manager, _dir) = manager(engine, cache_with("ens37", "192.168.1.0/24", "192.168.1.1"));
        let err = manager
            .provision(&name("plc-001"), vec![dhcp_vnic("ens37")])
            .unwrap_err();
        assert_eq!(err.kind(), "image_unavailable");
    }

    #[test]
    fn create_runtime_is_busy_while_creating() {
        let engine = MockContainerEngine::new();
        let (manager, _dir) = manager(engine, Arc::new(InterfaceCache::new()));

        let _guard = manager
            .tracker()
            .begin(&name("plc-001"), Operation::Creating)
            .unwrap();
        let err = manager
            .reconfigure_attachment(&name("plc-001"), "ens37")
            .unwrap_err();
        assert_eq!(err.kind(), "busy");
    }

    #[test]
    fn delete_removes_container_internal_and_unreferenced_attachment() {
        let mut engine = MockContainerEngine::new();
        inspect_returns(
            &mut engine,
            "plc-001",
            vec![
                ("plc-001_internal", "172.28.0.2"),
                ("macvlan_ens37_192.168.1.0_24", "192.168.1.73"),
            ],
        );
        engine
            .expect_remove_container()
            .with(eq("plc-001"))
            .times(1)
            .returning(|_| Ok(true));
        engine
            .expect_remove_network()
            .with(eq("plc-001_internal"))
            .times(1)
            .returning(|_| Ok(()));
        engine
            .expect_network_attachment_count()
            .with(eq("macvlan_ens37_192.168.1.0_24"))
            .returning(|_| Ok(0));
        engine
            .expect_remove_network()
            .with(eq("macvlan_ens37_192.168.1.0_24"))
            .times(1)
            .returning(|_| Ok(()));

        let (manager, _dir) = manager(engine, Arc::new(InterfaceCache::new()));
        let outcome = manager.delete_device(&name("plc-001")).unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted);
        assert!(manager.registry().get(&name("plc-001")).is_none());
    }

    #[test]
    fn delete_keeps_attachment_still_in_use() {
        let mut engine = MockContainerEngine::new();
        inspect_returns(
            &mut engine,
            "plc-001",
            vec![("macvlan_ens37_192.168.1.0_24", "192.168.1.73")],
        );
        engine.expect_remove_container().returning(|_| Ok(true));
        engine
            .expect_remove_network()
            .with(eq("plc-001_internal"))
            .returning(|_| Ok(()));
        engine
            .expect_network_attachment_count()
            .returning(|_| Ok(1));
        // No remove_network expectation for the macvlan: removing it would
        // panic the mock.

        let (manager, _dir) = manager(engine, Arc::new(InterfaceCache::new()));
        manager.delete_device(&name("plc-001")).unwrap();
    }

    #[test]
    fn delete_of_absent_container_is_already_absent() {
        let mut engine = MockContainerEngine::new();
        engine.expect_inspect_container().returning(|_| Ok(None));
        engine.expect_remove_container().returning(|_| Ok(false));
        engine
            .expect_remove_network()
            .with(eq("plc-001_internal"))
            .returning(|_| Ok(()));

        let (manager, _dir) = manager(engine, Arc::new(InterfaceCache::new()));
        let outcome = manager.delete_device(&name("plc-001")).unwrap();
        assert_eq!(outcome, DeleteOutcome::AlreadyAbsent);
    }

    #[test]
    fn reconfigure_moves_attachment_preserving_static_ip_and_mac() {
        let mut engine = MockContainerEngine::new();
        engine
            .expect_inspect_container()
            .with(eq("plc-static"))
            .returning(|_| {
                Ok(Some(ContainerDetails {
                    id: "abc".to_string(),
                    state: "running".to_string(),
                    networks: HashMap::from([
                        ("plc-static_internal".to_string(), "172.28.0.2".to_string()),
                        ("macvlan_ens37_192.168.1.0_24".to_string(), "192.168.1.100".to_string()),
                    ]),
                }))
            });
        engine.expect_list_networks().returning(|| Ok(vec![]));
        engine
            .expect_create_network()
            .withf(|spec| {
                matches!(
                    spec,
                    NetworkSpec::Macvlan { name, subnet, .. }
                        if name == "macvlan_ens37_10.0.0.0_24" && subnet == "10.0.0.0/24"
                )
            })
            .times(1)
            .returning(|_| Ok(()));
        engine
            .expect_disconnect_network()
            .with(eq("macvlan_ens37_192.168.1.0_24"), eq("plc-static"))
            .times(1)
            .returning(|_, _| Ok(()));
        engine
            .expect_connect_network()
            .with(
                eq("macvlan_ens37_10.0.0.0_24"),
                eq("plc-static"),
                eq(EndpointOptions {
                    ipv4_address: Some("192.168.1.100".to_string()),
                    mac_address: Some("02:42:ac:11:00:02".to_string()),
                }),
            )
            .times(1)
            .returning(|_, _, _| Ok(()));

        let (manager, _dir) = manager(engine, cache_with("ens37", "10.0.0.0/24", "10.0.0.1"));
        manager
            .registry()
            .put(
                name("plc-static"),
                RuntimeRecord::new(vec![manual_vnic("ens37", "192.168.1.100", "02:42:ac:11:00:02")]),
            )
            .unwrap();

        manager
            .reconfigure_attachment(&name("plc-static"), "ens37")
            .unwrap();
    }

    #[test]
    fn reconfigure_replaying_current_state_is_a_noop() {
        let mut engine = MockContainerEngine::new();
        engine
            .expect_inspect_container()
            .returning(|_| {
                Ok(Some(ContainerDetails {
                    id: "abc".to_string(),
                    state: "running".to_string(),
                    networks: HashMap::from([(
                        "macvlan_ens37_192.168.1.0_24".to_string(),
                        "192.168.1.100".to_string(),
                    )]),
                }))
            });
        engine.expect_list_networks().returning(|| {
            Ok(vec![NetworkSummary {
                name: "macvlan_ens37_192.168.1.0_24".to_string(),
                driver: "macvlan".to_string(),
                parent_interface: Some("ens37".to_string()),
                subnets: vec!["192.168.1.0/24".to_string()],
            }])
        });
        // No disconnects, no connects, no creates.

        let (manager, _dir) = manager(engine, cache_with("ens37", "192.168.1.0/24", "192.168.1.1"));
        manager
            .registry()
            .put(
                name("plc-static"),
                RuntimeRecord::new(vec![manual_vnic("ens37", "192.168.1.100", "02:42:ac:11:00:02")]),
            )
            .unwrap();

        manager
            .reconfigure_attachment(&name("plc-static"), "ens37")
            .unwrap();
    }

    #[test]
    fn reconfigure_of_unrelated_interface_touches_nothing() {
        let engine = MockContainerEngine::new();
        let (manager, _dir) = manager(engine, Arc::new(InterfaceCache::new()));
        manager
            .registry()
            .put(name("plc-001"), RuntimeRecord::new(vec![dhcp_vnic("ens37")]))
            .unwrap();

        manager
            .reconfigure_attachment(&name("plc-001"), "ens38")
            .unwrap();
    }

    #[test]
    fn reconcile_marks_missing_containers_as_orphans() {
        let mut engine = MockContainerEngine::new();
        engine.expect_inspect_container().returning(|_| Ok(None));

        let (manager, _dir) = manager(engine, Arc::new(InterfaceCache::new()));
        manager
            .registry()
            .put(name("plc-001"), RuntimeRecord::new(vec![]))
            .unwrap();

        manager.reconcile_on_start();
        assert_eq!(
            manager.registry().get(&name("plc-001")).unwrap().state,
            LifecycleState::Orphan
        );
    }

    #[test]
    fn inspect_reports_presence_and_addresses() {
        let mut engine = MockContainerEngine::new();
        inspect_returns(
            &mut engine,
            "plc-001",
            vec![
                ("plc-001_internal", "172.28.0.2"),
                ("macvlan_ens37_192.168.1.0_24", "192.168.1.73"),
            ],
        );

        let (manager, _dir) = manager(engine, Arc::new(InterfaceCache::new()));
        let status = manager.inspect_device(&name("plc-001")).unwrap();
        assert!(status.present);
        assert_eq!(status.internal_ip.as_deref(), Some("172.28.0.2"));
        assert_eq!(
            status.attachments.get("macvlan_ens37_192.168.1.0_24").map(String::as_str),
            Some("192.168.1.73")
        );
    }

    #[test]
    fn subnet_containment() {
        assert!(subnet_contains("192.168.1.0/24", "192.168.1.100"));
        assert!(!subnet_contains("10.0.0.0/24", "192.168.1.100"));
        assert!(subnet_contains("0.0.0.0/0", "8.8.8.8"));
        assert!(!subnet_contains("not-a-subnet", "192.168.1.100"));
    }

    #[test]
    fn network_names_follow_the_canonical_pattern() {
        assert_eq!(
            attachment_network_name("ens37", "192.168.1.0/24"),
            "macvlan_ens37_192.168.1.0_24"
        );
        assert_eq!(internal_network_name(&name("plc-001")), "plc-001_internal");
    }
}
