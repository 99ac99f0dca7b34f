//! Docker-backed [`ContainerEngine`].
//!
//! A sync facade over the async bollard client: every method drives the held
//! runtime with `block_on`, so callers stay on plain threads. The per-call
//! timeout is enforced by the client itself (configured at connect time).

use super::engine::{
    ContainerDetails, ContainerEngine, ContainerSpec, EndpointOptions, EngineError, NetworkSpec,
    NetworkSummary, StatsSample,
};
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, Stats, StatsOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointIpamConfig, EndpointSettings, HostConfig, Ipam, IpamConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions, InspectNetworkOptions,
    ListNetworksOptions,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use futures::TryStreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

pub struct DockerEngine {
    client: Docker,
    runtime: Arc<Runtime>,
}

impl DockerEngine {
    pub fn new(
        socket: &Path,
        call_timeout: Duration,
        runtime: Arc<Runtime>,
    ) -> Result<Self, EngineError> {
        let client = Docker::connect_with_socket(
            &socket.to_string_lossy(),
            call_timeout.as_secs(),
            API_DEFAULT_VERSION,
        )
        .map_err(api_error)?;
        Ok(Self { client, runtime })
    }
}

fn api_error(e: BollardError) -> EngineError {
    EngineError::Api(e.to_string())
}

fn is_not_found(e: &BollardError) -> bool {
    matches!(
        e,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Docker reports macvlan pool collisions with a 403/500 mentioning the pool.
fn is_pool_overlap(e: &BollardError) -> bool {
    e.to_string().to_lowercase().contains("overlap")
}

impl ContainerEngine for DockerEngine {
    fn pull_image(&self, reference: &str) -> Result<(), EngineError> {
        self.runtime.block_on(async {
            self.client
                .create_image(
                    Some(CreateImageOptions {
                        from_image: reference,
                        ..Default::default()
                    }),
                    None,
                    None,
                )
                .try_collect::<Vec<_>>()
                .await
                .map(|_| ())
                .map_err(api_error)
        })
    }

    fn image_exists(&self, reference: &str) -> Result<bool, EngineError> {
        self.runtime
            .block_on(async { self.client.inspect_image(reference).await })
            .map(|_| true)
            .or_else(|e| if is_not_found(&e) { Ok(false) } else { Err(api_error(e)) })
    }

    fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let config = Config {
            image: Some(spec.image.clone()),
            host_config: Some(HostConfig {
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::ALWAYS),
                    maximum_retry_count: None,
                }),
                // Created detached from every network; the caller connects
                // internal and attachment networks explicitly.
                network_mode: Some("none".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.runtime
            .block_on(self.client.create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            ))
            .map(|response| response.id)
            .map_err(api_error)
    }

    fn start_container(&self, name: &str) -> Result<(), EngineError> {
        self.runtime
            .block_on(
                self.client
                    .start_container(name, None::<StartContainerOptions<String>>),
            )
            .map_err(api_error)
    }

    fn remove_container(&self, name: &str) -> Result<bool, EngineError> {
        let result = self.runtime.block_on(self.client.remove_container(
            name,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        ));
        match result {
            Ok(()) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(api_error(e)),
        }
    }

    fn create_network(&self, spec: &NetworkSpec) -> Result<(), EngineError> {
        let options = match spec {
            NetworkSpec::InternalBridge { name } => CreateNetworkOptions {
                name: name.clone(),
                driver: "bridge".to_string(),
                internal: true,
                ..Default::default()
            },
            NetworkSpec::Macvlan {
                name,
                parent_interface,
                subnet,
                gateway,
            } => CreateNetworkOptions {
                name: name.clone(),
                driver: "macvlan".to_string(),
                options: HashMap::from([("parent".to_string(), parent_interface.clone())]),
                ipam: Ipam {
                    driver: Some("default".to_string()),
                    config: Some(vec![IpamConfig {
                        subnet: Some(subnet.clone()),
                        gateway: gateway.clone(),
                        ..Default::default()
                    }]),
                    options: None,
                },
                ..Default::default()
            },
        };
        let result = self.runtime.block_on(self.client.create_network(options));
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_pool_overlap(&e) => Err(EngineError::PoolOverlap),
            Err(e) => Err(api_error(e)),
        }
    }

    fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        match self.runtime.block_on(self.client.remove_network(name)) {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(api_error(e)),
        }
    }

    fn list_networks(&self) -> Result<Vec<NetworkSummary>, EngineError> {
        let networks = self
            .runtime
            .block_on(
                self.client
                    .list_networks(None::<ListNetworksOptions<String>>),
            )
            .map_err(api_error)?;

        Ok(networks
            .into_iter()
            .map(|network| NetworkSummary {
                name: network.name.unwrap_or_default(),
                driver: network.driver.unwrap_or_default(),
                parent_interface: network
                    .options
                    .as_ref()
                    .and_then(|options| options.get("parent").cloned()),
                subnets: network
                    .ipam
                    .and_then(|ipam| ipam.config)
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|config| config.subnet)
                    .collect(),
            })
            .collect())
    }

    fn network_attachment_count(&self, network: &str) -> Result<usize, EngineError> {
        self.runtime
            .block_on(self.client.inspect_network(
                network,
                Some(InspectNetworkOptions::<String> {
                    verbose: true,
                    ..Default::default()
                }),
            ))
            .map(|details| details.containers.map(|c| c.len()).unwrap_or(0))
            .map_err(api_error)
    }

    fn connect_network(
        &self,
        network: &str,
        container: &str,
        options: &EndpointOptions,
    ) -> Result<(), EngineError> {
        let endpoint_config = EndpointSettings {
            ipam_config: options.ipv4_address.as_ref().map(|ip| EndpointIpamConfig {
                ipv4_address: Some(ip.clone()),
                ..Default::default()
            }),
            mac_address: options.mac_address.clone(),
            ..Default::default()
        };
        self.runtime
            .block_on(self.client.connect_network(
                network,
                ConnectNetworkOptions {
                    container,
                    endpoint_config,
                },
            ))
            .map_err(api_error)
    }

    fn disconnect_network(&self, network: &str, container: &str) -> Result<(), EngineError> {
        self.runtime
            .block_on(self.client.disconnect_network(
                network,
                DisconnectNetworkOptions {
                    container,
                    force: false,
                },
            ))
            .map_err(api_error)
    }

    fn inspect_container(&self, name: &str) -> Result<Option<ContainerDetails>, EngineError> {
        let result = self.runtime.block_on(
            self.client
                .inspect_container(name, None::<InspectContainerOptions>),
        );
        let details = match result {
            Ok(details) => details,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(api_error(e)),
        };

        let networks = details
            .network_settings
            .and_then(|settings| settings.networks)
            .unwrap_or_default()
            .into_iter()
            .map(|(name, endpoint)| (name, endpoint.ip_address.unwrap_or_default()))
            .collect();

        Ok(Some(ContainerDetails {
            id: details.id.unwrap_or_default(),
            state: details
                .state
                .and_then(|state| state.status)
                .map(|status| status.to_string())
                .unwrap_or_default(),
            networks,
        }))
    }

    fn container_stats(&self, name: &str) -> Result<StatsSample, EngineError> {
        let stats = self
            .runtime
            .block_on(async {
                self.client
                    .stats(
                        name,
                        Some(StatsOptions {
                            stream: false,
                            one_shot: true,
                        }),
                    )
                    .next()
                    .await
            })
            .ok_or_else(|| EngineError::Api("no stats sample returned".to_string()))?
            .map_err(api_error)?;

        Ok(StatsSample {
            cpu_percent: cpu_percent(&stats),
            memory_usage_bytes: stats.memory_stats.usage.unwrap_or(0),
            memory_limit_bytes: stats.memory_stats.limit.unwrap_or(0),
        })
    }
}

/// Usage delta between the sample and its predecessor, scaled to the number
/// of online CPUs (the engine's own `docker stats` formula).
fn cpu_percent(stats: &Stats) -> f64 {
    let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as f64
        - stats.precpu_stats.cpu_usage.total_usage as f64;
    let system_delta = match (
        stats.cpu_stats.system_cpu_usage,
        stats.precpu_stats.system_cpu_usage,
    ) {
        (Some(current), Some(previous)) if current > previous => (current - previous) as f64,
        _ => return 0.0,
    };
    let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1) as f64;
    (cpu_delta / system_delta) * online_cpus * 100.0
}
