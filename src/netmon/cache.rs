//! In-memory picture of the host's interfaces as reported by the sidecar.
//!
//! The stream client is the single writer; everyone else reads through
//! [`InterfaceCache::lookup`]. Loopback, engine bridges and veth-family
//! interfaces are kept for diagnostics but never returned by `lookup`, and
//! neither are interfaces that are down or have no IPv4 address.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Ipv4Address {
    pub address: String,
    pub prefixlen: u8,
    /// CIDR of the containing subnet, e.g. `192.168.1.0/24`.
    pub subnet: String,
    pub network_address: String,
}

/// One host interface as last reported by the sidecar.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InterfaceState {
    pub interface: String,
    #[serde(default)]
    pub index: i64,
    pub operstate: String,
    #[serde(default)]
    pub ipv4_addresses: Vec<Ipv4Address>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl InterfaceState {
    pub fn is_up(&self) -> bool {
        self.operstate == "UP"
    }

    /// Subnet of the first IPv4 address, the one attachments bind to.
    pub fn primary_subnet(&self) -> Option<&str> {
        self.ipv4_addresses.first().map(|a| a.subnet.as_str())
    }
}

#[derive(Default)]
pub struct InterfaceCache {
    interfaces: RwLock<HashMap<String, InterfaceState>>,
}

impl InterfaceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole cache with a fresh discovery snapshot.
    pub fn apply_discovery(&self, interfaces: Vec<InterfaceState>) {
        let mut cache = self.interfaces.write().expect("interface cache poisoned");
        *cache = interfaces
            .into_iter()
            .map(|state| (state.interface.clone(), state))
            .collect();
    }

    /// Updates a single interface in place.
    pub fn apply_change(&self, state: InterfaceState) {
        self.interfaces
            .write()
            .expect("interface cache poisoned")
            .insert(state.interface.clone(), state);
    }

    /// Returns the interface only if it is actionable: known, UP, carrying
    /// at least one IPv4 address, and not an infrastructure interface.
    pub fn lookup(&self, interface: &str) -> Option<InterfaceState> {
        if is_infrastructure_interface(interface) {
            return None;
        }
        let cache = self.interfaces.read().expect("interface cache poisoned");
        cache
            .get(interface)
            .filter(|state| state.is_up() && !state.ipv4_addresses.is_empty())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.interfaces
            .read()
            .expect("interface cache poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Interfaces that never carry container attachments: loopback, engine
/// bridges, and the veth pairs the engine fabricates per container.
fn is_infrastructure_interface(name: &str) -> bool {
    name == "lo"
        || name == "docker0"
        || name.starts_with("br-")
        || name.starts_with("veth")
        || name.starts_with("docker_gwbridge")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn up_interface(name: &str, subnet: &str) -> InterfaceState {
        InterfaceState {
            interface: name.to_string(),
            index: 2,
            operstate: "UP".to_string(),
            ipv4_addresses: vec![Ipv4Address {
                address: format!("{}.10", subnet.rsplit_once('.').unwrap().0),
                prefixlen: 24,
                subnet: subnet.to_string(),
                network_address: subnet.split('/').next().unwrap().to_string(),
            }],
            gateway: Some("192.168.1.1".to_string()),
            timestamp: None,
        }
    }

    #[test]
    fn discovery_replaces_previous_content() {
        let cache = InterfaceCache::new();
        cache.apply_discovery(vec![up_interface("ens37", "192.168.1.0/24")]);
        cache.apply_discovery(vec![up_interface("ens38", "10.0.0.0/24")]);

        assert!(cache.lookup("ens37").is_none());
        assert!(cache.lookup("ens38").is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn change_updates_one_entry() {
        let cache = InterfaceCache::new();
        cache.apply_discovery(vec![up_interface("ens37", "192.168.1.0/24")]);
        cache.apply_change(up_interface("ens37", "10.0.0.0/24"));

        let state = cache.lookup("ens37").unwrap();
        assert_eq!(state.primary_subnet(), Some("10.0.0.0/24"));
    }

    #[test]
    fn down_interfaces_are_cached_but_not_returned() {
        let cache = InterfaceCache::new();
        let mut state = up_interface("ens37", "192.168.1.0/24");
        state.operstate = "DOWN".to_string();
        cache.apply_change(state);

        assert_eq!(cache.len(), 1);
        assert!(cache.lookup("ens37").is_none());
    }

    #[test]
    fn interfaces_without_ipv4_are_not_returned() {
        let cache = InterfaceCache::new();
        let mut state = up_interface("ens37", "192.168.1.0/24");
        state.ipv4_addresses.clear();
        cache.apply_change(state);

        assert!(cache.lookup("ens37").is_none());
    }

    #[test]
    fn infrastructure_interfaces_are_filtered() {
        let cache = InterfaceCache::new();
        for name in ["lo", "docker0", "br-2f1e83a91d6b", "veth1a2b3c4"] {
            cache.apply_change(up_interface(name, "192.168.1.0/24"));
            assert!(cache.lookup(name).is_none(), "{name} must be filtered");
        }
        assert_eq!(cache.len(), 4);
    }
}
