//! Authoritative state for managed runtime containers.
//!
//! The in-memory map is the source of truth; it is mirrored to a JSON file so
//! managed containers survive an agent restart. All mutations go through
//! [`store::RuntimeRegistry`].

pub mod store;
pub mod types;

pub use store::{RegistryError, RuntimeRegistry};
pub use types::{ContainerName, LifecycleState, NetworkMode, RuntimeRecord, VnicConfig};
