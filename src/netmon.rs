//! Consumer side of the network-monitor sidecar.
//!
//! The sidecar publishes host-interface state over a local event stream; the
//! agent keeps an in-memory picture of it ([`cache::InterfaceCache`]) and
//! reacts to per-interface changes by rewriting container attachments
//! ([`reconfigure`]).

pub mod cache;
pub mod reconfigure;
pub mod stream;

pub use cache::{InterfaceCache, InterfaceState, Ipv4Address};
pub use reconfigure::ReconfigureLoop;
pub use stream::NetmonClient;
