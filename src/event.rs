//! Event types used for communication between the agent's components.
//!
//! Components exchange events over crossbeam channels wrapped by the
//! publisher/consumer pair in [`channel`].

pub mod cancellation;
pub mod channel;

use crate::cloud::InboundMessage;

/// Events sent directly to the application. Eg: OS-signals.
#[derive(Clone, Debug, PartialEq)]
pub enum ApplicationEvent {
    StopRequested,
}

/// Events produced by the cloud session.
#[derive(Clone, Debug, PartialEq)]
pub enum CloudEvent {
    Connected,
    Disconnected,
    CommandReceived(InboundMessage),
}

/// Events produced by the network-monitor stream client.
///
/// Discovery replaces the interface cache in place; only per-interface
/// changes are forwarded, carrying the interface name so the consumer can
/// debounce per interface.
#[derive(Clone, Debug, PartialEq)]
pub enum NetworkEvent {
    InterfaceChanged(String),
}
