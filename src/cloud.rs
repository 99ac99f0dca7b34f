//! The control channel to the cloud controller.
//!
//! The wire protocol is a single authenticated WebSocket carrying JSON
//! envelopes `{topic, payload}` in both directions. The binding contract is
//! the topic names and payload schemas, not the framing.

pub mod session;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub topic: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: serde_json::Value,
}

pub use session::{CloudSession, SessionHandle};
