//! Typed topic dispatch for inbound cloud commands.
//!
//! Handlers are registered once at startup as `(topic, schema, handler)`.
//! Every inbound payload is validated against the topic's schema before the
//! handler runs; invalid messages never reach handlers. Replies are JSON
//! envelopes `{action, correlation_id, status, ...}` emitted back over the
//! session, on the topic they answer.
//!
//! `register` stays public on purpose: device-attachment and similar
//! capability extensions plug in additional topics without touching the
//! dispatch path.

use crate::cloud::{InboundMessage, SessionHandle};
use crate::contract::Schema;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// What a handler did with a valid command.
pub enum HandlerOutcome {
    /// Reply now; the value's fields are merged into the envelope. A
    /// `status` field overrides the default `success`.
    Reply(Value),
    /// The handler owns the reply and will emit it from a background task.
    Deferred,
}

#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    pub kind: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

pub type HandlerFn = Box<dyn Fn(&Value) -> Result<HandlerOutcome, HandlerError> + Send + Sync>;

pub struct Dispatcher {
    handlers: HashMap<String, (Schema, HandlerFn)>,
    session: SessionHandle,
}

impl Dispatcher {
    pub fn new(session: SessionHandle) -> Self {
        Self {
            handlers: HashMap::new(),
            session,
        }
    }

    pub fn register(&mut self, topic: &str, schema: Schema, handler: HandlerFn) {
        self.handlers.insert(topic.to_string(), (schema, handler));
    }

    pub fn topics(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Validates and runs the handler for one inbound command, emitting the
    /// reply envelope. Called in arrival order from the supervisor loop.
    pub fn dispatch(&self, message: InboundMessage) {
        let correlation_id = message.payload.get("correlation_id").cloned();

        let Some((schema, handler)) = self.handlers.get(&message.topic) else {
            warn!(topic = %message.topic, "unknown topic");
            self.reply(
                &message.topic,
                error_envelope(&message.topic, correlation_id, "unknown_topic", "no handler registered for topic", None),
            );
            return;
        };

        let payload = match schema.validate(&message.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic = %message.topic, field = %e.path, error_msg = %e, "payload failed validation");
                self.reply(
                    &message.topic,
                    error_envelope(
                        &message.topic,
                        correlation_id,
                        "validation_error",
                        &e.to_string(),
                        Some(&e.path),
                    ),
                );
                return;
            }
        };

        debug!(topic = %message.topic, "dispatching command");
        match handler(&payload) {
            Ok(HandlerOutcome::Reply(value)) => {
                self.reply(
                    &message.topic,
                    success_envelope(&message.topic, correlation_id, value),
                );
            }
            Ok(HandlerOutcome::Deferred) => {}
            Err(e) => {
                warn!(topic = %message.topic, kind = %e.kind, error_msg = %e.message, "handler failed");
                self.reply(
                    &message.topic,
                    error_envelope(&message.topic, correlation_id, &e.kind, &e.message, None),
                );
            }
        }
    }

    fn reply(&self, topic: &str, envelope: Value) {
        if !self.session.emit(topic, envelope) {
            debug!(topic, "session down, reply dropped");
        }
    }
}

fn base_envelope(action: &str, correlation_id: Option<Value>) -> Map<String, Value> {
    let mut envelope = Map::new();
    envelope.insert("action".to_string(), Value::String(action.to_string()));
    envelope.insert(
        "correlation_id".to_string(),
        correlation_id.unwrap_or(Value::Null),
    );
    envelope
}

/// Handler fields win over the defaults, so a handler can set its own
/// `status` (e.g. `creating`).
pub fn success_envelope(action: &str, correlation_id: Option<Value>, value: Value) -> Value {
    let mut envelope = base_envelope(action, correlation_id);
    envelope.insert("status".to_string(), json!("success"));
    if let Value::Object(fields) = value {
        envelope.extend(fields);
    } else if !value.is_null() {
        envelope.insert("result".to_string(), value);
    }
    Value::Object(envelope)
}

pub fn error_envelope(
    action: &str,
    correlation_id: Option<Value>,
    kind: &str,
    message: &str,
    field: Option<&str>,
) -> Value {
    let mut envelope = base_envelope(action, correlation_id);
    envelope.insert("status".to_string(), json!("error"));
    envelope.insert("error".to_string(), json!(kind));
    envelope.insert("message".to_string(), json!(message));
    if let Some(field) = field {
        envelope.insert("field".to_string(), json!(field));
    }
    Value::Object(envelope)
}
