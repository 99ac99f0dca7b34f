//! Topic handler registration.
//!
//! Each cloud topic gets its schema and handler here. Long-running work is
//! handed off to background threads so the inbound stream is never starved:
//! `create_new_runtime` acknowledges immediately and provisions in the
//! background, `run_command` defers its whole reply.

use crate::cloud::SessionHandle;
use crate::contract::{base_device, base_message, Schema, TypeSpec};
use crate::defaults::{
    TOPIC_CONNECT, TOPIC_CONSUMPTION_DEVICE, TOPIC_CONSUMPTION_ORCHESTRATOR, TOPIC_CREATE_RUNTIME,
    TOPIC_DELETE_DEVICE, TOPIC_DELETE_ORCHESTRATOR, TOPIC_DISCONNECT, TOPIC_INSPECT_DEVICE,
    TOPIC_RUN_COMMAND,
};
use crate::dispatcher::{error_envelope, success_envelope, Dispatcher, HandlerError, HandlerOutcome};
use crate::lifecycle::engine::ContainerEngine;
use crate::lifecycle::runtime::{DeleteOutcome, RuntimeManager};
use crate::metrics::MetricsSampler;
use crate::proxy::RuntimeProxy;
use crate::registry::{ContainerName, VnicConfig};
use crate::utils::threads::spawn_named_thread;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};

/// Starts the telemetry emitter at most once, from whichever side asks
/// first (the `connect` command or the session's own connected event).
pub struct EmitterStarter {
    emitter: std::sync::Mutex<Option<crate::telemetry::TelemetryEmitter>>,
}

impl EmitterStarter {
    pub fn new(emitter: crate::telemetry::TelemetryEmitter) -> Self {
        Self {
            emitter: std::sync::Mutex::new(Some(emitter)),
        }
    }

    pub fn start_if_not_running(&self) {
        if let Some(emitter) = self.emitter.lock().expect("emitter lock poisoned").take() {
            info!("starting telemetry emitter");
            spawn_named_thread("telemetry-emitter", move || emitter.run());
        }
    }
}

fn vnic_schema() -> Schema {
    Schema::new()
        .field("name", TypeSpec::String)
        .field("parent_interface", TypeSpec::String)
        .field("network_mode", TypeSpec::String)
        .field("parent_subnet", TypeSpec::Optional(Box::new(TypeSpec::String)))
        .field("parent_gateway", TypeSpec::Optional(Box::new(TypeSpec::String)))
        .field("ip_address", TypeSpec::Optional(Box::new(TypeSpec::String)))
        .field("subnet", TypeSpec::Optional(Box::new(TypeSpec::String)))
        .field("gateway", TypeSpec::Optional(Box::new(TypeSpec::String)))
        .field(
            "dns",
            TypeSpec::Optional(Box::new(TypeSpec::List(Box::new(TypeSpec::String)))),
        )
        .field("mac_address", TypeSpec::Optional(Box::new(TypeSpec::String)))
}

fn create_schema() -> Schema {
    base_message()
        .field("container_name", TypeSpec::String)
        .field(
            "vnic_configs",
            TypeSpec::List(Box::new(TypeSpec::Object(vnic_schema()))),
        )
}

fn run_command_schema() -> Schema {
    base_device()
        .field("path", TypeSpec::Optional(Box::new(TypeSpec::String)))
        .field(
            "command",
            TypeSpec::Optional(Box::new(TypeSpec::Object(Schema::new()))),
        )
}

fn container_name(payload: &Value, field: &str) -> Result<ContainerName, HandlerError> {
    let raw = payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerError::new("validation_error", format!("`{field}` is required")))?;
    ContainerName::new(raw)
        .map_err(|e| HandlerError::new("validation_error", format!("`{field}`: {e}")))
}

pub fn register_handlers<E>(
    dispatcher: &mut Dispatcher,
    manager: Arc<RuntimeManager<E>>,
    sampler: Arc<MetricsSampler>,
    proxy: Arc<RuntimeProxy>,
    session: SessionHandle,
    emitter_starter: Arc<EmitterStarter>,
) where
    E: ContainerEngine + Send + Sync + 'static,
{
    // create_new_runtime: immediate ack, background provisioning.
    let create_manager = manager.clone();
    dispatcher.register(
        TOPIC_CREATE_RUNTIME,
        create_schema(),
        Box::new(move |payload| {
            let name = container_name(payload, "container_name")?;
            let vnics: Vec<VnicConfig> =
                serde_json::from_value(payload["vnic_configs"].clone()).map_err(|e| {
                    HandlerError::new("validation_error", format!("`vnic_configs`: {e}"))
                })?;

            create_manager
                .create_runtime(name.clone(), vnics)
                .map_err(|e| HandlerError::new(e.kind(), e.to_string()))?;

            Ok(HandlerOutcome::Reply(json!({
                "status": "creating",
                "container_id": name.to_string(),
            })))
        }),
    );

    let delete_manager = manager.clone();
    dispatcher.register(
        TOPIC_DELETE_DEVICE,
        base_device(),
        Box::new(move |payload| {
            let name = container_name(payload, "device_id")?;
            let outcome = delete_manager
                .delete_device(&name)
                .map_err(|e| HandlerError::new(e.kind(), e.to_string()))?;
            let result = match outcome {
                DeleteOutcome::Deleted => "deleted",
                DeleteOutcome::AlreadyAbsent => "already_absent",
            };
            Ok(HandlerOutcome::Reply(json!({ "result": result })))
        }),
    );

    let inspect_manager = manager.clone();
    dispatcher.register(
        TOPIC_INSPECT_DEVICE,
        base_device(),
        Box::new(move |payload| {
            let name = container_name(payload, "device_id")?;
            let status = inspect_manager
                .inspect_device(&name)
                .map_err(|e| HandlerError::new(e.kind(), e.to_string()))?;
            let device = serde_json::to_value(status)
                .map_err(|e| HandlerError::new("engine_error", e.to_string()))?;
            Ok(HandlerOutcome::Reply(json!({ "device": device })))
        }),
    );

    // delete_orchestrator: acknowledge, then remove our own container. The
    // reply races the removal by design; it may or may not arrive.
    let self_manager = manager.clone();
    dispatcher.register(
        TOPIC_DELETE_ORCHESTRATOR,
        base_message(),
        Box::new(move |_| {
            let manager = self_manager.clone();
            spawn_named_thread("self-remove", move || {
                if let Err(e) = manager.remove_self() {
                    error!(error_msg = %e, "orchestrator self-removal failed");
                }
            });
            Ok(HandlerOutcome::Reply(json!({"status": "success"})))
        }),
    );

    // run_command: proxied to the runtime's API; the reply is emitted from
    // the proxy thread so slow runtimes cannot starve the inbound stream.
    let proxy_manager = manager.clone();
    let proxy_session = session;
    dispatcher.register(
        TOPIC_RUN_COMMAND,
        run_command_schema(),
        Box::new(move |payload| {
            let name = container_name(payload, "device_id")?;
            let correlation_id = payload.get("correlation_id").cloned();
            let path = payload
                .get("path")
                .and_then(Value::as_str)
                .unwrap_or("/")
                .to_string();
            let command = payload.get("command").cloned().unwrap_or(json!({}));

            let manager = proxy_manager.clone();
            let proxy = proxy.clone();
            let session = proxy_session.clone();
            spawn_named_thread(format!("run-command-{name}"), move || {
                let envelope = match manager.internal_ip(&name) {
                    Some(internal_ip) => match proxy.forward(&internal_ip, &path, &command) {
                        Ok(response) => success_envelope(TOPIC_RUN_COMMAND, correlation_id, response),
                        Err(e) => error_envelope(
                            TOPIC_RUN_COMMAND,
                            correlation_id,
                            "runtime_unreachable",
                            &e.to_string(),
                            None,
                        ),
                    },
                    None => error_envelope(
                        TOPIC_RUN_COMMAND,
                        correlation_id,
                        "runtime_unreachable",
                        &format!("no internal address recorded for `{name}`"),
                        None,
                    ),
                };
                session.emit(TOPIC_RUN_COMMAND, envelope);
            });
            Ok(HandlerOutcome::Deferred)
        }),
    );

    let stats_manager = manager;
    dispatcher.register(
        TOPIC_CONSUMPTION_DEVICE,
        base_device().field("window", TypeSpec::Optional(Box::new(TypeSpec::Number))),
        Box::new(move |payload| {
            let name = container_name(payload, "device_id")?;
            let stats = stats_manager
                .device_stats(&name)
                .map_err(|e| HandlerError::new(e.kind(), e.to_string()))?;
            Ok(HandlerOutcome::Reply(json!({
                "device_id": name.to_string(),
                "cpu_usage": stats.cpu_percent,
                "memory_usage": stats.memory_usage_bytes,
                "memory_limit": stats.memory_limit_bytes,
                "window": payload.get("window").cloned().unwrap_or(Value::Null),
            })))
        }),
    );

    dispatcher.register(
        TOPIC_CONSUMPTION_ORCHESTRATOR,
        base_message().field("window", TypeSpec::Optional(Box::new(TypeSpec::Number))),
        Box::new(move |payload| {
            Ok(HandlerOutcome::Reply(json!({
                "cpu_usage": sampler.cpu_usage_percent(),
                "memory_usage": sampler.memory_used_bytes(),
                "memory_total": sampler.memory_total_bytes(),
                "disk_usage": sampler.disk_used_bytes(),
                "disk_total": sampler.disk_total_bytes(),
                "uptime": sampler.uptime_seconds(),
                "window": payload.get("window").cloned().unwrap_or(Value::Null),
            })))
        }),
    );

    dispatcher.register(
        TOPIC_CONNECT,
        base_message(),
        Box::new(move |_| {
            emitter_starter.start_if_not_running();
            Ok(HandlerOutcome::Reply(json!({})))
        }),
    );

    dispatcher.register(
        TOPIC_DISCONNECT,
        base_message(),
        Box::new(|_| {
            info!("cloud requested session disconnect");
            Ok(HandlerOutcome::Reply(json!({})))
        }),
    );
}
