//! Builds and runs the whole agent.
//!
//! Startup order: identity (fail fast), engine client, registry (+ startup
//! reconciliation), network monitor, reconfiguration loop, dispatcher, cloud
//! session. Shutdown order is the reverse of what matters: stop the session
//! first so no new commands arrive, then drain the reconfiguration pool,
//! then let everything else wind down.

use super::error::OrchestratorError;
use super::handlers::{register_handlers, EmitterStarter};
use crate::cloud::CloudSession;
use crate::config::AgentConfig;
use crate::dispatcher::Dispatcher;
use crate::event::cancellation::CancellationMessage;
use crate::event::channel::{pub_sub, EventConsumer, EventPublisher};
use crate::event::{ApplicationEvent, CloudEvent};
use crate::identity::Identity;
use crate::lifecycle::docker::DockerEngine;
use crate::lifecycle::operations::OperationTracker;
use crate::lifecycle::runtime::RuntimeManager;
use crate::metrics::MetricsSampler;
use crate::netmon::{InterfaceCache, NetmonClient, ReconfigureLoop};
use crate::proxy::RuntimeProxy;
use crate::registry::RuntimeRegistry;
use crate::telemetry::TelemetryEmitter;
use crate::utils::threads::spawn_named_thread;
use crossbeam::select;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct OrchestratorRunner {
    config: AgentConfig,
    application_event_consumer: EventConsumer<ApplicationEvent>,
}

impl OrchestratorRunner {
    pub fn new(
        config: AgentConfig,
        application_event_consumer: EventConsumer<ApplicationEvent>,
    ) -> Self {
        Self {
            config,
            application_event_consumer,
        }
    }

    pub fn run(self) -> Result<(), OrchestratorError> {
        let Self {
            config,
            application_event_consumer,
        } = self;

        let identity = Identity::load(&config.credentials_dir())?;
        info!(agent_id = identity.agent_id(), "agent identity loaded");

        let runtime = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|e| OrchestratorError::Runtime(e.to_string()))?,
        );

        let engine = DockerEngine::new(&config.engine_socket, config.engine_timeout, runtime.clone())?;

        let registry = Arc::new(RuntimeRegistry::load(&config.registry_path()));
        info!(containers = registry.len(), "runtime registry loaded");

        let interfaces = Arc::new(InterfaceCache::new());
        let manager = Arc::new(RuntimeManager::new(
            engine,
            registry,
            OperationTracker::new(),
            interfaces.clone(),
            config.runtime_image.clone(),
            own_container_name(),
        ));
        manager.reconcile_on_start();

        // Network monitor stream client.
        let (network_publisher, network_consumer) = pub_sub();
        let (netmon_cancel, netmon_cancelled) = pub_sub::<CancellationMessage>();
        let netmon_client = NetmonClient::new(
            config.netmon_socket.clone(),
            interfaces.clone(),
            network_publisher,
            netmon_cancelled,
        );
        let netmon_thread = spawn_named_thread("netmon-client", move || netmon_client.run());

        // Debounced reconfiguration loop with its worker pool.
        let (reconfigure_cancel, reconfigure_cancelled) = pub_sub::<CancellationMessage>();
        let reconfigure_thread = crate::netmon::reconfigure::start(ReconfigureLoop::new(
            manager.clone(),
            interfaces,
            network_consumer,
            reconfigure_cancelled,
            config.debounce_window,
            config.reconfigure_concurrency,
        ));

        // Cloud session.
        let (cloud_publisher, cloud_consumer) = pub_sub::<CloudEvent>();
        let (session, session_handle, session_shutdown) = CloudSession::new(
            config.server_url.clone(),
            identity.tls_config(),
            runtime,
            cloud_publisher,
        );
        let session_thread = spawn_named_thread("cloud-session", move || session.run());

        // Telemetry, started lazily on first connect.
        let sampler = Arc::new(MetricsSampler::new());
        let (emitter_cancel, emitter_cancelled) = pub_sub::<CancellationMessage>();
        let emitter_starter = Arc::new(EmitterStarter::new(TelemetryEmitter::new(
            identity.agent_id().to_string(),
            sampler.clone(),
            session_handle.clone(),
            config.heartbeat_interval,
            emitter_cancelled,
        )));

        let mut dispatcher = Dispatcher::new(session_handle.clone());
        register_handlers(
            &mut dispatcher,
            manager,
            sampler,
            Arc::new(RuntimeProxy::new()?),
            session_handle,
            emitter_starter.clone(),
        );

        info!("orchestrator agent started");
        process_events(
            dispatcher,
            cloud_consumer,
            emitter_starter,
            application_event_consumer,
        );

        info!("stopping: closing cloud session");
        session_shutdown.shutdown();
        let _ = session_thread.join();

        info!("stopping: draining reconfiguration workers");
        let _ = reconfigure_cancel.publish(());
        let _ = reconfigure_thread.join();

        let _ = netmon_cancel.publish(());
        let _ = netmon_thread.join();
        let _ = emitter_cancel.publish(());

        info!("orchestrator agent stopped");
        Ok(())
    }
}

/// The main loop: commands in arrival order, session state transitions, and
/// the stop signal.
fn process_events(
    dispatcher: Dispatcher,
    cloud_consumer: EventConsumer<CloudEvent>,
    emitter_starter: Arc<EmitterStarter>,
    application_events: EventConsumer<ApplicationEvent>,
) {
    loop {
        select! {
            recv(cloud_consumer.as_ref()) -> cloud_event => {
                match cloud_event {
                    Ok(CloudEvent::Connected) => {
                        info!("cloud session connected");
                        emitter_starter.start_if_not_running();
                    }
                    Ok(CloudEvent::Disconnected) => {
                        debug!("cloud session disconnected");
                    }
                    Ok(CloudEvent::CommandReceived(message)) => {
                        dispatcher.dispatch(message);
                    }
                    Err(_) => {
                        warn!("cloud event channel closed");
                        return;
                    }
                }
            }
            recv(application_events.as_ref()) -> _ => {
                info!("stop requested");
                return;
            }
        }
    }
}

/// The agent's own container name. Inside a container the hostname is the
/// container id; outside one it is just the host's name and engine lookups
/// will miss, which is handled downstream.
fn own_container_name() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
}

/// Publishes a stop request on SIGINT/SIGTERM.
pub fn create_shutdown_signal_handler(
    publisher: EventPublisher<ApplicationEvent>,
) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        info!("termination signal received, stopping orchestrator agent");
        let _ = publisher
            .publish(ApplicationEvent::StopRequested)
            .inspect_err(|e| tracing::error!(error_msg = %e, "could not send stop request"));
    })
}
