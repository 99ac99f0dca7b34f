//! The reconnecting cloud session.
//!
//! One session at a time, authenticated with the agent's client certificate.
//! Disconnects of any kind feed the same reconnect loop: exponential backoff
//! clamped to 1-5 seconds with jitter, forever. There is no outbound queue
//! across disconnects: [`SessionHandle::emit`] drops messages while the
//! session is down and the next heartbeat carries fresh state.

use super::{InboundMessage, OutboundMessage};
use crate::defaults::{SESSION_BACKOFF_MAX, SESSION_BACKOFF_MIN};
use crate::event::channel::EventPublisher;
use crate::event::CloudEvent;
use crate::utils::backoff::Backoff;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::Connector;
use tracing::{debug, info, warn};
use url::Url;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Cheap clonable emit-side of the session.
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::UnboundedSender<OutboundMessage>,
    connected: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Hands the message to the session. Returns false when it was dropped
    /// because the session is down.
    pub fn emit(&self, topic: &str, payload: serde_json::Value) -> bool {
        if !self.is_connected() {
            debug!(topic, "session down, dropping outbound message");
            return false;
        }
        self.sender
            .send(OutboundMessage {
                topic: topic.to_string(),
                payload,
            })
            .is_ok()
    }
}

#[cfg(test)]
impl SessionHandle {
    pub(crate) fn for_tests(
        sender: mpsc::UnboundedSender<OutboundMessage>,
        connected: Arc<AtomicBool>,
    ) -> Self {
        Self { sender, connected }
    }
}

/// Stops the session loop. Cloneable so the signal handler and the
/// supervisor can both hold one.
#[derive(Clone)]
pub struct SessionShutdown(watch::Sender<bool>);

impl SessionShutdown {
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

pub struct CloudSession {
    server_url: Url,
    tls_config: Arc<rustls::ClientConfig>,
    runtime: Arc<Runtime>,
    cloud_publisher: EventPublisher<CloudEvent>,
    outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    connected: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
}

impl CloudSession {
    /// Builds the session plus its emit handle and shutdown lever.
    pub fn new(
        server_url: Url,
        tls_config: Arc<rustls::ClientConfig>,
        runtime: Arc<Runtime>,
        cloud_publisher: EventPublisher<CloudEvent>,
    ) -> (Self, SessionHandle, SessionShutdown) {
        let (sender, outbound) = mpsc::unbounded_channel();
        let (shutdown_sender, shutdown) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(false));

        let handle = SessionHandle {
            sender,
            connected: connected.clone(),
        };
        let session = Self {
            server_url,
            tls_config,
            runtime,
            cloud_publisher,
            outbound,
            connected,
            shutdown,
        };
        (session, handle, SessionShutdown(shutdown_sender))
    }

    /// Connect-drive-reconnect until shut down. Intended to run on its own
    /// thread; the held runtime does the async work.
    pub fn run(mut self) {
        let runtime = self.runtime.clone();
        runtime.block_on(async move {
            let mut backoff = Backoff::default()
                .with_initial_delay(SESSION_BACKOFF_MIN)
                .with_max_delay(SESSION_BACKOFF_MAX)
                .with_jitter();

            loop {
                if *self.shutdown.borrow() {
                    break;
                }

                match self.connect().await {
                    Ok(ws) => {
                        info!(server = %self.server_url, "cloud session established");
                        self.drain_stale_outbound();
                        self.connected.store(true, Ordering::SeqCst);
                        self.publish(CloudEvent::Connected);

                        self.drive(ws).await;

                        self.connected.store(false, Ordering::SeqCst);
                        self.publish(CloudEvent::Disconnected);
                    }
                    Err(e) => {
                        warn!(server = %self.server_url, error_msg = %e, "cloud connection failed");
                    }
                }

                if *self.shutdown.borrow() {
                    break;
                }
                let mut delay = Duration::ZERO;
                backoff.backoff(|d| delay = d);
                debug!(delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.shutdown.changed() => {}
                }
            }
            self.connected.store(false, Ordering::SeqCst);
            info!("cloud session stopped");
        });
    }

    async fn connect(
        &self,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        tokio_tungstenite::tungstenite::Error,
    > {
        let (ws, _response) = tokio_tungstenite::connect_async_tls_with_config(
            self.server_url.as_str(),
            None,
            false,
            Some(Connector::Rustls(self.tls_config.clone())),
        )
        .await?;
        Ok(ws)
    }

    async fn drive(
        &mut self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) {
        let (mut sink, mut stream) = ws.split();
        let publisher = self.cloud_publisher.clone();
        let outbound = &mut self.outbound;
        let mut shutdown = self.shutdown.clone();
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                queued = outbound.recv() => {
                    let Some(message) = queued else { return };
                    let Ok(text) = serde_json::to_string(&message) else { continue };
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        warn!(error_msg = %e, "cloud send failed");
                        return;
                    }
                }
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => handle_text(&publisher, &text),
                        Some(Ok(Message::Ping(data))) => {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("cloud session closed by peer");
                            return;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error_msg = %e, "cloud receive failed");
                            return;
                        }
                    }
                }
                _ = keepalive.tick() => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        return;
                    }
                }
                _ = shutdown.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
            }
        }
    }

    /// Messages queued while disconnected carry stale state; drop them.
    fn drain_stale_outbound(&mut self) {
        while self.outbound.try_recv().is_ok() {}
    }

    fn publish(&self, event: CloudEvent) {
        let _ = self
            .cloud_publisher
            .publish(event)
            .inspect_err(|e| warn!(error_msg = %e, "cannot publish cloud event"));
    }
}

fn handle_text(publisher: &EventPublisher<CloudEvent>, text: &str) {
    match serde_json::from_str::<InboundMessage>(text) {
        Ok(message) => {
            debug!(topic = %message.topic, "inbound cloud command");
            let _ = publisher
                .publish(CloudEvent::CommandReceived(message))
                .inspect_err(|e| warn!(error_msg = %e, "cannot publish cloud event"));
        }
        Err(e) => warn!(error_msg = %e, "skipping malformed cloud message"),
    }
}
