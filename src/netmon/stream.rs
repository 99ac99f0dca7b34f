//! Client for the network-monitor event stream.
//!
//! Connects to the sidecar's Unix socket and consumes newline-delimited JSON
//! events. The socket being absent is normal at boot (the sidecar may start
//! later): the client retries with backoff instead of failing. Malformed
//! lines and unknown event types are logged and skipped; EOF triggers a
//! reconnect.

use super::cache::{InterfaceCache, InterfaceState};
use crate::defaults::NETMON_RETRY_INTERVAL;
use crate::event::cancellation::CancellationMessage;
use crate::event::channel::{EventConsumer, EventPublisher};
use crate::event::NetworkEvent;
use crate::utils::backoff::Backoff;
use serde::Deserialize;
use std::io::BufRead;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const READ_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
struct DiscoveryData {
    interfaces: Vec<InterfaceState>,
}

pub struct NetmonClient {
    socket_path: PathBuf,
    cache: Arc<InterfaceCache>,
    network_publisher: EventPublisher<NetworkEvent>,
    cancellation: EventConsumer<CancellationMessage>,
}

impl NetmonClient {
    pub fn new(
        socket_path: PathBuf,
        cache: Arc<InterfaceCache>,
        network_publisher: EventPublisher<NetworkEvent>,
        cancellation: EventConsumer<CancellationMessage>,
    ) -> Self {
        Self {
            socket_path,
            cache,
            network_publisher,
            cancellation,
        }
    }

    /// Connect-consume-reconnect until cancelled. Intended to run on its own
    /// thread.
    pub fn run(self) {
        let mut backoff = Backoff::default()
            .with_initial_delay(NETMON_RETRY_INTERVAL)
            .with_max_delay(Duration::from_secs(30));

        loop {
            let stream = match UnixStream::connect(&self.socket_path) {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(
                        socket = %self.socket_path.display(),
                        error_msg = %e,
                        "network monitor socket not reachable, retrying"
                    );
                    let mut cancelled = false;
                    backoff.backoff(|delay| cancelled = self.cancellation.is_cancelled(delay));
                    if cancelled {
                        return;
                    }
                    continue;
                }
            };
            info!(socket = %self.socket_path.display(), "connected to network monitor");

            if self.consume(stream) {
                return;
            }
            warn!("network monitor stream closed, reconnecting");
        }
    }

    /// Reads events until EOF or cancellation. Returns true when cancelled.
    fn consume(&self, stream: UnixStream) -> bool {
        if let Err(e) = stream.set_read_timeout(Some(READ_POLL_INTERVAL)) {
            warn!(error_msg = %e, "cannot set read timeout on event stream");
        }
        let mut reader = std::io::BufReader::new(stream);
        let mut line = String::new();

        loop {
            match reader.read_line(&mut line) {
                Ok(0) => return false,
                Ok(_) => {
                    self.handle_line(line.trim());
                    line.clear();
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    // Poll tick: a partial line stays buffered and the next
                    // read appends to it.
                    if self.cancellation.is_cancelled(Duration::ZERO) {
                        return true;
                    }
                }
                Err(e) => {
                    warn!(error_msg = %e, "error reading from event stream");
                    return false;
                }
            }
        }
    }

    fn handle_line(&self, line: &str) {
        if line.is_empty() {
            return;
        }
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                warn!(error_msg = %e, "skipping malformed event line");
                return;
            }
        };

        let event_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
        let data = value.get("data").cloned().unwrap_or(serde_json::Value::Null);
        match event_type {
            "network_discovery" => match serde_json::from_value::<DiscoveryData>(data) {
                Ok(discovery) => {
                    debug!(
                        interfaces = discovery.interfaces.len(),
                        "applying interface discovery"
                    );
                    self.cache.apply_discovery(discovery.interfaces);
                }
                Err(e) => warn!(error_msg = %e, "skipping malformed network_discovery event"),
            },
            "network_change" => match serde_json::from_value::<InterfaceState>(data) {
                Ok(state) => {
                    let interface = state.interface.clone();
                    debug!(interface = %interface, operstate = %state.operstate, "interface changed");
                    self.cache.apply_change(state);
                    let _ = self
                        .network_publisher
                        .publish(NetworkEvent::InterfaceChanged(interface))
                        .inspect_err(|e| warn!(error_msg = %e, "cannot publish network event"));
                }
                Err(e) => warn!(error_msg = %e, "skipping malformed network_change event"),
            },
            other => {
                debug!(event_type = other, "skipping unknown event type");
            }
        }
    }
}
