//! Periodic heartbeat towards the cloud.
//!
//! Fires on a fixed tick while the session is connected; while it is down
//! the tick is skipped and the next successful one carries fresh state.

use crate::cloud::SessionHandle;
use crate::defaults::TOPIC_HEARTBEAT;
use crate::event::cancellation::CancellationMessage;
use crate::event::channel::EventConsumer;
use crate::metrics::MetricsSampler;
use crossbeam::channel::tick;
use crossbeam::select;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct TelemetryEmitter {
    agent_id: String,
    sampler: Arc<MetricsSampler>,
    session: SessionHandle,
    interval: Duration,
    cancellation: EventConsumer<CancellationMessage>,
}

impl TelemetryEmitter {
    pub fn new(
        agent_id: String,
        sampler: Arc<MetricsSampler>,
        session: SessionHandle,
        interval: Duration,
        cancellation: EventConsumer<CancellationMessage>,
    ) -> Self {
        Self {
            agent_id,
            sampler,
            session,
            interval,
            cancellation,
        }
    }

    /// Emits one heartbeat per tick until cancelled. Intended to run on its
    /// own thread.
    pub fn run(self) {
        let ticker = tick(self.interval);
        loop {
            select! {
                recv(ticker) -> _ => {
                    if !self.session.is_connected() {
                        debug!("session down, skipping heartbeat");
                        continue;
                    }
                    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.payload())) {
                        Ok(payload) => {
                            self.session.emit(TOPIC_HEARTBEAT, payload);
                        }
                        Err(_) => {
                            // One bad sample must not kill the emitter.
                            warn!("metrics sampling failed, skipping heartbeat tick");
                        }
                    }
                }
                recv(self.cancellation.as_ref()) -> _ => {
                    debug!("telemetry emitter stopping");
                    return;
                }
            }
        }
    }

    fn payload(&self) -> serde_json::Value {
        json!({
            "agent_id": self.agent_id,
            "cpu_usage": round2(self.sampler.cpu_usage_percent()),
            "memory_usage": bytes_to_gb(self.sampler.memory_used_bytes()),
            "memory_total": bytes_to_gb(self.sampler.memory_total_bytes()),
            "disk_usage": bytes_to_gb(self.sampler.disk_used_bytes()),
            "disk_total": bytes_to_gb(self.sampler.disk_total_bytes()),
            "uptime": self.sampler.uptime_seconds(),
            "status": "online",
            "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        })
    }
}

fn bytes_to_gb(bytes: u64) -> f64 {
    round2(bytes as f64 / 1_000_000_000.0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
