//! Debounced reaction to host interface changes.
//!
//! Changes for the same interface are coalesced over a debounce window (the
//! last state wins, the cache already holds it). When the window closes,
//! every managed container with a vNIC on that interface gets a reconfigure
//! job. Jobs run on a small worker pool; same-container jobs are serialized
//! by the operation tracker, and a busy container is simply skipped until
//! the next change.

use crate::event::cancellation::CancellationMessage;
use crate::event::channel::EventConsumer;
use crate::event::NetworkEvent;
use crate::lifecycle::engine::ContainerEngine;
use crate::lifecycle::runtime::{LifecycleError, RuntimeManager};
use crate::netmon::InterfaceCache;
use crate::registry::ContainerName;
use crate::utils::threads::spawn_named_thread;
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Job queue depth; intake blocks briefly if the pool falls this far behind.
const JOB_QUEUE_DEPTH: usize = 64;

struct ReconfigureJob {
    container: ContainerName,
    interface: String,
}

pub struct ReconfigureLoop<E>
where
    E: ContainerEngine + Send + Sync + 'static,
{
    manager: Arc<RuntimeManager<E>>,
    cache: Arc<InterfaceCache>,
    changes: EventConsumer<NetworkEvent>,
    cancellation: EventConsumer<CancellationMessage>,
    debounce_window: Duration,
    concurrency: usize,
}

impl<E> ReconfigureLoop<E>
where
    E: ContainerEngine + Send + Sync + 'static,
{
    pub fn new(
        manager: Arc<RuntimeManager<E>>,
        cache: Arc<InterfaceCache>,
        changes: EventConsumer<NetworkEvent>,
        cancellation: EventConsumer<CancellationMessage>,
        debounce_window: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            manager,
            cache,
            changes,
            cancellation,
            debounce_window,
            concurrency: concurrency.max(1),
        }
    }

    /// Debounce-and-dispatch until cancelled. In-flight jobs are allowed to
    /// finish on shutdown; pending (not yet dispatched) work is dropped.
    pub fn run(self) {
        let (job_sender, workers) = self.spawn_workers();

        // interface -> deadline of its open debounce window.
        let mut pending: HashMap<String, Instant> = HashMap::new();
        loop {
            if self.cancellation.is_cancelled(Duration::ZERO) {
                break;
            }

            let timeout = pending
                .values()
                .min()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_millis(500));

            match self.changes.as_ref().recv_timeout(timeout) {
                Ok(NetworkEvent::InterfaceChanged(interface)) => {
                    // Restart the window: only the last state within it acts.
                    pending.insert(interface, Instant::now() + self.debounce_window);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let now = Instant::now();
            let due: Vec<String> = pending
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(interface, _)| interface.clone())
                .collect();
            for interface in due {
                pending.remove(&interface);
                self.dispatch(&interface, &job_sender);
            }
        }

        info!("reconfiguration loop stopping, draining workers");
        drop(job_sender);
        for worker in workers {
            let _ = worker.join();
        }
    }

    fn dispatch(&self, interface: &str, job_sender: &Sender<ReconfigureJob>) {
        if self.cache.lookup(interface).is_none() {
            debug!(interface, "change on non-actionable interface, skipping");
            return;
        }

        for (container, record) in self.manager.registry().snapshot() {
            let affected = record
                .vnics
                .iter()
                .any(|vnic| vnic.parent_interface == interface);
            if !affected {
                continue;
            }
            debug!(container = %container, interface, "queueing attachment reconfiguration");
            let job = ReconfigureJob {
                container,
                interface: interface.to_string(),
            };
            if job_sender.send(job).is_err() {
                return;
            }
        }
    }

    fn spawn_workers(&self) -> (Sender<ReconfigureJob>, Vec<JoinHandle<()>>) {
        let (job_sender, job_receiver) = bounded::<ReconfigureJob>(JOB_QUEUE_DEPTH);
        let workers = (0..self.concurrency)
            .map(|i| {
                let receiver = job_receiver.clone();
                let manager = self.manager.clone();
                spawn_named_thread(format!("reconfigure-{i}"), move || {
                    while let Ok(job) = receiver.recv() {
                        match manager.reconfigure_attachment(&job.container, &job.interface) {
                            Ok(()) => {}
                            Err(LifecycleError::Busy(e)) => {
                                debug!(container = %job.container, error_msg = %e, "container busy, skipping reconfiguration");
                            }
                            Err(e) => {
                                warn!(
                                    container = %job.container,
                                    interface = %job.interface,
                                    kind = e.kind(),
                                    error_msg = %e,
                                    "attachment reconfiguration failed, will retry on next change"
                                );
                            }
                        }
                    }
                })
            })
            .collect();
        (job_sender, workers)
    }
}

/// Convenience wiring: spawns the loop on a named thread.
pub fn start<E>(reconfigure_loop: ReconfigureLoop<E>) -> JoinHandle<()>
where
    E: ContainerEngine + Send + Sync + 'static,
{
    spawn_named_thread("reconfigure-loop", move || reconfigure_loop.run())
}
