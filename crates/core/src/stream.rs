/// Stream attachment reconciler
///
/// Consumes stream events pushed by the control channel and binds each new
/// stream to its destination's circuit, or to a random healthy circuit.

use crate::control::{ControlChannel, StreamEvent, StreamStatus};
use crate::health::HealthMonitor;
use crate::notify::NotificationSink;
use crate::retry::{fetch_circuit_status, RetryPolicy};
use crate::routing::{strip_port, RoutingMap};
use anonroute_common::{routing, CircuitId, RouterError};
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// What the reconciler did with one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamAction {
    /// Attached to the destination's mapped circuit
    Routed(CircuitId),

    /// Attached to a random healthy circuit
    Fallback(CircuitId),

    /// Left for the client's default handling
    Unattached,

    /// The remapped circuit was handed to failure handling
    Remapped { rebuilt: bool },

    Ignored,
}

pub struct StreamReconciler {
    control: Arc<dyn ControlChannel>,
    map: RoutingMap,
    monitor: Arc<HealthMonitor>,
    notifier: Arc<dyn NotificationSink>,
    status_policy: RetryPolicy,
}

impl StreamReconciler {
    pub fn new(
        control: Arc<dyn ControlChannel>,
        map: RoutingMap,
        monitor: Arc<HealthMonitor>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            control,
            map,
            monitor,
            notifier,
            status_policy: RetryPolicy::status(),
        }
    }

    pub fn with_status_policy(mut self, policy: RetryPolicy) -> Self {
        self.status_policy = policy;
        self
    }

    /// Handle events until the channel closes
    ///
    /// Remapped circuits are rebuilt beside the event loop, so new streams
    /// keep being attached while a rebuild waits on the network. Rebuilds
    /// still in flight are aborted when the loop ends.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<StreamEvent>) {
        info!("Stream reconciler started");
        let mut remaps = JoinSet::new();

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    match remapped_circuit(&event) {
                        Some(circuit_id) => {
                            debug!(stream_id = %event.stream_id, circuit_id = %circuit_id, "Handing remapped circuit to the monitor");
                            let monitor = self.monitor.clone();
                            remaps.spawn(async move {
                                (circuit_id, monitor.handle_remap(circuit_id).await)
                            });
                        }
                        None => {
                            let action = self.handle_event(&event).await;
                            debug!(stream_id = %event.stream_id, ?action, "Stream event handled");
                        }
                    }
                }
                Some(joined) = remaps.join_next(), if !remaps.is_empty() => match joined {
                    Ok((circuit_id, rebuilt)) => {
                        debug!(circuit_id = %circuit_id, rebuilt, "Remap handled");
                    }
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => warn!("Remap task failed: {}", e),
                },
            }
        }

        remaps.abort_all();
        info!("Stream event channel closed, reconciler stopped");
    }

    pub async fn handle_event(&self, event: &StreamEvent) -> StreamAction {
        match event.status {
            StreamStatus::New => self.handle_new(event).await,
            StreamStatus::Remap => self.handle_remap(event).await,
            _ => StreamAction::Ignored,
        }
    }

    async fn handle_new(&self, event: &StreamEvent) -> StreamAction {
        let target_address = strip_port(&event.target);

        if event.is_unattached() {
            if let Some(entry) = self.map.match_target(target_address).await {
                debug!(
                    stream_id = %event.stream_id,
                    destination = %entry.target,
                    circuit_id = %entry.circuit_id,
                    "Attaching stream to mapped circuit"
                );
                self.attach(&event.stream_id, entry.circuit_id).await;
                return StreamAction::Routed(entry.circuit_id);
            }
        }

        self.attach_fallback(event).await
    }

    async fn attach_fallback(&self, event: &StreamEvent) -> StreamAction {
        let circuits = match fetch_circuit_status(
            self.control.as_ref(),
            self.notifier.as_ref(),
            self.status_policy,
        )
        .await
        {
            Ok(circuits) => circuits,
            Err(e) => {
                warn!(stream_id = %event.stream_id, "No circuit status for fallback: {}", e);
                return StreamAction::Unattached;
            }
        };

        let healthy: Vec<CircuitId> = circuits
            .iter()
            .filter(|c| c.is_usable_fallback(routing::FALLBACK_CIRCUIT_LENGTH))
            .map(|c| c.circuit_id)
            .collect();

        let chosen = healthy.choose(&mut rand::thread_rng()).copied();
        match chosen {
            Some(circuit_id) => {
                debug!(
                    stream_id = %event.stream_id,
                    circuit_id = %circuit_id,
                    candidates = healthy.len(),
                    "Attaching stream to fallback circuit"
                );
                self.attach(&event.stream_id, circuit_id).await;
                StreamAction::Fallback(circuit_id)
            }
            None => {
                debug!(stream_id = %event.stream_id, "No healthy fallback circuit");
                StreamAction::Unattached
            }
        }
    }

    async fn handle_remap(&self, event: &StreamEvent) -> StreamAction {
        match remapped_circuit(event) {
            Some(circuit_id) => StreamAction::Remapped {
                rebuilt: self.monitor.handle_remap(circuit_id).await,
            },
            None => StreamAction::Ignored,
        }
    }

    /// Attach errors degrade one stream only; they are logged, not raised
    async fn attach(&self, stream_id: &str, circuit_id: CircuitId) {
        if let Err(e) = self.control.attach_stream(stream_id, circuit_id).await {
            let err = RouterError::StreamAttach {
                stream_id: stream_id.to_string(),
                message: e.to_string(),
            };
            warn!(circuit_id = %circuit_id, "{}", err);
        }
    }
}

/// The circuit a REMAP event moved its stream off, if any
fn remapped_circuit(event: &StreamEvent) -> Option<CircuitId> {
    match event.status {
        StreamStatus::Remap => event.circuit_id.filter(|id| !id.is_unattached()),
        _ => None,
    }
}
