/// Circuit health monitor
///
/// Polls circuit status on a fixed interval and rebuilds routes whose
/// circuit has failed or closed.

use crate::circuit::CircuitBuilder;
use crate::control::{CircuitState, ControlChannel};
use crate::notify::{Notification, NotificationSink};
use crate::retry::{fetch_circuit_status, RetryPolicy};
use crate::routing::RoutingMap;
use anonroute_common::{CircuitId, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Result of one poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No mapped circuit failed
    Healthy,

    /// Mapped circuits failed; `rebuilt` of them got a new circuit
    FailureDetected { failed: usize, rebuilt: usize },

    /// The session is no longer running; polling ends
    Stopped,
}

pub struct HealthMonitor {
    control: Arc<dyn ControlChannel>,
    builder: Arc<CircuitBuilder>,
    map: RoutingMap,
    notifier: Arc<dyn NotificationSink>,
    running: Arc<RwLock<bool>>,
    interval: Duration,
    status_policy: RetryPolicy,

    /// Destinations whose rebuild failed, with the circuit that failed,
    /// retried on later ticks
    pending: Mutex<Vec<(String, CircuitId)>>,
}

impl HealthMonitor {
    pub fn new(
        control: Arc<dyn ControlChannel>,
        builder: Arc<CircuitBuilder>,
        notifier: Arc<dyn NotificationSink>,
        running: Arc<RwLock<bool>>,
        interval: Duration,
    ) -> Self {
        let map = builder.routing_map().clone();
        Self {
            control,
            builder,
            map,
            notifier,
            running,
            interval,
            status_policy: RetryPolicy::status(),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn with_status_policy(mut self, policy: RetryPolicy) -> Self {
        self.status_policy = policy;
        self
    }

    /// Poll until the session stops
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick fires immediately; circuits were just built
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match self.tick().await {
                Ok(TickOutcome::Stopped) => {
                    info!("Health monitor stopped");
                    break;
                }
                Ok(outcome) => debug!(?outcome, "Health check complete"),
                Err(e) => warn!("Health check abandoned: {}", e),
            }
        }
    }

    /// One poll
    pub async fn tick(&self) -> Result<TickOutcome> {
        if !*self.running.read().await {
            return Ok(TickOutcome::Stopped);
        }

        let circuits =
            fetch_circuit_status(self.control.as_ref(), self.notifier.as_ref(), self.status_policy)
                .await?;

        // Destinations left unrouted by earlier ticks go first
        let mut rebuilt = self.retry_pending().await;
        let mut failed = 0;

        for circuit in circuits
            .iter()
            .filter(|c| matches!(c.state, CircuitState::Failed | CircuitState::Closed))
        {
            let Some(target) = self.map.target_for_circuit(circuit.circuit_id).await else {
                continue;
            };

            failed += 1;
            info!(
                circuit_id = %circuit.circuit_id,
                destination = %target,
                state = ?circuit.state,
                "Mapped circuit is down"
            );
            if self.handle_failure(circuit.circuit_id, &target).await {
                rebuilt += 1;
            }
        }

        if failed == 0 {
            Ok(TickOutcome::Healthy)
        } else {
            Ok(TickOutcome::FailureDetected { failed, rebuilt })
        }
    }

    /// Unmap `target` from the failed circuit and rebuild it
    ///
    /// Returns whether a new circuit was mapped.
    pub async fn handle_failure(&self, circuit_id: CircuitId, target: &str) -> bool {
        if !self.map.remove_if(target, circuit_id).await {
            debug!(
                circuit_id = %circuit_id,
                destination = %target,
                "Entry already rebound, skipping"
            );
            return false;
        }

        self.notifier
            .notify(Notification::circuit_failure(circuit_id, target));

        match self.builder.rebuild_route(target).await {
            Ok(new_circuit_id) => {
                self.notifier.notify(Notification::circuit_recreated(
                    circuit_id,
                    new_circuit_id,
                    target,
                ));
                true
            }
            Err(e) => {
                warn!(
                    circuit_id = %circuit_id,
                    destination = %target,
                    "Rebuild failed, destination unrouted until a later tick: {}",
                    e
                );
                let mut pending = self.pending.lock().await;
                if !pending.iter().any(|(t, _)| t == target) {
                    pending.push((target.to_string(), circuit_id));
                }
                false
            }
        }
    }

    /// Treat a remapped stream's circuit as failed
    pub async fn handle_remap(&self, circuit_id: CircuitId) -> bool {
        match self.map.target_for_circuit(circuit_id).await {
            Some(target) => {
                info!(circuit_id = %circuit_id, destination = %target, "Stream remapped off its circuit");
                self.handle_failure(circuit_id, &target).await
            }
            None => false,
        }
    }

    /// Destinations waiting for a rebuild
    pub async fn pending(&self) -> Vec<String> {
        self.pending
            .lock()
            .await
            .iter()
            .map(|(target, _)| target.clone())
            .collect()
    }

    async fn retry_pending(&self) -> usize {
        let waiting: Vec<(String, CircuitId)> = std::mem::take(&mut *self.pending.lock().await);
        let mut rebuilt = 0;

        for (target, failed_circuit) in waiting {
            if self.map.get(&target).await.is_some() {
                continue;
            }

            match self.builder.rebuild_route(&target).await {
                Ok(circuit_id) => {
                    info!(destination = %target, circuit_id = %circuit_id, "Pending route rebuilt");
                    self.notifier.notify(Notification::circuit_recreated(
                        failed_circuit,
                        circuit_id,
                        &target,
                    ));
                    rebuilt += 1;
                }
                Err(e) => {
                    debug!(destination = %target, "Pending rebuild failed again: {}", e);
                    self.pending.lock().await.push((target, failed_circuit));
                }
            }
        }

        rebuilt
    }
}
