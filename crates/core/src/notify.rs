/// User-visible notifications
///
/// Pushes are fire-and-forget: a sink never reports delivery failure back
/// to the routing engine.

use anonroute_common::{CircuitId, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// A structured push for the UI collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Notification {
    ProxyError {
        message: String,
        timestamp: Timestamp,
    },
    CircuitFailure {
        circuit_id: CircuitId,
        target: String,
        timestamp: Timestamp,
    },
    CircuitRecreated {
        old_circuit_id: CircuitId,
        new_circuit_id: CircuitId,
        target: String,
        timestamp: Timestamp,
    },
    ProxyStarted {
        routes: usize,
        timestamp: Timestamp,
    },
    ProxyStopped {
        timestamp: Timestamp,
    },
}

impl Notification {
    pub fn proxy_error(message: impl Into<String>) -> Self {
        Self::ProxyError {
            message: message.into(),
            timestamp: Timestamp::now(),
        }
    }

    pub fn circuit_failure(circuit_id: CircuitId, target: impl Into<String>) -> Self {
        Self::CircuitFailure {
            circuit_id,
            target: target.into(),
            timestamp: Timestamp::now(),
        }
    }

    pub fn circuit_recreated(
        old_circuit_id: CircuitId,
        new_circuit_id: CircuitId,
        target: impl Into<String>,
    ) -> Self {
        Self::CircuitRecreated {
            old_circuit_id,
            new_circuit_id,
            target: target.into(),
            timestamp: Timestamp::now(),
        }
    }

    pub fn proxy_started(routes: usize) -> Self {
        Self::ProxyStarted {
            routes,
            timestamp: Timestamp::now(),
        }
    }

    pub fn proxy_stopped() -> Self {
        Self::ProxyStopped {
            timestamp: Timestamp::now(),
        }
    }

    /// Channel name the UI listens on
    pub fn channel(&self) -> &'static str {
        match self {
            Self::ProxyError { .. } => "proxy-error",
            Self::CircuitFailure { .. } => "circuit-failure",
            Self::CircuitRecreated { .. } => "circuit-recreated",
            Self::ProxyStarted { .. } => "proxy-started",
            Self::ProxyStopped { .. } => "proxy-stopped",
        }
    }
}

/// Destination for notifications
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, notification: Notification) {
        match &notification {
            Notification::ProxyError { message, .. } => {
                error!(channel = notification.channel(), "{}", message)
            }
            Notification::CircuitFailure {
                circuit_id, target, ..
            } => warn!(
                channel = notification.channel(),
                circuit_id = %circuit_id,
                destination = %target,
                "Circuit failed"
            ),
            Notification::CircuitRecreated {
                old_circuit_id,
                new_circuit_id,
                target,
                ..
            } => info!(
                channel = notification.channel(),
                old_circuit_id = %old_circuit_id,
                new_circuit_id = %new_circuit_id,
                destination = %target,
                "Circuit recreated"
            ),
            Notification::ProxyStarted { routes, .. } => {
                info!(channel = notification.channel(), routes, "Proxy started")
            }
            Notification::ProxyStopped { .. } => {
                info!(channel = notification.channel(), "Proxy stopped")
            }
        }
    }
}

/// Fans notifications out to any number of subscribers
///
/// Lossy: with no subscriber, or a lagging one, pushes are dropped.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(64)
    }
}

impl NotificationSink for BroadcastNotifier {
    fn notify(&self, notification: Notification) {
        LogNotifier.notify(notification.clone());
        let _ = self.sender.send(notification);
    }
}
