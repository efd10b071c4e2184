/// Proxy session
///
/// Owns the control channel, the routing map and the background tasks of
/// one proxy run. Components get their shared handles from here.

use crate::circuit::{CircuitBuilder, PathSelector, SelectionOptions};
use crate::control::{ControlChannel, RelayInfo};
use crate::directory::RelayDirectory;
use crate::geo::{Coordinates, FingerprintGeoIndex};
use crate::health::HealthMonitor;
use crate::notify::{Notification, NotificationSink};
use crate::retry::{fetch_circuit_status, RetryPolicy};
use crate::routing::{RouteEntry, RoutingMap};
use crate::stream::StreamReconciler;
use anonroute_common::{
    flatten_rules, Fingerprint, Result, RouteSpec, RouterConfig, RouterError, RoutingRule,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Session tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub monitor_interval: Duration,
    pub enforce_entry_countries: bool,

    /// Circuit status retries used by every component
    pub status_policy: RetryPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(anonroute_common::monitor::INTERVAL_SECS),
            enforce_entry_countries: false,
            status_policy: RetryPolicy::status(),
        }
    }
}

impl From<&RouterConfig> for SessionOptions {
    fn from(config: &RouterConfig) -> Self {
        Self {
            monitor_interval: config.monitor_interval(),
            enforce_entry_countries: config.enforce_entry_countries,
            ..Self::default()
        }
    }
}

/// First hop of the active circuit, placed on the map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentRelay {
    pub ip: IpAddr,
    pub fingerprint: Fingerprint,
    pub nickname: String,
    pub coordinates: Option<Coordinates>,
    pub hex_id: Option<String>,

    /// Circuits currently reported by the client
    pub number_of_relays: usize,
}

pub struct Session {
    control: Arc<dyn ControlChannel>,
    notifier: Arc<dyn NotificationSink>,
    map: RoutingMap,
    directory: Arc<RelayDirectory>,
    builder: Arc<CircuitBuilder>,
    geo: Arc<FingerprintGeoIndex>,
    options: SessionOptions,
    running: Arc<RwLock<bool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    /// Serializes start and stop
    lifecycle: Mutex<()>,
}

impl Session {
    pub fn new(
        control: Arc<dyn ControlChannel>,
        notifier: Arc<dyn NotificationSink>,
        options: SessionOptions,
    ) -> Self {
        let map = RoutingMap::new();
        let directory = Arc::new(RelayDirectory::new(control.clone()));
        let selector = PathSelector::new(
            SelectionOptions::new().with_entry_country_enforcement(options.enforce_entry_countries),
        );
        let builder = Arc::new(CircuitBuilder::new(
            control.clone(),
            directory.clone(),
            selector,
            map.clone(),
        ));

        Self {
            control,
            notifier,
            map,
            directory,
            builder,
            geo: Arc::new(FingerprintGeoIndex::new()),
            options,
            running: Arc::new(RwLock::new(false)),
            tasks: Mutex::new(Vec::new()),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn with_geo_index(mut self, index: FingerprintGeoIndex) -> Self {
        self.geo = Arc::new(index);
        self
    }

    /// Build circuits for `rules` and take over stream attachment
    ///
    /// Returns the routing map as built. Routes whose circuit could not be
    /// built are left out; directory and GeoIP failures abort the start.
    pub async fn start(&self, rules: &[RoutingRule]) -> Result<Vec<RouteEntry>> {
        let _lifecycle = self.lifecycle.lock().await;
        if *self.running.read().await {
            return Err(RouterError::AlreadyRunning);
        }

        let routes = flatten_rules(rules);
        info!(rules = rules.len(), routes = routes.len(), "Starting proxy session");

        let snapshot = match self
            .directory
            .snapshot(self.options.enforce_entry_countries)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Directory unavailable, proxy not started: {}", e);
                self.notifier
                    .notify(Notification::proxy_error(format!("Failed to start proxy: {}", e)));
                return Err(e);
            }
        };

        self.map.clear().await;
        let report = self.builder.bootstrap(routes, &snapshot).await;

        if let Err(e) = self.take_over_streams().await {
            error!("Failed to take over stream attachment: {}", e);
            self.notifier
                .notify(Notification::proxy_error(format!("Failed to start proxy: {}", e)));
            self.release_client().await;
            for entry in self.map.entries().await {
                if let Err(close_err) = self.control.close_circuit(entry.circuit_id).await {
                    debug!(circuit_id = %entry.circuit_id, "Close after failed start: {}", close_err);
                }
            }
            self.map.clear().await;
            return Err(e);
        }

        let entries = self.map.entries().await;
        info!(
            mapped = entries.len(),
            skipped = report.failed(),
            "Proxy session running"
        );
        self.notifier.notify(Notification::proxy_started(entries.len()));
        Ok(entries)
    }

    /// Disable automatic attachment, then spawn the reconciler and monitor
    async fn take_over_streams(&self) -> Result<()> {
        self.control.disable_stream_attachment().await?;
        let events = self.control.subscribe_stream_events().await?;

        *self.running.write().await = true;

        let monitor = Arc::new(
            HealthMonitor::new(
                self.control.clone(),
                self.builder.clone(),
                self.notifier.clone(),
                self.running.clone(),
                self.options.monitor_interval,
            )
            .with_status_policy(self.options.status_policy),
        );
        let reconciler = Arc::new(
            StreamReconciler::new(
                self.control.clone(),
                self.map.clone(),
                monitor.clone(),
                self.notifier.clone(),
            )
            .with_status_policy(self.options.status_policy),
        );

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(reconciler.run(events)));
        tasks.push(tokio::spawn(monitor.run()));
        Ok(())
    }

    /// Give stream attachment back to the client
    async fn release_client(&self) {
        if let Err(e) = self.control.enable_stream_attachment().await {
            warn!("Failed to re-enable stream attachment: {}", e);
        }
    }

    /// Stop background tasks and forget every route; a no-op when stopped
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        {
            let mut running = self.running.write().await;
            if !*running {
                debug!("Stop requested while not running");
                return Ok(());
            }
            *running = false;
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Background task failed: {}", e);
                }
            }
        }

        if let Err(e) = self.control.unsubscribe_stream_events().await {
            warn!("Failed to unsubscribe from stream events: {}", e);
        }
        self.release_client().await;

        {
            let _rebuilds = self.builder.pause_rebuilds().await;
            self.map.clear().await;
        }
        info!("Proxy session stopped");
        self.notifier.notify(Notification::proxy_stopped());
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Routing map entries in insertion order
    pub async fn routes(&self) -> Vec<RouteEntry> {
        self.map.entries().await
    }

    /// Route specs of the last start
    pub async fn route_specs(&self) -> Vec<RouteSpec> {
        self.builder.route_specs().await
    }

    pub fn routing_map(&self) -> &RoutingMap {
        &self.map
    }

    pub fn geo_index(&self) -> &FingerprintGeoIndex {
        &self.geo
    }

    /// Relay the client currently enters the network through
    ///
    /// Failures after retries are pushed as a `proxy-error` and yield `None`.
    pub async fn current_relay(&self) -> Option<CurrentRelay> {
        let result = self
            .options
            .status_policy
            .run("relay-data", |_| true, |_| self.lookup_current_relay())
            .await;

        match result {
            Ok(relay) => Some(relay),
            Err(e) => {
                let e = e.into_inner();
                error!("Error getting relay data: {}", e);
                self.notifier
                    .notify(Notification::proxy_error(format!("Error getting relay data: {}", e)));
                None
            }
        }
    }

    async fn lookup_current_relay(&self) -> Result<CurrentRelay> {
        let circuits = fetch_circuit_status(
            self.control.as_ref(),
            self.notifier.as_ref(),
            self.options.status_policy,
        )
        .await?;

        let first_hop = circuits
            .iter()
            .find_map(|c| c.relays.first())
            .map(|hop| hop.fingerprint)
            .ok_or_else(|| RouterError::Other(anyhow::anyhow!("no circuit with relays")))?;

        let control = &self.control;
        let info: RelayInfo = RetryPolicy::relay_info()
            .run("relay-info", |_| true, |_| control.get_relay_info(&first_hop))
            .await
            .map_err(|e| RouterError::from(e.into_inner()))?;

        let geo = self.geo.get(&info.fingerprint);
        Ok(CurrentRelay {
            ip: info.ip,
            fingerprint: info.fingerprint,
            nickname: info.nickname,
            coordinates: geo.map(|g| g.coordinates),
            hex_id: geo.map(|g| g.hex_id.clone()),
            number_of_relays: circuits.len(),
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.try_lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}
