/// Circuit builder
///
/// Turns selected relay paths into live circuits and owns writes that add
/// or replace routing-map entries.

use super::path_selection::{PathSelector, RelayPath};
use crate::control::{ControlChannel, ControlError, ExtendCircuitOptions};
use crate::directory::{DirectorySnapshot, RelayDirectory};
use crate::routing::{RouteEntry, RoutingMap};
use anonroute_common::{CircuitId, Result, RouteSpec, RouterError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

/// Outcome of a bootstrap pass
#[derive(Debug, Default)]
pub struct BootstrapReport {
    /// Routes that got a circuit, in route order
    pub routes: Vec<RouteEntry>,

    /// Routes that were skipped, with the reason
    pub failures: Vec<(String, RouterError)>,
}

impl BootstrapReport {
    pub fn succeeded(&self) -> usize {
        self.routes.len()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

pub struct CircuitBuilder {
    control: Arc<dyn ControlChannel>,
    directory: Arc<RelayDirectory>,
    selector: PathSelector,
    map: RoutingMap,

    /// Route specs from the last bootstrap, for rebuilds
    routes: RwLock<Vec<RouteSpec>>,

    /// Serializes rebuilds
    rebuild_lock: Mutex<()>,

    rng: StdMutex<StdRng>,
}

impl CircuitBuilder {
    pub fn new(
        control: Arc<dyn ControlChannel>,
        directory: Arc<RelayDirectory>,
        selector: PathSelector,
        map: RoutingMap,
    ) -> Self {
        Self {
            control,
            directory,
            selector,
            map,
            routes: RwLock::new(Vec::new()),
            rebuild_lock: Mutex::new(()),
            rng: StdMutex::new(StdRng::from_entropy()),
        }
    }

    /// Use a fixed random source
    pub fn with_rng(self, rng: StdRng) -> Self {
        Self {
            rng: StdMutex::new(rng),
            ..self
        }
    }

    pub fn routing_map(&self) -> &RoutingMap {
        &self.map
    }

    /// Wait out a rebuild in flight; no rebuild starts while the guard lives
    pub async fn pause_rebuilds(&self) -> MutexGuard<'_, ()> {
        self.rebuild_lock.lock().await
    }

    pub async fn route_specs(&self) -> Vec<RouteSpec> {
        self.routes.read().await.clone()
    }

    /// Build one circuit per route, skipping routes that fail
    pub async fn bootstrap(
        &self,
        routes: Vec<RouteSpec>,
        snapshot: &DirectorySnapshot,
    ) -> BootstrapReport {
        *self.routes.write().await = routes.clone();
        let mut report = BootstrapReport::default();

        for route in &routes {
            match self.build_route(route, snapshot).await {
                Ok(circuit_id) => {
                    if let Some(old) = self.map.insert(&route.target_address, circuit_id).await {
                        // Same destination listed twice; the newer circuit wins
                        self.close_quietly(old).await;
                    }
                    report
                        .routes
                        .push(RouteEntry::new(route.target_address.clone(), circuit_id));
                }
                Err(e) => {
                    warn!(destination = %route.target_address, "Skipping route: {}", e);
                    report.failures.push((route.target_address.clone(), e));
                }
            }
        }

        info!(
            built = report.succeeded(),
            skipped = report.failed(),
            "Routing map bootstrapped"
        );
        report
    }

    /// Rebuild the circuit for `target` on a fresh directory snapshot
    ///
    /// The map entry is swapped only if it still holds the binding seen
    /// when the rebuild started; otherwise the new circuit is closed.
    pub async fn rebuild_route(&self, target: &str) -> Result<CircuitId> {
        let _guard = self.rebuild_lock.lock().await;

        let route = self
            .routes
            .read()
            .await
            .iter()
            .find(|r| r.target_address == target)
            .cloned()
            .ok_or_else(|| RouterError::NoRouteConfigured(target.to_string()))?;

        let previous = self.map.get(target).await;
        let snapshot = self
            .directory
            .snapshot(self.selector.options().enforce_entry_countries)
            .await?;
        let circuit_id = self.build_route(&route, &snapshot).await?;

        if self.map.replace_if(target, previous, circuit_id).await {
            if let Some(old) = previous.filter(|old| *old != circuit_id) {
                self.close_quietly(old).await;
            }
            info!(destination = %target, circuit_id = %circuit_id, ?previous, "Route rebuilt");
            return Ok(circuit_id);
        }

        // Lost the race against a concurrent removal or stop
        self.close_quietly(circuit_id).await;
        match self.map.get(target).await {
            Some(current) => {
                debug!(destination = %target, circuit_id = %current, "Route already rebound");
                Ok(current)
            }
            None => Err(RouterError::Other(anyhow::anyhow!(
                "routing entry for {} changed during rebuild",
                target
            ))),
        }
    }

    /// One clean attempt: select a path and extend it
    async fn build_route(&self, route: &RouteSpec, snapshot: &DirectorySnapshot) -> Result<CircuitId> {
        let path = self.select(route, snapshot)?;
        debug!(destination = %route.target_address, hops = route.hops, path = %path, "Selected path");

        let options = ExtendCircuitOptions::general(path.into_fingerprints());
        let circuit_id = self
            .control
            .extend_circuit(options)
            .await
            .map_err(|e| extend_error(&route.target_address, e))?;

        info!(destination = %route.target_address, circuit_id = %circuit_id, "Circuit created");
        Ok(circuit_id)
    }

    fn select(&self, route: &RouteSpec, snapshot: &DirectorySnapshot) -> Result<RelayPath> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| RouterError::Other(anyhow::anyhow!("path selection rng poisoned")))?;
        self.selector
            .select_path(route, snapshot, &mut *rng)
            .map_err(|e| e.for_target(&route.target_address))
    }

    async fn close_quietly(&self, circuit_id: CircuitId) {
        if let Err(e) = self.control.close_circuit(circuit_id).await {
            debug!(circuit_id = %circuit_id, "Failed to close superseded circuit: {}", e);
        }
    }
}

fn extend_error(target: &str, err: ControlError) -> RouterError {
    if err.is_timeout() {
        RouterError::ExtendTimeout {
            target: target.to_string(),
        }
    } else {
        err.into()
    }
}
