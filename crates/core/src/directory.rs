/// Relay directory adapter
///
/// Wraps the control channel's relay listing and country population, and
/// splits the directory into guard, middle and exit pools.

use crate::control::{ControlChannel, Relay, RelayFlag};
use crate::retry::{RetryError, RetryPolicy};
use anonroute_common::{Result, RouterError};
use std::sync::Arc;
use tracing::{debug, info};

/// Relay pools for one bootstrap or rebuild pass
#[derive(Debug, Clone, Default)]
pub struct DirectorySnapshot {
    pub guards: Vec<Relay>,
    pub middles: Vec<Relay>,
    pub exits: Vec<Relay>,
}

impl DirectorySnapshot {
    /// Split a relay listing into role pools
    ///
    /// Exits carry Exit and not BadExit, guards carry Guard, middles carry
    /// Stable and Running and neither Exit nor Guard.
    pub fn from_relays(relays: &[Relay]) -> Self {
        let exits = RelayDirectory::filter_by_flags(relays, &RelayFlag::Exit)
            .into_iter()
            .filter(|r| !r.has_flag(&RelayFlag::BadExit))
            .collect();
        let guards = RelayDirectory::filter_by_flags(relays, &RelayFlag::Guard);
        let middles = RelayDirectory::filter_by_flags(relays, &RelayFlag::Stable)
            .into_iter()
            .filter(|r| {
                r.has_flag(&RelayFlag::Running)
                    && !r.has_flag(&RelayFlag::Exit)
                    && !r.has_flag(&RelayFlag::Guard)
            })
            .collect();

        Self {
            guards,
            middles,
            exits,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty() && self.middles.is_empty() && self.exits.is_empty()
    }
}

pub struct RelayDirectory {
    control: Arc<dyn ControlChannel>,
    geo_policy: RetryPolicy,
}

impl RelayDirectory {
    pub fn new(control: Arc<dyn ControlChannel>) -> Self {
        Self {
            control,
            geo_policy: RetryPolicy::geo(),
        }
    }

    pub fn with_geo_policy(mut self, policy: RetryPolicy) -> Self {
        self.geo_policy = policy;
        self
    }

    pub async fn list_relays(&self) -> Result<Vec<Relay>> {
        let relays = self
            .control
            .get_relays()
            .await
            .map_err(|e| RouterError::directory(format!("failed to list relays: {}", e)))?;

        if relays.is_empty() {
            return Err(RouterError::directory("relay listing is empty"));
        }

        debug!(count = relays.len(), "Listed relays");
        Ok(relays)
    }

    pub fn filter_by_flags(relays: &[Relay], flag: &RelayFlag) -> Vec<Relay> {
        relays.iter().filter(|r| r.has_flag(flag)).cloned().collect()
    }

    /// Fill in relay countries, retrying while GeoIP data is not loaded
    pub async fn populate_countries(&self, relays: &mut [Relay]) -> Result<()> {
        let control = &self.control;
        let result = self
            .geo_policy
            .run("populate-countries", |_| true, |_| {
                // Work on a copy so a failed attempt leaves nothing half-written
                let mut batch = relays.to_vec();
                async move {
                    control.populate_countries(&mut batch).await?;
                    Ok::<_, crate::control::ControlError>(batch)
                }
            })
            .await;

        match result {
            Ok(populated) => {
                for (relay, filled) in relays.iter_mut().zip(populated) {
                    relay.country = filled.country;
                }
                Ok(())
            }
            Err(RetryError::Exhausted { attempts, .. }) => {
                Err(RouterError::GeoDataUnavailable { attempts })
            }
            Err(RetryError::Aborted(e)) => Err(e.into()),
        }
    }

    /// Fresh relay pools with countries populated where routing needs them
    ///
    /// Exits always need countries; guards only when entry-country
    /// exclusion is enforced.
    pub async fn snapshot(&self, with_guard_countries: bool) -> Result<DirectorySnapshot> {
        let relays = self.list_relays().await?;
        let mut snapshot = DirectorySnapshot::from_relays(&relays);

        self.populate_countries(&mut snapshot.exits).await?;
        if with_guard_countries {
            self.populate_countries(&mut snapshot.guards).await?;
        }

        info!(
            guards = snapshot.guards.len(),
            middles = snapshot.middles.len(),
            exits = snapshot.exits.len(),
            "Directory snapshot ready"
        );
        Ok(snapshot)
    }
}
