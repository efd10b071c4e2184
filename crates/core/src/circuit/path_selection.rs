use crate::directory::DirectorySnapshot;
use crate::control::Relay;
use anonroute_common::{routing, Fingerprint, RouteSpec, RouterError};
use rand::seq::SliceRandom;
use rand::Rng;
use std::fmt;

/// Ordered relay fingerprints: guard first, exit last
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPath(Vec<Fingerprint>);

impl RelayPath {
    pub fn guard(&self) -> Option<&Fingerprint> {
        self.0.first()
    }

    pub fn exit(&self) -> Option<&Fingerprint> {
        self.0.last()
    }

    pub fn middles(&self) -> &[Fingerprint] {
        if self.0.len() <= 2 {
            &[]
        } else {
            &self.0[1..self.0.len() - 1]
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fingerprints(&self) -> &[Fingerprint] {
        &self.0
    }

    pub fn into_fingerprints(self) -> Vec<Fingerprint> {
        self.0
    }
}

impl fmt::Display for RelayPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hops: Vec<String> = self.0.iter().map(|fp| format!("${}", fp)).collect();
        write!(f, "{}", hops.join(","))
    }
}

/// Knobs for path selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectionOptions {
    /// Skip guards located in one of the route's entry countries
    pub enforce_entry_countries: bool,
}

impl SelectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry_country_enforcement(mut self, enabled: bool) -> Self {
        self.enforce_entry_countries = enabled;
        self
    }
}

/// Select relays for a route's circuit
#[derive(Debug, Clone, Copy, Default)]
pub struct PathSelector {
    options: SelectionOptions,
}

impl PathSelector {
    pub fn new(options: SelectionOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> SelectionOptions {
        self.options
    }

    /// Select `[guard, middle.., exit]` for the route
    ///
    /// Uniform choice at every position; no fingerprint repeats.
    pub fn select_path<R: Rng + ?Sized>(
        &self,
        route: &RouteSpec,
        snapshot: &DirectorySnapshot,
        rng: &mut R,
    ) -> Result<RelayPath, PathSelectionError> {
        if route.hops < routing::MIN_HOPS {
            return Err(PathSelectionError::TooFewHops(route.hops));
        }

        let exit = Self::select_exit_node(route, &snapshot.exits, rng)?;
        let guard = self.select_entry_guard(route, &snapshot.guards, &[exit], rng)?;

        let mut selected = vec![guard];
        let required = route.middle_count();
        for _ in 0..required {
            let available: Vec<&Relay> = snapshot
                .middles
                .iter()
                .filter(|r| !selected.contains(&r.fingerprint) && r.fingerprint != exit)
                .collect();

            let chosen = available
                .choose(rng)
                .ok_or(PathSelectionError::InsufficientMiddleRelays {
                    required,
                    available: selected.len() - 1,
                })?;
            selected.push(chosen.fingerprint);
        }
        selected.push(exit);

        Ok(RelayPath(selected))
    }

    /// Exit in one of the route's exit countries
    pub fn select_exit_node<R: Rng + ?Sized>(
        route: &RouteSpec,
        exits: &[Relay],
        rng: &mut R,
    ) -> Result<Fingerprint, PathSelectionError> {
        let candidates: Vec<&Relay> = exits
            .iter()
            .filter(|r| {
                r.country
                    .as_ref()
                    .map(|c| route.allows_exit_country(c.as_str()))
                    .unwrap_or(false)
            })
            .collect();

        candidates
            .choose(rng)
            .map(|r| r.fingerprint)
            .ok_or(PathSelectionError::NoEligibleExit)
    }

    /// Guard from the full guard pool, minus `excluded`
    ///
    /// With entry-country enforcement on, guards in the route's entry
    /// countries are skipped as well.
    pub fn select_entry_guard<R: Rng + ?Sized>(
        &self,
        route: &RouteSpec,
        guards: &[Relay],
        excluded: &[Fingerprint],
        rng: &mut R,
    ) -> Result<Fingerprint, PathSelectionError> {
        let candidates: Vec<&Relay> = guards
            .iter()
            .filter(|r| !excluded.contains(&r.fingerprint))
            .filter(|r| {
                if !self.options.enforce_entry_countries {
                    return true;
                }
                r.country
                    .as_ref()
                    .map(|c| !route.excludes_entry_country(c.as_str()))
                    .unwrap_or(true)
            })
            .collect();

        candidates
            .choose(rng)
            .map(|r| r.fingerprint)
            .ok_or(PathSelectionError::NoGuards)
    }
}

/// Errors that can occur during path selection
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathSelectionError {
    #[error("No exit relay in the requested countries")]
    NoEligibleExit,

    #[error("No eligible guard relay")]
    NoGuards,

    #[error("Insufficient middle relays: {available} < {required}")]
    InsufficientMiddleRelays { required: usize, available: usize },

    #[error("Circuit length {0} is below the minimum")]
    TooFewHops(usize),
}

impl PathSelectionError {
    /// Attach the route's target address
    pub fn for_target(self, target: &str) -> RouterError {
        let target = target.to_string();
        match self {
            Self::NoEligibleExit => RouterError::NoEligibleExit { target },
            Self::NoGuards => RouterError::NoEligibleGuard { target },
            Self::InsufficientMiddleRelays {
                required,
                available,
            } => RouterError::InsufficientMiddleRelays {
                target,
                required,
                available,
            },
            Self::TooFewHops(hops) => RouterError::InvalidRule(anonroute_common::RuleError::TooFewHops {
                hops,
                min: routing::MIN_HOPS,
            }),
        }
    }
}
