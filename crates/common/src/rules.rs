use crate::config::routing;
use crate::types::CountryCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// User-defined routing rule, as persisted by the settings store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub title: String,

    /// Hostnames or addresses, without ports
    #[serde(default)]
    pub destinations: Vec<String>,

    /// Total circuit length, guard and exit included
    pub hops: usize,

    #[serde(default)]
    pub entry_countries: Vec<CountryCode>,

    #[serde(default)]
    pub exit_countries: Vec<CountryCode>,
}

impl RoutingRule {
    pub fn new(title: impl Into<String>, hops: usize) -> Self {
        Self {
            id: String::new(),
            title: title.into(),
            destinations: Vec::new(),
            hops,
            entry_countries: Vec::new(),
            exit_countries: Vec::new(),
        }
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destinations.push(destination.into());
        self
    }

    pub fn with_exit_country(mut self, country: impl Into<CountryCode>) -> Self {
        self.exit_countries.push(country.into());
        self
    }

    pub fn with_entry_country(mut self, country: impl Into<CountryCode>) -> Self {
        self.entry_countries.push(country.into());
        self
    }

    pub fn validate(&self) -> Result<(), RuleError> {
        if self.hops < routing::MIN_HOPS {
            return Err(RuleError::TooFewHops {
                hops: self.hops,
                min: routing::MIN_HOPS,
            });
        }
        if self.destinations.iter().all(|d| d.trim().is_empty()) {
            return Err(RuleError::NoDestinations);
        }
        Ok(())
    }

    /// One route per distinct, non-empty destination
    pub fn route_specs(&self) -> Vec<RouteSpec> {
        let mut seen: Vec<&str> = Vec::new();
        let mut specs = Vec::new();

        for destination in &self.destinations {
            let destination = destination.trim();
            if destination.is_empty() || seen.contains(&destination) {
                continue;
            }
            seen.push(destination);

            specs.push(RouteSpec {
                target_address: destination.to_string(),
                hops: self.hops,
                entry_countries: self.entry_countries.clone(),
                exit_countries: self.exit_countries.clone(),
            });
        }

        specs
    }
}

/// A single destination's circuit requirements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    pub target_address: String,
    pub hops: usize,
    pub entry_countries: Vec<CountryCode>,
    pub exit_countries: Vec<CountryCode>,
}

impl RouteSpec {
    pub fn new(target_address: impl Into<String>, hops: usize) -> Self {
        Self {
            target_address: target_address.into(),
            hops,
            entry_countries: Vec::new(),
            exit_countries: Vec::new(),
        }
    }

    pub fn with_exit_countries<I, C>(mut self, countries: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<CountryCode>,
    {
        self.exit_countries = countries.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_entry_countries<I, C>(mut self, countries: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<CountryCode>,
    {
        self.entry_countries = countries.into_iter().map(Into::into).collect();
        self
    }

    /// Number of middle positions between guard and exit
    pub fn middle_count(&self) -> usize {
        self.hops.saturating_sub(2)
    }

    pub fn allows_exit_country(&self, country: &str) -> bool {
        self.exit_countries.iter().any(|c| c.matches(country))
    }

    pub fn excludes_entry_country(&self, country: &str) -> bool {
        self.entry_countries.iter().any(|c| c.matches(country))
    }
}

/// Flatten rules into route specs, in rule order then destination order
pub fn flatten_rules(rules: &[RoutingRule]) -> Vec<RouteSpec> {
    rules.iter().flat_map(RoutingRule::route_specs).collect()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("rule needs at least {min} hops, got {hops}")]
    TooFewHops { hops: usize, min: usize },

    #[error("rule has no destinations")]
    NoDestinations,
}
