/// API Response types

use anonroute_common::RouteSpec;
use anonroute_core::RouteEntry;
use serde::{Deserialize, Serialize};

/// One routing map binding
#[derive(Debug, Serialize, Deserialize)]
pub struct RouteInfo {
    /// Destination as written in the rule
    pub target: String,
    pub circuit_id: u64,
}

impl From<RouteEntry> for RouteInfo {
    fn from(entry: RouteEntry) -> Self {
        Self {
            target: entry.target,
            circuit_id: entry.circuit_id.as_u64(),
        }
    }
}

/// Routing map response, in insertion order
#[derive(Debug, Serialize, Deserialize)]
pub struct RoutesResponse {
    pub routes: Vec<RouteInfo>,
    pub total: usize,
}

/// Flattened route specs of the running session
#[derive(Debug, Serialize, Deserialize)]
pub struct RulesResponse {
    pub routes: Vec<RouteSpec>,
    pub total: usize,
}

/// Session status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Whether the proxy session is running
    pub is_running: bool,
    /// Destinations currently bound to a circuit
    pub mapped_routes: usize,
    /// Destinations the rules asked for
    pub configured_routes: usize,
    /// Configured destinations without a circuit
    pub unrouted: usize,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: u16) -> Self {
        Self {
            error: error.into(),
            code,
        }
    }
}
