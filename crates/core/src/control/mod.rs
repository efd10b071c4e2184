//! Control-channel surface of the network client
//!
//! Everything the routing engine needs from the client process goes
//! through [`ControlChannel`]. [`TorControlClient`] speaks the text
//! control-port protocol over TCP; tests substitute an in-memory fake.

mod client;
mod error;
mod parse;
mod types;

#[cfg(test)]
pub(crate) mod fake;

pub use client::TorControlClient;
pub use error::ControlError;
pub use parse::{parse_circuit_status, parse_router_status, parse_stream_event};
pub use types::{
    CircuitHop, CircuitPurpose, CircuitState, CircuitStatus, ExtendCircuitOptions, Relay,
    RelayFlag, RelayInfo, StreamEvent, StreamStatus,
};

use anonroute_common::{CircuitId, Fingerprint};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Result type for control-channel calls
pub type ControlResult<T> = std::result::Result<T, ControlError>;

/// RPC-like surface of the network client's control channel
///
/// Implementations must be safe to call from the health monitor, the
/// stream reconciler and the circuit builder concurrently.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// (Re-)establish and authenticate the command connection
    async fn authenticate(&self) -> ControlResult<()>;

    /// Current relay directory
    async fn get_relays(&self) -> ControlResult<Vec<Relay>>;

    async fn circuit_status(&self) -> ControlResult<Vec<CircuitStatus>>;

    async fn get_relay_info(&self, fingerprint: &Fingerprint) -> ControlResult<RelayInfo>;

    /// Build a new circuit through the given relays
    async fn extend_circuit(&self, options: ExtendCircuitOptions) -> ControlResult<CircuitId>;

    async fn close_circuit(&self, circuit_id: CircuitId) -> ControlResult<()>;

    async fn attach_stream(&self, stream_id: &str, circuit_id: CircuitId) -> ControlResult<()>;

    /// Stop the client from attaching new streams on its own
    async fn disable_stream_attachment(&self) -> ControlResult<()>;

    /// Hand stream attachment back to the client
    async fn enable_stream_attachment(&self) -> ControlResult<()>;

    /// Start pushing stream events onto the returned channel
    async fn subscribe_stream_events(&self) -> ControlResult<mpsc::Receiver<StreamEvent>>;

    async fn unsubscribe_stream_events(&self) -> ControlResult<()>;

    /// Fill in `country` for each relay from the client's GeoIP data
    async fn populate_countries(&self, relays: &mut [Relay]) -> ControlResult<()>;
}
