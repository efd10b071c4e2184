/// Routing daemon library
///
/// Wires a control-port client to a proxy session and exposes the
/// session's state over a small read-only HTTP API.

pub mod api;

pub use api::ApiServer;
