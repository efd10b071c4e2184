/// Read-only REST API for the routing daemon
///
/// Lets the UI and local tools query:
/// - Routing map entries
/// - Configured route specs
/// - The relay the client currently enters through
/// - Session status

pub mod handlers;
pub mod responses;
pub mod server;

pub use responses::*;
pub use server::ApiServer;
