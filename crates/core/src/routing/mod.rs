//! Live destination to circuit bindings

mod map;
mod matching;

pub use map::{RouteEntry, RoutingMap};
pub use matching::{match_route_for_target, strip_port};
