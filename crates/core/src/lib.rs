pub mod circuit;
pub mod control;
pub mod directory;
pub mod geo;
pub mod health;
pub mod notify;
pub mod retry;
pub mod routing;
pub mod session;
pub mod store;
pub mod stream;

// Re-export circuit types
pub use circuit::{
    BootstrapReport, CircuitBuilder, PathSelectionError, PathSelector, RelayPath,
    SelectionOptions,
};

// Re-export control-channel types
pub use control::{
    CircuitState, CircuitStatus, ControlChannel, ControlError, ControlResult, Relay, RelayFlag,
    StreamEvent, StreamStatus, TorControlClient,
};

pub use directory::{DirectorySnapshot, RelayDirectory};
pub use geo::{Coordinates, FingerprintGeoIndex, GeoEntry, GeoIndexError};
pub use health::{HealthMonitor, TickOutcome};
pub use notify::{BroadcastNotifier, LogNotifier, Notification, NotificationSink};
pub use retry::{fetch_circuit_status, RetryError, RetryPolicy};
pub use routing::{match_route_for_target, strip_port, RouteEntry, RoutingMap};
pub use session::{CurrentRelay, Session, SessionOptions};
pub use store::{parse_rules_document, JsonRuleStore, RuleStore, StaticRuleStore};
pub use stream::{StreamAction, StreamReconciler};
