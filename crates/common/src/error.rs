use crate::rules::RuleError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Recovery class of a control-channel failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlErrorKind {
    /// Reply did not parse; usually transient while the client is busy
    MalformedResponse,

    /// Socket refused or closed; re-authentication may recover it
    ConnectionLost,

    /// Command deadline elapsed
    Timeout,

    /// Well-formed 4xx/5xx reply
    Rejected,

    Other,
}

impl ControlErrorKind {
    /// Classify a free-form error message by the substrings control
    /// client libraries are known to produce
    pub fn classify(message: &str) -> Self {
        if message.contains("Invalid response format") {
            Self::MalformedResponse
        } else if message.contains("Connection refused")
            || message.contains("ECONNREFUSED")
            || message.contains("connection closed")
        {
            Self::ConnectionLost
        } else if message.contains("60 seconds") || message.contains("timed out") {
            Self::Timeout
        } else {
            Self::Other
        }
    }
}

impl std::fmt::Display for ControlErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::MalformedResponse => "malformed response",
            Self::ConnectionLost => "connection lost",
            Self::Timeout => "timeout",
            Self::Rejected => "rejected",
            Self::Other => "other",
        };
        write!(f, "{}", name)
    }
}

/// Error taxonomy for the routing engine
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Directory error: {0}")]
    Directory(String),

    #[error("GeoIP data unavailable after {attempts} attempts")]
    GeoDataUnavailable { attempts: u32 },

    #[error("No eligible exit for {target}")]
    NoEligibleExit { target: String },

    #[error("No eligible guard for {target}")]
    NoEligibleGuard { target: String },

    #[error("Insufficient middle relays for {target}: need {required}, have {available}")]
    InsufficientMiddleRelays {
        target: String,
        required: usize,
        available: usize,
    },

    #[error("Circuit extension timed out for {target}")]
    ExtendTimeout { target: String },

    #[error("Control channel error ({kind}): {message}")]
    ControlChannel {
        kind: ControlErrorKind,
        message: String,
    },

    #[error("Failed to attach stream {stream_id}: {message}")]
    StreamAttach { stream_id: String, message: String },

    #[error("Re-authentication failed: {0}")]
    ReauthenticationFailure(String),

    #[error("No route configured for {0}")]
    NoRouteConfigured(String),

    #[error("Invalid rule: {0}")]
    InvalidRule(#[from] RuleError),

    #[error("Proxy session is not running")]
    NotRunning,

    #[error("Proxy session is already running")]
    AlreadyRunning,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for routing operations
pub type Result<T> = std::result::Result<T, RouterError>;

impl RouterError {
    pub fn directory(msg: impl Into<String>) -> Self {
        Self::Directory(msg.into())
    }

    pub fn control(kind: ControlErrorKind, msg: impl Into<String>) -> Self {
        Self::ControlChannel {
            kind,
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Failures confined to a single route; the batch continues
    pub fn is_route_local(&self) -> bool {
        matches!(
            self,
            Self::NoEligibleExit { .. }
                | Self::NoEligibleGuard { .. }
                | Self::InsufficientMiddleRelays { .. }
                | Self::ExtendTimeout { .. }
                | Self::ControlChannel { .. }
        )
    }

    /// Failures that abort a whole bootstrap pass
    pub fn is_bootstrap_fatal(&self) -> bool {
        matches!(
            self,
            Self::Directory(_) | Self::GeoDataUnavailable { .. } | Self::ReauthenticationFailure(_)
        )
    }
}
