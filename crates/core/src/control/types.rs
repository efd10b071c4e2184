use anonroute_common::{CircuitId, CountryCode, Fingerprint};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::str::FromStr;

/// Directory-asserted relay flag
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelayFlag {
    Authority,
    BadExit,
    Exit,
    Fast,
    Guard,
    HSDir,
    Running,
    Stable,
    V2Dir,
    Valid,
    Other(String),
}

impl FromStr for RelayFlag {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Authority" => Self::Authority,
            "BadExit" => Self::BadExit,
            "Exit" => Self::Exit,
            "Fast" => Self::Fast,
            "Guard" => Self::Guard,
            "HSDir" => Self::HSDir,
            "Running" => Self::Running,
            "Stable" => Self::Stable,
            "V2Dir" => Self::V2Dir,
            "Valid" => Self::Valid,
            other => Self::Other(other.to_string()),
        })
    }
}

/// A directory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    pub fingerprint: Fingerprint,
    pub nickname: String,
    pub ip: IpAddr,

    /// Filled in by a country population pass
    pub country: Option<CountryCode>,

    pub flags: HashSet<RelayFlag>,
}

impl Relay {
    pub fn new(fingerprint: Fingerprint, nickname: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            fingerprint,
            nickname: nickname.into(),
            ip,
            country: None,
            flags: HashSet::new(),
        }
    }

    pub fn with_flags<I: IntoIterator<Item = RelayFlag>>(mut self, flags: I) -> Self {
        self.flags.extend(flags);
        self
    }

    pub fn with_country(mut self, country: impl Into<CountryCode>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn has_flag(&self, flag: &RelayFlag) -> bool {
        self.flags.contains(flag)
    }

    pub fn in_country(&self, country: &CountryCode) -> bool {
        self.country
            .as_ref()
            .map(|c| country.matches(c.as_str()))
            .unwrap_or(false)
    }
}

/// Circuit build state as reported by the control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Launched,
    Built,
    GuardWait,
    Extended,
    Failed,
    Closed,
    Other(String),
}

impl CircuitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl FromStr for CircuitState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "LAUNCHED" => Self::Launched,
            "BUILT" => Self::Built,
            "GUARD_WAIT" => Self::GuardWait,
            "EXTENDED" => Self::Extended,
            "FAILED" => Self::Failed,
            "CLOSED" => Self::Closed,
            other => Self::Other(other.to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitPurpose {
    General,
    Controller,
    Testing,
    Other(String),
}

impl CircuitPurpose {
    /// Keyword used in EXTENDCIRCUIT
    pub fn as_keyword(&self) -> &str {
        match self {
            Self::General => "general",
            Self::Controller => "controller",
            Self::Testing => "testing",
            Self::Other(s) => s.as_str(),
        }
    }
}

impl FromStr for CircuitPurpose {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "GENERAL" => Self::General,
            "CONTROLLER" => Self::Controller,
            "TESTING" => Self::Testing,
            _ => Self::Other(s.to_string()),
        })
    }
}

/// One hop of a reported circuit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitHop {
    pub fingerprint: Fingerprint,
    pub nickname: Option<String>,
}

/// A row of circuit status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitStatus {
    pub circuit_id: CircuitId,
    pub state: CircuitState,
    pub purpose: CircuitPurpose,
    pub relays: Vec<CircuitHop>,
}

impl CircuitStatus {
    /// Built general-purpose circuit of the given length
    pub fn is_usable_fallback(&self, length: usize) -> bool {
        self.state == CircuitState::Built
            && self.purpose == CircuitPurpose::General
            && self.relays.len() == length
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayInfo {
    pub fingerprint: Fingerprint,
    pub nickname: String,
    pub ip: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendCircuitOptions {
    /// Guard first, exit last
    pub server_specs: Vec<Fingerprint>,
    pub purpose: CircuitPurpose,

    /// Wait until the circuit reports BUILT before returning
    pub await_build: bool,
}

impl ExtendCircuitOptions {
    pub fn general(server_specs: Vec<Fingerprint>) -> Self {
        Self {
            server_specs,
            purpose: CircuitPurpose::General,
            await_build: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamStatus {
    New,
    NewResolve,
    Remap,
    SentConnect,
    SentResolve,
    Succeeded,
    Failed,
    Closed,
    Detached,
    Other(String),
}

impl FromStr for StreamStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "NEW" => Self::New,
            "NEWRESOLVE" => Self::NewResolve,
            "REMAP" => Self::Remap,
            "SENTCONNECT" => Self::SentConnect,
            "SENTRESOLVE" => Self::SentResolve,
            "SUCCEEDED" => Self::Succeeded,
            "FAILED" => Self::Failed,
            "CLOSED" => Self::Closed,
            "DETACHED" => Self::Detached,
            other => Self::Other(other.to_string()),
        })
    }
}

/// Stream notification pushed by the control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub stream_id: String,
    pub status: StreamStatus,

    /// `None` or zero while the stream is unattached
    pub circuit_id: Option<CircuitId>,

    /// `host:port` as requested by the application
    pub target: String,
}

impl StreamEvent {
    pub fn new(
        stream_id: impl Into<String>,
        status: StreamStatus,
        circuit_id: Option<CircuitId>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            status,
            circuit_id,
            target: target.into(),
        }
    }

    pub fn is_unattached(&self) -> bool {
        self.circuit_id.map(|id| id.is_unattached()).unwrap_or(true)
    }
}
