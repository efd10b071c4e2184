use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Control-port constants
pub mod control {
    /// Default control port of the network client
    pub const DEFAULT_PORT: u16 = 9051;

    /// Default control address
    pub const DEFAULT_ADDR: &str = "127.0.0.1:9051";

    /// Deadline for a single command, circuit builds included
    pub const COMMAND_TIMEOUT_SECS: u64 = 60;

    /// Poll interval while waiting for an extended circuit to build
    pub const BUILD_POLL_INTERVAL_MS: u64 = 500;

    /// Capacity of the stream event channel
    pub const EVENT_CHANNEL_CAPACITY: usize = 256;
}

/// Retry and backoff constants
pub mod retry {
    /// Circuit status attempts per call site
    pub const STATUS_ATTEMPTS: u32 = 3;

    /// Pause between circuit status attempts
    pub const STATUS_DELAY_MS: u64 = 2000;

    /// Country population attempts before giving up
    pub const GEO_ATTEMPTS: u32 = 3;

    /// Pause between country population attempts
    pub const GEO_DELAY_MS: u64 = 2000;

    /// Relay info lookups per circuit when resolving the current relay
    pub const RELAY_INFO_ATTEMPTS: u32 = 2;

    /// Pause after the network client starts before the control port is used
    pub const CONTROL_SETTLE_MS: u64 = 1500;
}

/// Health monitor constants
pub mod monitor {
    /// Circuit status poll interval
    pub const INTERVAL_SECS: u64 = 5;
}

/// Routing constants
pub mod routing {
    /// Guard plus exit
    pub const MIN_HOPS: usize = 2;

    /// Relay count a fallback circuit must have
    pub const FALLBACK_CIRCUIT_LENGTH: usize = 3;
}

/// How to authenticate against the control port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ControlAuth {
    /// No authentication configured on the client
    None,

    /// Ask PROTOCOLINFO and pick the first method that works
    Auto,

    /// Read a cookie file
    Cookie(PathBuf),

    /// Hashed-password authentication
    Password(String),
}

impl FromStr for ControlAuth {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "auto" | "" => Ok(Self::Auto),
            other => {
                if let Some(path) = other.strip_prefix("cookie:") {
                    Ok(Self::Cookie(PathBuf::from(path)))
                } else if let Some(secret) = other.strip_prefix("password:") {
                    Ok(Self::Password(secret.to_string()))
                } else {
                    Err(ConfigError::ParseError(format!(
                        "unknown control_auth '{}', expected none, auto, cookie:<path> or password:<secret>",
                        other
                    )))
                }
            }
        }
    }
}

impl TryFrom<String> for ControlAuth {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ControlAuth> for String {
    fn from(value: ControlAuth) -> Self {
        match value {
            ControlAuth::None => "none".to_string(),
            ControlAuth::Auto => "auto".to_string(),
            ControlAuth::Cookie(path) => format!("cookie:{}", path.display()),
            ControlAuth::Password(secret) => format!("password:{}", secret),
        }
    }
}

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Control port address
    pub control_addr: String,

    /// Control port authentication
    pub control_auth: ControlAuth,

    /// Settings document holding `proxyRules`
    pub rules_path: PathBuf,

    /// Fingerprint to geo document, if any
    pub geo_index_path: Option<PathBuf>,

    /// Read-only API listen address
    pub api_addr: String,

    /// Health monitor poll interval
    pub monitor_interval_secs: u64,

    /// Exclude guards located in a rule's entry countries
    pub enforce_entry_countries: bool,

    /// Enable verbose logging
    pub verbose: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            control_addr: control::DEFAULT_ADDR.to_string(),
            control_auth: ControlAuth::Auto,
            rules_path: PathBuf::from("./settings.json"),
            geo_index_path: None,
            api_addr: "127.0.0.1:9150".to_string(),
            monitor_interval_secs: monitor::INTERVAL_SECS,
            enforce_entry_countries: false,
            verbose: false,
        }
    }
}

impl RouterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_control_addr(mut self, addr: impl Into<String>) -> Self {
        self.control_addr = addr.into();
        self
    }

    pub fn with_control_auth(mut self, auth: ControlAuth) -> Self {
        self.control_auth = auth;
        self
    }

    pub fn with_rules_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.rules_path = path.into();
        self
    }

    pub fn with_geo_index_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.geo_index_path = Some(path.into());
        self
    }

    pub fn with_monitor_interval(mut self, secs: u64) -> Self {
        self.monitor_interval_secs = secs.max(1);
        self
    }

    pub fn with_entry_country_enforcement(mut self, enforce: bool) -> Self {
        self.enforce_entry_countries = enforce;
        self
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(control::COMMAND_TIMEOUT_SECS)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &PathBuf) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RouterConfig::default();
        assert_eq!(config.control_addr, "127.0.0.1:9051");
        assert_eq!(config.monitor_interval(), Duration::from_secs(5));
        assert!(!config.enforce_entry_countries);
        assert_eq!(config.control_auth, ControlAuth::Auto);
    }

    #[test]
    fn test_config_builder() {
        let config = RouterConfig::new()
            .with_control_addr("10.0.0.1:9051")
            .with_monitor_interval(0)
            .with_entry_country_enforcement(true);

        assert_eq!(config.control_addr, "10.0.0.1:9051");
        assert_eq!(config.monitor_interval_secs, 1);
        assert!(config.enforce_entry_countries);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: RouterConfig = toml::from_str(
            r#"
            control_auth = "cookie:/run/tor/control.authcookie"
            enforce_entry_countries = true
            "#,
        )
        .unwrap();

        assert_eq!(
            config.control_auth,
            ControlAuth::Cookie(PathBuf::from("/run/tor/control.authcookie"))
        );
        assert!(config.enforce_entry_countries);
        assert_eq!(config.monitor_interval_secs, monitor::INTERVAL_SECS);
    }

    #[test]
    fn test_rejects_unknown_auth() {
        assert!("kerberos".parse::<ControlAuth>().is_err());
        assert_eq!(
            "password:hunter2".parse::<ControlAuth>().unwrap(),
            ControlAuth::Password("hunter2".into())
        );
    }
}
