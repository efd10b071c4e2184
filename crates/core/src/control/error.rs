use anonroute_common::{ControlErrorKind, RouterError};
use thiserror::Error;

/// A failed control-channel call, tagged with its recovery class
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ControlError {
    pub kind: ControlErrorKind,
    pub message: String,
}

impl ControlError {
    pub fn new(kind: ControlErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify an untyped error message by substring
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: ControlErrorKind::classify(&message),
            message,
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(
            ControlErrorKind::MalformedResponse,
            format!("Invalid response format: {}", message.into()),
        )
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(ControlErrorKind::ConnectionLost, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ControlErrorKind::Timeout, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ControlErrorKind::Rejected, message)
    }

    pub fn is_malformed(&self) -> bool {
        self.kind == ControlErrorKind::MalformedResponse
    }

    pub fn is_connection_lost(&self) -> bool {
        self.kind == ControlErrorKind::ConnectionLost
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ControlErrorKind::Timeout
    }
}

impl From<std::io::Error> for ControlError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let kind = match err.kind() {
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ControlErrorKind::ConnectionLost,
            ErrorKind::TimedOut => ControlErrorKind::Timeout,
            _ => ControlErrorKind::Other,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<ControlError> for RouterError {
    fn from(err: ControlError) -> Self {
        RouterError::control(err.kind, err.message)
    }
}
