//! Common error types for boardlink.
//!
//! This module provides a centralized Error enum using thiserror,
//! with conversions from underlying error types used throughout the crate.

use thiserror::Error;

/// Main error type for boardlink operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port errors
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Unknown board or transport kind, missing or malformed field
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport construction, bind, connect or socket failures
    #[error("Transport error: {0}")]
    Transport(String),

    /// Message-bus client errors for bridged serial links
    #[error("Bus error: {0}")]
    Bus(String),

    /// Board protocol handshake failed or timed out
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// A pin or peripheral command was rejected
    #[error("Command error: {0}")]
    Command(String),

    /// The board no longer has a transport attached
    #[error("Board is not connected")]
    NotConnected,

    /// Failure while closing an owned handle
    #[error("Teardown error: {0}")]
    Teardown(String),
}

/// Failure classes the connection manager reports to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ErrorClass {
    Configuration,
    Transport,
    Handshake,
    Command,
    Teardown,
}

impl Error {
    /// Classify this error for reporting.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Config(_) => ErrorClass::Configuration,
            Error::Io(_) | Error::Serial(_) | Error::Transport(_) | Error::Bus(_) => {
                ErrorClass::Transport
            }
            Error::Handshake(_) => ErrorClass::Handshake,
            Error::Command(_) | Error::NotConnected => ErrorClass::Command,
            Error::Teardown(_) => ErrorClass::Teardown,
        }
    }
}

impl From<rumqttc::ClientError> for Error {
    fn from(e: rumqttc::ClientError) -> Self {
        Error::Bus(e.to_string())
    }
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_follow_taxonomy() {
        assert_eq!(Error::Config("x".into()).class(), ErrorClass::Configuration);
        assert_eq!(
            Error::Io(std::io::Error::other("refused")).class(),
            ErrorClass::Transport
        );
        assert_eq!(Error::Handshake("timeout".into()).class(), ErrorClass::Handshake);
        assert_eq!(Error::NotConnected.class(), ErrorClass::Command);
        assert_eq!(ErrorClass::Configuration.to_string(), "configuration");
    }
}
