//! Custom error types for the instrument host.
//!
//! This module defines the primary error type, `LabError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of faults the remote access
//! core can hit, from configuration problems to transport failures and
//! session arbitration errors.
//!
//! ## Error Hierarchy
//!
//! `LabError` consolidates several fault domains:
//!
//! - **`Config`** / **`Configuration`**: parse-level errors from the `config`
//!   crate vs. semantic errors caught during validation (a value that parses
//!   but is logically invalid, e.g. a zero retry count).
//! - **`Io`** / **`Transport`**: transient link faults. Transport errors are
//!   the only category the session layer retries automatically.
//! - **`Command`**: the device rejected a well-formed command. Never retried;
//!   returned verbatim to the caller.
//! - **`Initialization`**: the driver handshake failed while bringing an
//!   instrument up.
//! - **`SessionExpired`** / **`Unavailable`** / **`DeviceUnavailable`** /
//!   **`AcquireTimedOut`**: concurrency and availability faults raised by the
//!   session manager.
//! - **`NotFound`** / **`NameConflict`**: registry faults.
//!
//! By using `#[from]`, `LabError` can be seamlessly created from underlying
//! error types, simplifying error handling throughout the crate with the `?`
//! operator.

use thiserror::Error;

use crate::transport::TransportError;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, LabError>;

#[derive(Error, Debug)]
pub enum LabError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Command rejected by device: {0}")]
    Command(String),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Session expired or token is not the current holder")]
    SessionExpired,

    #[error("Instrument unavailable: {0}")]
    Unavailable(String),

    #[error("Device unavailable after {attempts} attempts: {reason}")]
    DeviceUnavailable { attempts: u32, reason: String },

    #[error("Timed out waiting to acquire '{0}'")]
    AcquireTimedOut(String),

    #[error("No instrument registered under '{0}'")]
    NotFound(String),

    #[error("Name '{0}' is already bound to a different descriptor")]
    NameConflict(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::proxy::wire::WireError),

    #[error("Unknown driver type '{0}'")]
    UnknownDriver(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LabError {
    /// True for faults the session layer may retry (transient link errors).
    pub fn is_transient(&self) -> bool {
        matches!(self, LabError::Transport(_) | LabError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LabError::Command("wavelength out of range".to_string());
        assert_eq!(
            err.to_string(),
            "Command rejected by device: wavelength out of range"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(LabError::Transport(TransportError::NotConnected).is_transient());
        assert!(!LabError::Command("bad".into()).is_transient());
        assert!(!LabError::SessionExpired.is_transient());
    }

    #[test]
    fn test_device_unavailable_message() {
        let err = LabError::DeviceUnavailable {
            attempts: 3,
            reason: "read timeout".into(),
        };
        assert!(err.to_string().contains("3 attempts"));
    }
}
