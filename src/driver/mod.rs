//! Driver abstraction.
//!
//! A [`Driver`] translates domain operations (e.g. `set_wavelength`) into
//! adapter-level byte exchanges for one instrument family. Drivers are safe
//! to call sequentially only; the session layer guarantees that a driver is
//! touched by exactly one task at a time.
//!
//! The error split at this boundary matters: a device rejecting a
//! well-formed command surfaces as [`LabError::Command`] and is never
//! retried, while a link failure surfaces as [`LabError::Transport`] and is
//! handled by the session layer's bounded reconnection policy.

pub mod mock;
pub mod scpi;

pub use mock::MockDriver;
pub use scpi::ScpiDriver;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::{InstrumentConfig, TimeoutSettings};
use crate::error::LabError;
use crate::transport::build_transport;

/// Strongly-typed argument for driver operations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Bool(b) => write!(f, "{}", b),
            ArgValue::Int(i) => write!(f, "{}", i),
            ArgValue::Float(fl) => write!(f, "{}", fl),
            ArgValue::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        ArgValue::Bool(value)
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        ArgValue::Int(value)
    }
}

impl From<f64> for ArgValue {
    fn from(value: f64) -> Self {
        ArgValue::Float(value)
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::Str(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        ArgValue::Str(value)
    }
}

/// Result of a driver operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CommandReply {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl CommandReply {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CommandReply::Float(f) => Some(*f),
            CommandReply::Int(i) => Some(*i as f64),
            CommandReply::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CommandReply::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Driver lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverState {
    /// Driver object created but the handshake has not run.
    Uninitialized,
    /// Connected and ready to execute commands.
    Ready,
    /// Last operation hit an unrecovered fault.
    Fault,
    /// Shut down; the transport has been released.
    ShutDown,
}

/// Structured status snapshot returned by `query_status`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DriverStatus {
    pub state: DriverState,
    /// Identity string reported by the device handshake, if any.
    pub identity: Option<String>,
    pub last_error: Option<String>,
}

/// Capability contract implemented by every instrument family.
#[async_trait]
pub trait Driver: Send {
    /// Instrument family tag ("scpi", "mock", ...).
    fn name(&self) -> &str;

    fn state(&self) -> DriverState;

    /// Open the transport and run the device handshake.
    ///
    /// Fails with [`LabError::Initialization`] if the handshake fails.
    async fn initialize(&mut self) -> Result<(), LabError>;

    /// Execute a domain operation.
    async fn execute(&mut self, command: &str, args: &[ArgValue]) -> Result<CommandReply, LabError>;

    /// Structured status snapshot.
    async fn query_status(&mut self) -> Result<DriverStatus, LabError>;

    /// Release the transport. Idempotent.
    async fn shutdown(&mut self) -> Result<(), LabError>;

    /// Reset the transport and re-run the handshake after a link failure.
    /// Called only by the session layer's reconnection policy.
    async fn reconnect(&mut self) -> Result<(), LabError>;
}

/// Build a driver (and its transport) from an instrument configuration.
/// Does not connect; the handshake runs on `initialize`.
pub fn build_driver(
    config: &InstrumentConfig,
    timeouts: &TimeoutSettings,
) -> Result<Box<dyn Driver>, LabError> {
    match config.driver.as_str() {
        "scpi" => {
            let transport = build_transport(&config.transport, timeouts)?;
            Ok(Box::new(ScpiDriver::new(
                transport,
                config.commands.clone(),
                timeouts.reset_settle,
            )))
        }
        "mock" => Ok(Box::new(MockDriver::new())),
        other => Err(LabError::UnknownDriver(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use std::collections::HashMap;

    #[test]
    fn test_arg_value_display() {
        assert_eq!(ArgValue::Float(1550.0).to_string(), "1550");
        assert_eq!(ArgValue::Str("on".into()).to_string(), "on");
        assert_eq!(ArgValue::Bool(true).to_string(), "true");
    }

    #[test]
    fn test_reply_conversions() {
        assert_eq!(CommandReply::Str("1.5".into()).as_f64(), Some(1.5));
        assert_eq!(CommandReply::Int(3).as_f64(), Some(3.0));
        assert_eq!(CommandReply::None.as_f64(), None);
    }

    #[test]
    fn test_build_driver_unknown_tag() {
        let config = InstrumentConfig {
            driver: "quantum".to_string(),
            transport: TransportConfig::Mock {
                replies: HashMap::new(),
            },
            commands: HashMap::new(),
        };
        let result = build_driver(&config, &TimeoutSettings::default());
        assert!(matches!(result, Err(LabError::UnknownDriver(_))));
    }

    #[test]
    fn test_build_driver_known_tags() {
        let config = InstrumentConfig {
            driver: "mock".to_string(),
            transport: TransportConfig::Mock {
                replies: HashMap::new(),
            },
            commands: HashMap::new(),
        };
        let driver = build_driver(&config, &TimeoutSettings::default()).unwrap();
        assert_eq!(driver.name(), "mock");
        assert_eq!(driver.state(), DriverState::Uninitialized);
    }
}
