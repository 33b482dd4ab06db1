//! Transport adapters.
//!
//! A [`Transport`] wraps one physical communication channel (serial line,
//! VISA bus address, raw socket) behind a uniform byte-oriented contract.
//! While open, an adapter holds an exclusive OS-level handle to the channel.
//!
//! Failure policy: transient I/O errors are surfaced to the driver, which
//! decides whether to retry or escalate. An adapter never retries on its own.

pub mod mock;
pub mod serial;
pub mod tcp;
pub mod visa;

pub use mock::{MockScript, MockStep, MockTransport};
pub use serial::SerialTransport;
pub use tcp::TcpTransport;
pub use visa::VisaTransport;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::config::{TimeoutSettings, TransportConfig};

/// An error that can occur when interacting with a transport adapter.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Read timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unexpected end of stream")]
    UnexpectedEof,

    #[error("Invalid transport configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport '{0}' not enabled. Rebuild with --features {1}")]
    FeatureDisabled(&'static str, &'static str),
}

/// Uniform byte-oriented contract over one physical channel.
///
/// Adapters are driven from exactly one task at a time; concurrency
/// correctness is delegated entirely to the session layer.
#[async_trait]
pub trait Transport: Send {
    /// Short transport kind tag ("tcp", "serial", "visa", "mock").
    fn kind(&self) -> &str;

    /// Whether the underlying channel handle is currently held.
    fn is_open(&self) -> bool;

    /// Open the channel, taking the exclusive OS-level handle.
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Close the channel. Idempotent.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Write raw bytes to the channel.
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Write a line-terminated command without reading a response.
    async fn send(&mut self, command: &str) -> Result<(), TransportError>;

    /// Read available bytes, waiting up to `timeout`.
    async fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Write a line-terminated command and read a single response line.
    async fn query(&mut self, command: &str) -> Result<String, TransportError>;

    /// Close, wait for the channel to settle, and re-open.
    async fn reset(&mut self, settle: Duration) -> Result<(), TransportError> {
        self.close().await?;
        tokio::time::sleep(settle).await;
        self.open().await
    }
}

/// Build a transport from its configuration. Does not open the channel.
pub fn build_transport(
    config: &TransportConfig,
    timeouts: &TimeoutSettings,
) -> Result<Box<dyn Transport>, TransportError> {
    match config {
        TransportConfig::Tcp {
            host,
            port,
            read_timeout,
        } => Ok(Box::new(TcpTransport::new(
            host.clone(),
            *port,
            read_timeout.unwrap_or(timeouts.network_read),
        ))),
        TransportConfig::Serial {
            port,
            baud_rate,
            read_timeout,
            line_terminator,
        } => Ok(Box::new(
            SerialTransport::new(port.clone(), *baud_rate)
                .with_timeout(read_timeout.unwrap_or(timeouts.serial_read))
                .with_line_terminator(line_terminator.clone()),
        )),
        TransportConfig::Visa {
            resource,
            read_timeout,
        } => Ok(Box::new(
            VisaTransport::new(resource.clone())
                .with_timeout(read_timeout.unwrap_or(timeouts.network_read)),
        )),
        TransportConfig::Mock { replies } => {
            Ok(Box::new(MockTransport::with_replies(replies.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_transport_kinds() {
        let timeouts = TimeoutSettings::default();

        let tcp = build_transport(
            &TransportConfig::Tcp {
                host: "10.0.0.5".into(),
                port: 5025,
                read_timeout: None,
            },
            &timeouts,
        )
        .unwrap();
        assert_eq!(tcp.kind(), "tcp");
        assert!(!tcp.is_open());

        let mock = build_transport(
            &TransportConfig::Mock {
                replies: Default::default(),
            },
            &timeouts,
        )
        .unwrap();
        assert_eq!(mock.kind(), "mock");
    }
}
