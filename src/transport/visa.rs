//! VISA transport for GPIB/USB/Ethernet instruments.
//!
//! Wraps the `visa-rs` crate and provides async I/O using Tokio's blocking
//! task executor for the synchronous VISA operations.
//!
//! Supports resource strings like:
//! - "GPIB0::1::INSTR" (GPIB interface)
//! - "USB0::0x1234::0x5678::SERIAL::INSTR" (USB)
//! - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)

use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_visa")]
use std::sync::Arc;
#[cfg(feature = "instrument_visa")]
use tracing::debug;
#[cfg(feature = "instrument_visa")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_visa")]
use visa_rs::{DefaultRM, Instrument, VISA};

use super::{Transport, TransportError};

pub struct VisaTransport {
    /// VISA resource string (e.g. "GPIB0::1::INSTR").
    resource_string: String,

    /// Read/write timeout.
    timeout: Duration,

    /// Line terminator for commands (typically "\n" for SCPI).
    line_terminator: String,

    /// The actual VISA instrument (behind Arc<Mutex> for async access).
    #[cfg(feature = "instrument_visa")]
    instrument: Option<Arc<Mutex<Box<dyn Instrument>>>>,
}

impl VisaTransport {
    pub fn new(resource_string: String) -> Self {
        Self {
            resource_string,
            timeout: Duration::from_secs(5),
            line_terminator: "\n".to_string(),
            #[cfg(feature = "instrument_visa")]
            instrument: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_line_terminator(mut self, terminator: String) -> Self {
        self.line_terminator = terminator;
        self
    }
}

#[async_trait]
impl Transport for VisaTransport {
    fn kind(&self) -> &str {
        "visa"
    }

    fn is_open(&self) -> bool {
        #[cfg(feature = "instrument_visa")]
        {
            self.instrument.is_some()
        }
        #[cfg(not(feature = "instrument_visa"))]
        {
            false
        }
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        #[cfg(feature = "instrument_visa")]
        {
            let resource_str = self.resource_string.clone();
            let timeout_ms = self.timeout.as_millis() as u32;

            let instrument = tokio::task::spawn_blocking(
                move || -> Result<Box<dyn Instrument>, TransportError> {
                    let rm = DefaultRM::new().map_err(|e| {
                        TransportError::ConnectionFailed(format!(
                            "failed to create VISA resource manager: {e}"
                        ))
                    })?;
                    rm.open(&resource_str, timeout_ms, 0).map_err(|e| {
                        TransportError::ConnectionFailed(format!(
                            "failed to open VISA resource '{resource_str}': {e}"
                        ))
                    })
                },
            )
            .await
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("VISA open task panicked: {e}"))
            })??;

            self.instrument = Some(Arc::new(Mutex::new(instrument)));
            debug!(
                resource = %self.resource_string,
                timeout_ms = self.timeout.as_millis() as u64,
                "visa resource opened"
            );
            Ok(())
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            Err(TransportError::FeatureDisabled("visa", "instrument_visa"))
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        #[cfg(feature = "instrument_visa")]
        {
            if self.instrument.take().is_some() {
                debug!(resource = %self.resource_string, "visa resource closed");
            }
        }
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        #[cfg(feature = "instrument_visa")]
        {
            let instrument = self
                .instrument
                .as_ref()
                .ok_or(TransportError::NotConnected)?
                .clone();
            let line = String::from_utf8_lossy(bytes).to_string();
            let timeout_ms = self.timeout.as_millis() as u32;

            tokio::task::spawn_blocking(move || -> Result<(), TransportError> {
                let mut guard = instrument.blocking_lock();
                guard.set_timeout(timeout_ms).map_err(|e| {
                    TransportError::ConnectionFailed(format!("failed to set VISA timeout: {e}"))
                })?;
                guard
                    .write(&line)
                    .map_err(|e| TransportError::ConnectionFailed(format!("VISA write failed: {e}")))
            })
            .await
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("VISA I/O task panicked: {e}"))
            })?
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = bytes;
            Err(TransportError::FeatureDisabled("visa", "instrument_visa"))
        }
    }

    async fn send(&mut self, command: &str) -> Result<(), TransportError> {
        #[cfg(feature = "instrument_visa")]
        {
            let line = format!("{}{}", command, self.line_terminator);
            self.write(line.as_bytes()).await
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = command;
            Err(TransportError::FeatureDisabled("visa", "instrument_visa"))
        }
    }

    async fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        // VISA sessions are message-oriented; raw reads go through query.
        let _ = timeout;
        Err(TransportError::InvalidConfig(
            "visa transport is message-oriented; use query".to_string(),
        ))
    }

    async fn query(&mut self, command: &str) -> Result<String, TransportError> {
        #[cfg(feature = "instrument_visa")]
        {
            let instrument = self
                .instrument
                .as_ref()
                .ok_or(TransportError::NotConnected)?
                .clone();
            let line = format!("{}{}", command, self.line_terminator);
            let command_for_log = command.to_string();
            let timeout = self.timeout;
            let expects_response = command.trim().ends_with('?');

            tokio::task::spawn_blocking(move || -> Result<String, TransportError> {
                let mut guard = instrument.blocking_lock();

                guard.set_timeout(timeout.as_millis() as u32).map_err(|e| {
                    TransportError::ConnectionFailed(format!("failed to set VISA timeout: {e}"))
                })?;

                if expects_response {
                    let response = guard.query(&line).map_err(|e| {
                        TransportError::ConnectionFailed(format!("VISA query failed: {e}"))
                    })?;
                    let response = response.trim().to_string();
                    debug!(command = command_for_log.trim(), response = %response, "visa query");
                    Ok(response)
                } else {
                    guard.write(&line).map_err(|e| {
                        TransportError::ConnectionFailed(format!("VISA write failed: {e}"))
                    })?;
                    debug!(command = command_for_log.trim(), "visa command sent");
                    Ok(String::new())
                }
            })
            .await
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("VISA I/O task panicked: {e}"))
            })?
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = command;
            Err(TransportError::FeatureDisabled("visa", "instrument_visa"))
        }
    }
}
