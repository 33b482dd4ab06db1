//! Serial transport for RS-232 instruments.
//!
//! Wraps the `serialport` crate and provides async I/O by moving the
//! blocking serial operations onto Tokio's blocking task executor. Compiled
//! without the `instrument_serial` feature, the adapter still exists but
//! fails at `open` so configuration handling stays uniform.

use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use tracing::debug;
#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;

use super::{Transport, TransportError};

pub struct SerialTransport {
    /// Port name (e.g. "/dev/ttyUSB0", "COM3").
    port_name: String,

    /// Baud rate (e.g. 9600, 115200).
    baud_rate: u32,

    /// Read timeout for queries.
    timeout: Duration,

    /// Line terminator for commands (e.g. "\r\n").
    line_terminator: String,

    /// Response line ending character.
    response_delimiter: u8,

    /// The actual serial port (behind Arc<Mutex> for async access).
    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialTransport {
    pub fn new(port_name: String, baud_rate: u32) -> Self {
        Self {
            port_name,
            baud_rate,
            timeout: Duration::from_secs(2),
            line_terminator: "\r\n".to_string(),
            response_delimiter: b'\n',
            #[cfg(feature = "instrument_serial")]
            port: None,
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
impl Transport for SerialTransport {
    fn kind(&self) -> &str {
        "serial"
    }

    fn is_open(&self) -> bool {
        #[cfg(feature = "instrument_serial")]
        {
            self.port.is_some()
        }
        #[cfg(not(feature = "instrument_serial"))]
        {
            false
        }
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        #[cfg(feature = "instrument_serial")]
        {
            // Internal read timeout is short; the overall bound is enforced
            // per call in read/query.
            let port = serialport::new(&self.port_name, self.baud_rate)
                .timeout(Duration::from_millis(100))
                .open()
                .map_err(|e| {
                    TransportError::ConnectionFailed(format!(
                        "failed to open serial port '{}' at {} baud: {e}",
                        self.port_name, self.baud_rate
                    ))
                })?;

            self.port = Some(Arc::new(Mutex::new(port)));
            debug!(
                port = %self.port_name,
                baud = self.baud_rate,
                "serial port opened"
            );
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(TransportError::FeatureDisabled(
                "serial",
                "instrument_serial",
            ))
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        #[cfg(feature = "instrument_serial")]
        {
            if self.port.take().is_some() {
                debug!(port = %self.port_name, "serial port closed");
            }
        }
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port.as_ref().ok_or(TransportError::NotConnected)?;
            let port = port.clone();
            let bytes = bytes.to_vec();

            // Execute blocking serial I/O on a dedicated thread.
            tokio::task::spawn_blocking(move || -> Result<(), TransportError> {
                use std::io::Write;
                let mut guard = port.blocking_lock();
                guard.write_all(&bytes)?;
                guard.flush()?;
                Ok(())
            })
            .await
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("serial I/O task panicked: {e}"))
            })?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = bytes;
            Err(TransportError::FeatureDisabled(
                "serial",
                "instrument_serial",
            ))
        }
    }

    async fn send(&mut self, command: &str) -> Result<(), TransportError> {
        #[cfg(feature = "instrument_serial")]
        {
            let line = format!("{}{}", command, self.line_terminator);
            self.write(line.as_bytes()).await?;
            debug!(command = command.trim(), "sent serial command");
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = command;
            Err(TransportError::FeatureDisabled(
                "serial",
                "instrument_serial",
            ))
        }
    }

    async fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port.as_ref().ok_or(TransportError::NotConnected)?;
            let port = port.clone();

            tokio::task::spawn_blocking(move || -> Result<Vec<u8>, TransportError> {
                use std::io::Read;
                let mut guard = port.blocking_lock();
                let mut out = Vec::new();
                let mut buffer = [0u8; 256];
                let start = std::time::Instant::now();

                loop {
                    if start.elapsed() > timeout {
                        if out.is_empty() {
                            return Err(TransportError::Timeout(timeout));
                        }
                        return Ok(out);
                    }
                    match guard.read(&mut buffer) {
                        Ok(0) => return Err(TransportError::UnexpectedEof),
                        Ok(n) => {
                            out.extend_from_slice(&buffer[..n]);
                            return Ok(out);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                        Err(e) => return Err(TransportError::Io(e)),
                    }
                }
            })
            .await
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("serial I/O task panicked: {e}"))
            })?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = timeout;
            Err(TransportError::FeatureDisabled(
                "serial",
                "instrument_serial",
            ))
        }
    }

    async fn query(&mut self, command: &str) -> Result<String, TransportError> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port.as_ref().ok_or(TransportError::NotConnected)?;
            let port = port.clone();
            let line = format!("{}{}", command, self.line_terminator);
            let command_for_log = command.to_string();
            let delimiter = self.response_delimiter;
            let timeout = self.timeout;

            tokio::task::spawn_blocking(move || -> Result<String, TransportError> {
                use std::io::{Read, Write};
                let mut guard = port.blocking_lock();

                guard.write_all(line.as_bytes())?;
                guard.flush()?;
                debug!(command = command_for_log.trim(), "sent serial command");

                // Read byte-wise until the delimiter, bounded overall.
                let mut response = Vec::new();
                let mut buffer = [0u8; 1];
                let start = std::time::Instant::now();

                loop {
                    if start.elapsed() > timeout {
                        return Err(TransportError::Timeout(timeout));
                    }
                    match guard.read(&mut buffer) {
                        Ok(1) => {
                            if buffer[0] == delimiter {
                                break;
                            }
                            response.push(buffer[0]);
                        }
                        Ok(0) => return Err(TransportError::UnexpectedEof),
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                        Err(e) => return Err(TransportError::Io(e)),
                        Ok(_) => continue,
                    }
                }

                let response = String::from_utf8_lossy(&response).trim().to_string();
                debug!(response = %response, "received serial response");
                Ok(response)
            })
            .await
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("serial I/O task panicked: {e}"))
            })?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = command;
            Err(TransportError::FeatureDisabled(
                "serial",
                "instrument_serial",
            ))
        }
    }
}
