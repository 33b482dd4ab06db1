//! Generic SCPI driver.
//!
//! SCPI (Standard Commands for Programmable Instruments) is a standardized
//! text command set spoken by most bench instruments. This driver works over
//! any [`Transport`] and maps logical operation names to SCPI exchange
//! templates from the instrument configuration, so one driver variant covers
//! serial, VISA-bus and socket instrument families.
//!
//! ## Configuration example
//!
//! ```toml
//! [instruments.laser-1]
//! driver = "scpi"
//!
//! [instruments.laser-1.transport]
//! kind = "tcp"
//! host = "10.0.0.5"
//! port = 5025
//!
//! [instruments.laser-1.commands]
//! set_wavelength = ":WAV {0}NM"
//! get_wavelength = ":WAV?"
//! enable_output = ":POW:STAT ON"
//! ```
//!
//! Templates ending in `?` are queries; everything else is a write.
//! `{0}`, `{1}`, ... are replaced with the call arguments. A response
//! beginning with `ERR` is treated as a device rejection.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ArgValue, CommandReply, Driver, DriverState, DriverStatus};
use crate::error::LabError;
use crate::transport::Transport;

pub struct ScpiDriver {
    transport: Box<dyn Transport>,

    /// Logical operation name -> SCPI exchange template.
    commands: HashMap<String, String>,

    /// Settle delay used between close and re-open on reconnect.
    reset_settle: Duration,

    state: DriverState,

    /// Identity reported by `*IDN?` during the handshake.
    identity: Option<String>,

    last_error: Option<String>,
}

impl ScpiDriver {
    pub fn new(
        transport: Box<dyn Transport>,
        commands: HashMap<String, String>,
        reset_settle: Duration,
    ) -> Self {
        Self {
            transport,
            commands,
            reset_settle,
            state: DriverState::Uninitialized,
            identity: None,
            last_error: None,
        }
    }

    /// Expand `{0}`, `{1}`, ... placeholders with the call arguments.
    fn format_template(template: &str, args: &[ArgValue]) -> Result<String, LabError> {
        let mut out = template.to_string();
        for (i, arg) in args.iter().enumerate() {
            out = out.replace(&format!("{{{i}}}"), &arg.to_string());
        }
        if out.contains('{') && out.contains('}') {
            return Err(LabError::Command(format!(
                "template '{template}' expects more arguments than the {} given",
                args.len()
            )));
        }
        Ok(out)
    }

    /// Resolve a logical command to its wire form.
    fn resolve(&self, command: &str, args: &[ArgValue]) -> Result<String, LabError> {
        // "raw" passes the first argument through verbatim, for bring-up.
        if command == "raw" {
            return match args.first() {
                Some(ArgValue::Str(line)) => Ok(line.clone()),
                _ => Err(LabError::Command(
                    "raw expects one string argument".to_string(),
                )),
            };
        }
        let template = self
            .commands
            .get(command)
            .map(String::as_str)
            .or(match command {
                "identify" => Some("*IDN?"),
                "reset_device" => Some("*RST"),
                "self_test" => Some("*TST?"),
                _ => None,
            })
            .ok_or_else(|| LabError::Command(format!("unknown command '{command}'")))?;
        Self::format_template(template, args)
    }

    /// Parse a query response into the closest typed reply.
    fn parse_reply(response: &str) -> CommandReply {
        if let Ok(i) = response.parse::<i64>() {
            return CommandReply::Int(i);
        }
        if let Ok(f) = response.parse::<f64>() {
            return CommandReply::Float(f);
        }
        CommandReply::Str(response.to_string())
    }

    async fn handshake(&mut self) -> Result<(), LabError> {
        let identity = self
            .transport
            .query("*IDN?")
            .await
            .map_err(|e| LabError::Initialization(format!("*IDN? handshake failed: {e}")))?;
        if identity.is_empty() {
            return Err(LabError::Initialization(
                "device returned an empty identity".to_string(),
            ));
        }
        info!(identity = %identity, "scpi handshake complete");
        self.identity = Some(identity);
        Ok(())
    }
}

#[async_trait]
impl Driver for ScpiDriver {
    fn name(&self) -> &str {
        "scpi"
    }

    fn state(&self) -> DriverState {
        self.state
    }

    async fn initialize(&mut self) -> Result<(), LabError> {
        if self.state == DriverState::Ready {
            return Ok(());
        }
        self.transport.open().await?;
        if let Err(e) = self.handshake().await {
            self.last_error = Some(e.to_string());
            let _ = self.transport.close().await;
            return Err(e);
        }
        self.state = DriverState::Ready;
        Ok(())
    }

    async fn execute(&mut self, command: &str, args: &[ArgValue]) -> Result<CommandReply, LabError> {
        if self.state != DriverState::Ready {
            return Err(LabError::Unavailable(format!(
                "driver not ready (state {:?})",
                self.state
            )));
        }
        let line = self.resolve(command, args)?;
        debug!(command, line = %line, "executing scpi command");

        if line.trim_end().ends_with('?') {
            let response = match self.transport.query(&line).await {
                Ok(response) => response,
                Err(e) => {
                    self.last_error = Some(e.to_string());
                    self.state = DriverState::Fault;
                    return Err(e.into());
                }
            };
            // Device-side rejection convention: "ERR..." responses.
            if response.to_ascii_uppercase().starts_with("ERR") {
                warn!(command, response = %response, "device rejected command");
                return Err(LabError::Command(response));
            }
            Ok(Self::parse_reply(&response))
        } else {
            if let Err(e) = self.transport.send(&line).await {
                self.last_error = Some(e.to_string());
                self.state = DriverState::Fault;
                return Err(e.into());
            }
            Ok(CommandReply::None)
        }
    }

    async fn query_status(&mut self) -> Result<DriverStatus, LabError> {
        Ok(DriverStatus {
            state: self.state,
            identity: self.identity.clone(),
            last_error: self.last_error.clone(),
        })
    }

    async fn shutdown(&mut self) -> Result<(), LabError> {
        if self.state == DriverState::ShutDown {
            return Ok(());
        }
        self.transport.close().await?;
        self.state = DriverState::ShutDown;
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), LabError> {
        warn!("resetting scpi transport after link failure");
        self.transport.reset(self.reset_settle).await?;
        self.handshake().await?;
        self.state = DriverState::Ready;
        self.last_error = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockStep, MockTransport};

    fn laser_commands() -> HashMap<String, String> {
        let mut commands = HashMap::new();
        commands.insert("set_wavelength".to_string(), ":WAV {0}NM".to_string());
        commands.insert("get_wavelength".to_string(), ":WAV?".to_string());
        commands
    }

    fn laser_driver() -> (ScpiDriver, crate::transport::MockScript) {
        let transport = MockTransport::new();
        let script = transport.script();
        (
            ScpiDriver::new(
                Box::new(transport),
                laser_commands(),
                Duration::from_millis(1),
            ),
            script,
        )
    }

    #[tokio::test]
    async fn test_initialize_runs_handshake() {
        let (mut driver, _script) = laser_driver();
        assert_eq!(driver.state(), DriverState::Uninitialized);
        driver.initialize().await.unwrap();
        assert_eq!(driver.state(), DriverState::Ready);

        let status = driver.query_status().await.unwrap();
        assert_eq!(status.identity.as_deref(), Some("MOCK,LABHOST,0,1.0"));
    }

    #[tokio::test]
    async fn test_execute_write_and_query() {
        let (mut driver, script) = laser_driver();
        driver.initialize().await.unwrap();
        script.set_reply(":WAV?", "1550.0");

        let reply = driver
            .execute("set_wavelength", &[ArgValue::Float(1550.0)])
            .await
            .unwrap();
        assert_eq!(reply, CommandReply::None);

        let reply = driver.execute("get_wavelength", &[]).await.unwrap();
        assert_eq!(reply, CommandReply::Float(1550.0));

        assert!(script.sent().contains(&":WAV 1550NM".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_command_is_rejected_not_transport() {
        let (mut driver, _script) = laser_driver();
        driver.initialize().await.unwrap();
        let err = driver.execute("warp_drive", &[]).await.unwrap_err();
        assert!(matches!(err, LabError::Command(_)));
    }

    #[tokio::test]
    async fn test_device_error_response_maps_to_command_error() {
        let (mut driver, script) = laser_driver();
        driver.initialize().await.unwrap();
        script.push(MockStep::Reply("ERR:-222 data out of range".to_string()));

        let err = driver.execute("get_wavelength", &[]).await.unwrap_err();
        assert!(matches!(err, LabError::Command(_)));
        // A rejection is not a link fault; the driver stays ready.
        assert_eq!(driver.state(), DriverState::Ready);
    }

    #[tokio::test]
    async fn test_timeout_marks_fault_and_reconnect_recovers() {
        let (mut driver, script) = laser_driver();
        driver.initialize().await.unwrap();

        script.push(MockStep::Timeout);
        let err = driver.execute("get_wavelength", &[]).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(driver.state(), DriverState::Fault);

        driver.reconnect().await.unwrap();
        assert_eq!(driver.state(), DriverState::Ready);
        assert_eq!(script.open_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_template_argument() {
        let (mut driver, _script) = laser_driver();
        driver.initialize().await.unwrap();
        let err = driver.execute("set_wavelength", &[]).await.unwrap_err();
        assert!(matches!(err, LabError::Command(_)));
    }
}
