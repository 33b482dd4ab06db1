//! Mock driver for tests and dry runs.
//!
//! Keeps an in-memory parameter store and understands `set_*`/`get_*`
//! operations, so session and proxy tests can run the full acquire/execute
//! path without hardware. Fault injection goes through ordinary commands:
//! `trip_link` simulates a link failure and `arm_reconnect_failures` makes
//! the next N reconnect attempts fail, which is enough to drive the session
//! layer through its whole retry and draining machinery from the outside.

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::{ArgValue, CommandReply, Driver, DriverState, DriverStatus};
use crate::error::LabError;
use crate::transport::TransportError;

pub struct MockDriver {
    state: DriverState,
    params: HashMap<String, ArgValue>,
    link_down: bool,
    init_failures_remaining: u32,
    reconnect_failures_remaining: u32,
    last_error: Option<String>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            state: DriverState::Uninitialized,
            params: HashMap::new(),
            link_down: false,
            init_failures_remaining: 0,
            reconnect_failures_remaining: 0,
            last_error: None,
        }
    }

    /// Make the first `n` initialize() calls fail.
    pub fn with_init_failures(mut self, n: u32) -> Self {
        self.init_failures_remaining = n;
        self
    }

    fn link_error(&mut self) -> LabError {
        self.last_error = Some("link down".to_string());
        LabError::Transport(TransportError::NotConnected)
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    fn state(&self) -> DriverState {
        self.state
    }

    async fn initialize(&mut self) -> Result<(), LabError> {
        if self.init_failures_remaining > 0 {
            self.init_failures_remaining -= 1;
            return Err(LabError::Initialization(
                "mock handshake failure".to_string(),
            ));
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
        if self.link_down {
            self.state = DriverState::Fault;
            return Err(self.link_error());
        }

        // A real device takes a moment to answer.
        let jitter = rand::thread_rng().gen_range(0..2);
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        debug!(command, "mock driver executing");
        match command {
            "identify" => Ok(CommandReply::Str("MOCK-INSTRUMENT".to_string())),
            "trip_link" => {
                self.link_down = true;
                self.state = DriverState::Fault;
                Err(self.link_error())
            }
            "arm_reconnect_failures" => {
                let n = args
                    .first()
                    .and_then(|a| match a {
                        ArgValue::Int(i) => Some(*i as u32),
                        _ => None,
                    })
                    .ok_or_else(|| {
                        LabError::Command("arm_reconnect_failures expects an int".to_string())
                    })?;
                self.reconnect_failures_remaining = n;
                Ok(CommandReply::None)
            }
            set if set.starts_with("set_") => {
                let param = &set[4..];
                let value = args
                    .first()
                    .cloned()
                    .ok_or_else(|| LabError::Command(format!("{command} expects a value")))?;
                self.params.insert(param.to_string(), value);
                Ok(CommandReply::None)
            }
            get if get.starts_with("get_") => {
                let param = &get[4..];
                Ok(match self.params.get(param) {
                    Some(ArgValue::Bool(b)) => CommandReply::Bool(*b),
                    Some(ArgValue::Int(i)) => CommandReply::Int(*i),
                    Some(ArgValue::Float(f)) => CommandReply::Float(*f),
                    Some(ArgValue::Str(s)) => CommandReply::Str(s.clone()),
                    None => CommandReply::Float(0.0),
                })
            }
            other => Err(LabError::Command(format!("unknown command '{other}'"))),
        }
    }

    async fn query_status(&mut self) -> Result<DriverStatus, LabError> {
        Ok(DriverStatus {
            state: self.state,
            identity: Some("MOCK-INSTRUMENT".to_string()),
            last_error: self.last_error.clone(),
        })
    }

    async fn shutdown(&mut self) -> Result<(), LabError> {
        self.state = DriverState::ShutDown;
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), LabError> {
        if self.reconnect_failures_remaining > 0 {
            self.reconnect_failures_remaining -= 1;
            return Err(LabError::Transport(TransportError::ConnectionFailed(
                "mock reconnect failure".to_string(),
            )));
        }
        self.link_down = false;
        self.state = DriverState::Ready;
        self.last_error = None;
        Ok(())
    }
}
